//! Remote path templates: `{stage}`, `{source}` and `{table}` placeholders.

use crate::error::PublishError;

pub const DEFAULT_TEMPLATE: &str = "{stage}/{source}/{table}.ndjson";

const PLACEHOLDERS: [&str; 3] = ["stage", "source", "table"];

/// Split a template into literal and placeholder segments.
fn segments(template: &str) -> Result<Vec<Segment<'_>>, PublishError> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            out.push(Segment::Literal(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| PublishError::Placeholder(after.to_string()))?;
        let name = &after[..close];
        if !PLACEHOLDERS.contains(&name) {
            return Err(PublishError::Placeholder(name.to_string()));
        }
        out.push(Segment::Placeholder(name));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

pub fn validate(template: &str) -> Result<(), PublishError> {
    segments(template).map(|_| ())
}

pub fn render(template: &str, stage: &str, source: &str, table: &str) -> Result<String, PublishError> {
    let mut out = String::with_capacity(template.len() + stage.len() + source.len() + table.len());
    for segment in segments(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder("stage") => out.push_str(stage),
            Segment::Placeholder("source") => out.push_str(source),
            Segment::Placeholder(_) => out.push_str(table),
        }
    }
    Ok(out)
}
