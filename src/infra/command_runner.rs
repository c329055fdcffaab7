use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::app::ports::{InputLocation, TransformationRunner};
use crate::domain::{TransformKind, TransformSpec};
use crate::error::TransformError;

/// Program invocation for one kind of transformation. `{model}`, `{name}` and
/// `{output}` in arguments are replaced per run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Runs each transformation as its own child process, so concurrent
/// transformations never share an engine session.
///
/// The child sees `PIPELINE_TRANSFORM`, `PIPELINE_MODEL`, `PIPELINE_KIND`,
/// `PIPELINE_OUTPUT` and `PIPELINE_INPUTS` (a JSON object of input reference
/// to published location) and must write the candidate to `PIPELINE_OUTPUT`.
#[derive(Debug, Clone, Default)]
pub struct CommandTransformationRunner {
    commands: BTreeMap<TransformKind, CommandSpec>,
    working_dir: Option<PathBuf>,
}

impl CommandTransformationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, kind: TransformKind, command: CommandSpec) -> Self {
        self.commands.insert(kind, command);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

fn substitute(arg: &str, spec: &TransformSpec, output: &Path) -> String {
    arg.replace("{model}", &spec.model)
        .replace("{name}", &spec.name)
        .replace("{output}", &output.to_string_lossy())
}

#[async_trait]
impl TransformationRunner for CommandTransformationRunner {
    async fn run(
        &self,
        spec: &TransformSpec,
        inputs: &[InputLocation],
        output: &Path,
    ) -> Result<PathBuf, TransformError> {
        let command = self
            .commands
            .get(&spec.kind)
            .ok_or_else(|| TransformError::new(&spec.name, format!("no runner configured for {:?} transformations", spec.kind)))?;

        let inputs_json: BTreeMap<String, &str> = inputs
            .iter()
            .map(|i| (i.reference.to_string(), i.location.as_str()))
            .collect();
        let inputs_json = serde_json::to_string(&inputs_json).map_err(|e| TransformError::new(&spec.name, e))?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransformError::new(&spec.name, e))?;
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(command.args.iter().map(|a| substitute(a, spec, output)))
            .env("PIPELINE_TRANSFORM", &spec.name)
            .env("PIPELINE_MODEL", &spec.model)
            .env(
                "PIPELINE_KIND",
                match spec.kind {
                    TransformKind::Declarative => "declarative",
                    TransformKind::RuleBased => "rule_based",
                },
            )
            .env("PIPELINE_OUTPUT", output)
            .env("PIPELINE_INPUTS", inputs_json)
            .kill_on_drop(false);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(transform = %spec.name, program = %command.program, "Spawning transformation");
        let out = cmd
            .output()
            .await
            .map_err(|e| TransformError::new(&spec.name, format!("failed to spawn '{}': {e}", command.program)))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(TransformError::new(
                &spec.name,
                format!("runner exited with {}: {}", out.status, stderr.trim()),
            ));
        }
        if !output.exists() {
            return Err(TransformError::new(
                &spec.name,
                format!("runner succeeded but wrote nothing to {}", output.display()),
            ));
        }
        Ok(output.to_path_buf())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{InputRef, Tier};
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn child_receives_inputs_and_writes_output() {
        let dir = tempdir().unwrap();
        let runner = CommandTransformationRunner::new().with_command(
            TransformKind::Declarative,
            sh("printf '%s' \"$PIPELINE_INPUTS\" > \"$PIPELINE_OUTPUT\""),
        );
        let spec = TransformSpec::new("orders_clean", TransformKind::Declarative)
            .with_input(InputRef::new(Tier::Raw, "erp.orders"));
        let inputs = vec![InputLocation {
            reference: InputRef::new(Tier::Raw, "erp.orders"),
            location: "file:///lake/raw/erp/orders.ndjson".into(),
        }];
        let output = dir.path().join("out").join("orders_clean.ndjson");

        let produced = runner.run(&spec, &inputs, &output).await.unwrap();

        assert_eq!(produced, output);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            r#"{"raw:erp.orders":"file:///lake/raw/erp/orders.ndjson"}"#
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_transform_error() {
        let dir = tempdir().unwrap();
        let runner = CommandTransformationRunner::new()
            .with_command(TransformKind::RuleBased, sh("echo boom >&2; exit 3"));
        let spec = TransformSpec::new("metrics", TransformKind::RuleBased);

        let err = runner.run(&spec, &[], &dir.path().join("m.ndjson")).await.unwrap_err();
        assert_eq!(err.transform, "metrics");
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn missing_output_is_a_transform_error() {
        let dir = tempdir().unwrap();
        let runner = CommandTransformationRunner::new().with_command(TransformKind::Declarative, sh("true"));
        let spec = TransformSpec::new("noop", TransformKind::Declarative);

        let err = runner.run(&spec, &[], &dir.path().join("noop.ndjson")).await.unwrap_err();
        assert!(err.message.contains("wrote nothing"));
    }

    #[tokio::test]
    async fn unconfigured_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let spec = TransformSpec::new("x", TransformKind::RuleBased);
        assert!(CommandTransformationRunner::new()
            .run(&spec, &[], &dir.path().join("x.ndjson"))
            .await
            .is_err());
    }
}
