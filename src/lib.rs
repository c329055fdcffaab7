pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod dataset;
pub mod error;
pub mod policy;
pub mod quality;
pub mod watermark;

// Layered boundaries: ports in app, adapters in infra
pub mod app;
pub mod infra;

// Data shapes shared across layers
pub mod domain;

pub mod observability;
pub mod pipeline;
