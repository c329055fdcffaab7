//! Reference adapters for the collaborator ports.

pub mod command_runner;
pub mod dedup;
pub mod object_store;

pub use command_runner::{CommandSpec, CommandTransformationRunner};
pub use dedup::ExactMatchDedup;
pub use object_store::LocalObjectStore;
