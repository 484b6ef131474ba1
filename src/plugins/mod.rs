//! Plugin pipeline: symmetric pre/post interceptors with short-circuit
//! and reverse-unwind semantics.

mod base;
mod pipeline;

pub use base::{Plugin, PluginContext, PreOutcome};
pub use pipeline::{PluginPipeline, PreResult};
