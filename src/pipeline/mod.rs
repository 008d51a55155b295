//! Pipeline definitions and their execution.
//!
//! - [`config`] - TOML pipeline files and parameter resolution
//! - [`plan`] - Resolved stage graph, phases and validation
//! - [`state`] - Pipeline state machine
//! - [`run`] - Orchestration of a full build

pub mod config;
pub mod paths;
pub mod plan;
pub mod run;
pub mod state;

pub use config::PipelineDefinition;
pub use plan::{Phase, StagePlan};
pub use run::{BuildOutcome, Pipeline, PipelineOptions};
pub use state::{PipelineState, PipelineTracker};
