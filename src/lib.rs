//! Assembly of sandboxed runtime root filesystems from declarative
//! multi-stage pipelines.
//!
//! A pipeline file declares build stages (a pinned git source plus compile
//! commands), runtime stages (a tree extracted from a base image), the
//! artifacts to copy into the target, interpreter path rewrites, packages to
//! install into the result and the metadata labels to attach.
//!
//! ```text
//! fetch ─► compile ─┐
//!                   ├─► merge ─► rewrite ─► install ─► labels ─► publish
//! extract ──────────┘
//! ```
//!
//! Producers run concurrently in private staging directories; consumers run
//! in order on a partial target that replaces the real one only on success.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sandbox_assembler::pipeline::{Pipeline, PipelineDefinition, PipelineOptions};
//! use sandbox_assembler::process::SystemRunner;
//!
//! let definition = PipelineDefinition::load("sandbox.toml".as_ref())?;
//! let params = definition.default_params();
//! let outcome = Pipeline::new(definition, params, Arc::new(SystemRunner), PipelineOptions::new("/var/cache/sandbox"))
//!     .run()
//!     .await?;
//! println!("{}", outcome.target.display());
//! ```

pub mod artifact;
pub mod cancel;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod stage_runs;
pub mod stages;
pub mod workspace;

pub use cancel::CancelToken;
pub use error::{AssemblyError, Result, RewriteWarning};
pub use params::BuildParams;
pub use pipeline::{BuildOutcome, Phase, Pipeline, PipelineDefinition, PipelineOptions};
pub use process::{CommandRunner, SystemRunner};
pub use workspace::Workspace;
