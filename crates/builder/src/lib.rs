//! Staging assembly, builders and the local build plan executor.
//!
//! Given a resolved `BuildGraph` and a populated artifact cache, this
//! crate produces artifacts: the staging assembler composes a build root
//! from dependency artifacts, the builders run chunk phase commands and
//! assemble strata and systems, and the plan executor schedules the whole
//! DAG onto a bounded worker pool.

pub mod builder;
pub mod error;
pub mod executor;
pub mod staging;

pub use builder::{BuildOutcome, LocalBuilder, UnitBuilder};
pub use error::{BuildError, BuildResult};
pub use executor::{ExecReport, JobState, PlanExecutor};
pub use staging::StagingArea;
