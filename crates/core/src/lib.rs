//! Core domain types and build-graph logic for morph.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Morphology loading, validation and canonicalisation
//! - Build systems and their default phase commands
//! - Artifact split rules
//! - Source resolution against the external git cache
//! - The build-unit DAG and cache-key computation
//! - The scrubbed build environment
//! - Application configuration

pub mod buildenv;
pub mod buildsystem;
pub mod config;
pub mod error;
pub mod graph;
pub mod key;
pub mod morphology;
pub mod source;
pub mod splitrules;

pub use buildenv::BuildEnvironment;
pub use buildsystem::{BuildSystem, Phase};
pub use config::Config;
pub use error::{Error, Result};
pub use graph::{ArtifactKind, BuildGraph, BuildUnit, GraphBuilder};
pub use key::CacheKey;
pub use morphology::{
    BuildMode, ChunkMorphology, Morphology, MorphologyKind, MorphologyLoader, StratumMorphology,
    SystemMorphology,
};
pub use source::{GitRepoCache, ResolvedSource, SourceResolver, SubmodulePin};
pub use splitrules::{RuleSpec, SplitRules};

/// Default prefix chunks install into.
pub const DEFAULT_PREFIX: &str = "/usr";

/// Default prefix bootstrap chunks install into.
pub const DEFAULT_TOOLS_PREFIX: &str = "/tools";
