//! Error types for median-infra.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InfraError>;

/// Errors raised while loading, composing, synthesizing or planning stacks.
#[derive(Error, Debug)]
pub enum InfraError {
    /// A file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A file or directory could not be written
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// YAML (config or lock file) parse or serialize error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// JSON (template, manifest, event) error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is structurally wrong
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Validation failed with the given number of findings
    #[error("{0} validation error(s)")]
    Validation(usize),

    /// CIDR parse or allocation error
    #[error("invalid CIDR '{cidr}': {reason}")]
    Cidr { cidr: String, reason: String },

    /// Two stacks share a name
    #[error("stack '{0}' is already declared")]
    DuplicateStack(String),

    /// A stack name does not exist in the app
    #[error("unknown stack '{0}'")]
    UnknownStack(String),

    /// Two resources in a stack share a logical id
    #[error("stack '{stack}' already declares '{logical_id}'")]
    DuplicateResource { stack: String, logical_id: String },

    /// A reference points at a resource that has not been declared
    #[error("stack '{consumer}' references '{logical_id}' which is not declared in '{producer}'")]
    DanglingReference {
        consumer: String,
        producer: String,
        logical_id: String,
    },

    /// The network handle has no subnets of the requested tier
    #[error("network '{network}' has no {tier} subnets{detail}")]
    MissingTier {
        network: String,
        tier: String,
        detail: String,
    },

    /// Stack or resource dependency graph is cyclic
    #[error("dependency cycle detected involving: {0}")]
    Cycle(String),

    /// Drift found in tripwire mode
    #[error("{0} drift finding(s)")]
    Drift(usize),
}

impl InfraError {
    /// Shorthand for [`InfraError::InvalidConfig`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
