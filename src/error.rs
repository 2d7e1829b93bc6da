//! Error types for spotctl
//!
//! This module defines the error handling strategy for spotctl. There are two
//! error types: `SpotctlError` (main error enum) and `ConfigError`
//! (configuration-specific).
//!
//! ## Error Handling Philosophy
//!
//! Library code uses `crate::error::Result<T>` which returns `SpotctlError`.
//! CLI code uses `anyhow::Result<T>` for top-level error handling. The
//! conversion happens at the CLI boundary using `anyhow::Error::from` to
//! preserve error chains.
//!
//! ## Taxonomy
//!
//! - `CloudApi`: transient control-plane failures (throttling, timeouts,
//!   eventual-consistency hiccups). Logged by the caller that owns the cycle
//!   scope and abandoned; the next cycle rediscovers pending work from tags.
//! - `NoCandidate` / `NoDonor`: expected decision outcomes, not faults. The
//!   decision layer maps them to "no action" instead of propagating them.
//! - `SwapAborted`: a swap step failed after its compensations ran (orphaned
//!   candidate terminated, donor re-attached, max size restored). Surfaced so
//!   the cycle reports a failed replacement.
//! - `Dataset` / `RegionEnumeration`: fatal, abort the whole cycle. A partial
//!   inconsistent pass is never allowed to proceed.

use thiserror::Error;

/// Main error type for spotctl
#[derive(Error, Debug)]
pub enum SpotctlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cloud API error during {operation}: {message}")]
    CloudApi {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No compatible spot instance type found for {instance_type} in {zone}")]
    NoCandidate { instance_type: String, zone: String },

    #[error("No replaceable on-demand instance found in group {group}")]
    NoDonor { group: String },

    #[error("Swap aborted for group {group}: {reason}")]
    SwapAborted { group: String, reason: String },

    #[error("Failed to load instance type dataset: {0}")]
    Dataset(String),

    #[error("Failed to enumerate regions: {0}")]
    RegionEnumeration(String),

    #[error("Spot request {request_id} not fulfilled: {reason}")]
    SpotRequestFailed { request_id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpotctlError {
    /// Shorthand for wrapping an SDK failure with the operation name.
    pub fn cloud<E>(operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SpotctlError::CloudApi {
            operation: operation.to_string(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Cloud failure carrying only a message, for waiters and composed calls.
    pub fn cloud_msg(operation: &str, message: impl Into<String>) -> Self {
        SpotctlError::CloudApi {
            operation: operation.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Expected decision outcomes are not faults and must not be logged as
    /// errors or bubble past the decision layer.
    pub fn is_quiet_outcome(&self) -> bool {
        matches!(
            self,
            SpotctlError::NoCandidate { .. } | SpotctlError::NoDonor { .. }
        )
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SpotctlError>;

/// Trait for determining if an error is worth retrying within the same cycle.
///
/// Only tagging and fulfillment waits retry in-process; everything else
/// relies on next-cycle re-entrancy via tags.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for SpotctlError {
    fn is_retryable(&self) -> bool {
        matches!(self, SpotctlError::CloudApi { .. } | SpotctlError::Io(_))
    }
}
