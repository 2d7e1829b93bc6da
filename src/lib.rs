//! spotctl library
//!
//! Replaces on-demand Auto Scaling Group members with compatible, cheaper
//! spot instances without ever violating the group's capacity contract.
//! All cross-invocation state lives in resource tags, so any cycle can be
//! killed and the next one resumes from a fresh scan.

pub mod aws;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod error;
pub mod group;
pub mod instance;
pub mod matcher;
pub mod pricing;
pub mod region;
pub mod retry;
pub mod schedule;
pub mod swap;

// Re-export commonly used types
pub use config::Config;
pub use decision::ReplacementIntent;
pub use error::{Result, SpotctlError};
