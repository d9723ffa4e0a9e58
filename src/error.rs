//! Error kinds shared across the crate.
//!
//! Unschedulable pods are a normal simulation outcome and are reported in
//! `SimulateResult::unscheduled_pods`, never as an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimonError {
    /// Malformed YAML, unresolvable paths, or objects rejected by schema
    /// validation. Aborts before any simulation starts.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An object could not be created in the fake cluster store.
    #[error("seed conflict: {0}")]
    SeedConflict(String),

    /// A custom plugin violated one of its internal invariants.
    #[error("plugin internal error: {0}")]
    PluginInternal(String),

    /// Unreadable kubeconfig or cluster snapshot.
    #[error("environmental error: {0}")]
    Environmental(String),
}

impl From<std::io::Error> for SimonError {
    fn from(err: std::io::Error) -> Self {
        SimonError::InvalidInput(err.to_string())
    }
}

impl From<serde_yaml::Error> for SimonError {
    fn from(err: serde_yaml::Error) -> Self {
        SimonError::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for SimonError {
    fn from(err: serde_json::Error) -> Self {
        SimonError::InvalidInput(err.to_string())
    }
}
