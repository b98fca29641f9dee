//! Error taxonomy for the rule lifecycle.
//!
//! Allocation and per-rule apply failures are recovered locally by the
//! allocator and controller; only a fully failed apply or a store failure
//! reaches the caller.

use thiserror::Error;

use crate::rule_metadata::RuleId;

/// Errors reported by an enforcement engine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("Rule id {0} is already in use")]
    IdCollision(RuleId),

    #[error("Rule {id} rejected: {reason}")]
    InvalidRule { id: RuleId, reason: String },

    #[error("Enforcement engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Whether retrying the same rule under a different id can succeed
    pub fn is_collision(&self) -> bool {
        matches!(self, EngineError::IdCollision(_))
    }
}

/// Errors reported by the durable key-value store
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Store read failed for '{key}': {reason}")]
    Read { key: String, reason: String },

    #[error("Store write failed for '{key}': {reason}")]
    Write { key: String, reason: String },

    #[error("Stored value for '{key}' is malformed: {reason}")]
    Decode { key: String, reason: String },
}

/// Top-level error for lifecycle operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FirewallError {
    #[error("No collision-free range of {count} rule ids found after {attempts} attempts")]
    AllocationExhausted { count: usize, attempts: usize },

    #[error("Rule apply rejected: {0}")]
    ApplyRejected(#[from] EngineError),

    #[error("None of the {attempted} compiled rules could be installed")]
    ApplyFailed { attempted: usize },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Failed to load presets: {0}")]
    PresetLoad(String),

    #[error("Invalid mode: {0}")]
    InvalidMode(String),
}

pub type Result<T> = std::result::Result<T, FirewallError>;
