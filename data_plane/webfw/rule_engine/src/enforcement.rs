//! # Enforcement Engine Interface
//!
//! The request-matching subsystem that actually intercepts traffic is an
//! external collaborator. The lifecycle manager only needs to list the
//! identifiers it knows, install and remove dynamic rules, toggle the
//! static baseline bundle, and hear back when a rule decided a request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::rule_bundle::CompiledRule;
use crate::rule_metadata::{RuleAction, RuleId};

/// Operations the lifecycle manager drives on the enforcement engine
#[async_trait]
pub trait EnforcementEngine: Send + Sync {
    /// Identifiers declared by the static manifest
    async fn static_identifiers(&self) -> Result<HashSet<RuleId>, EngineError>;

    /// Dynamic rules currently installed
    async fn dynamic_rules(&self) -> Result<Vec<CompiledRule>, EngineError>;

    /// Install a batch of rules. All or nothing: a rejected batch leaves
    /// nothing installed.
    async fn install_rules(&self, rules: &[CompiledRule]) -> Result<(), EngineError>;

    /// Remove dynamic rules by id. Unknown ids are ignored.
    async fn remove_rules(&self, ids: &[RuleId]) -> Result<(), EngineError>;

    /// Enable or disable the static baseline bundle
    async fn set_baseline_enabled(&self, enabled: bool) -> Result<(), EngineError>;

    /// Every identifier the engine knows, static and dynamic
    async fn list_identifiers(&self) -> Result<HashSet<RuleId>, EngineError> {
        let mut ids = self.static_identifiers().await?;
        ids.extend(self.dynamic_rules().await?.into_iter().map(|r| r.id));
        Ok(ids)
    }

    /// Identifiers of the installed dynamic rules
    async fn dynamic_identifiers(&self) -> Result<Vec<RuleId>, EngineError> {
        Ok(self.dynamic_rules().await?.into_iter().map(|r| r.id).collect())
    }
}

/// "Rule X matched request Y" notification.
///
/// Every field but the URL may be missing, depending on what the engine
/// was able to attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub url: String,
    pub rule_id: Option<RuleId>,
    pub ruleset_id: Option<String>,
    pub resource_type: Option<String>,
    pub action: Option<RuleAction>,
    pub matched_at: DateTime<Utc>,
}

impl RuleMatch {
    pub fn new(url: impl Into<String>, rule_id: Option<RuleId>) -> Self {
        Self {
            url: url.into(),
            rule_id,
            ruleset_id: None,
            resource_type: None,
            action: None,
            matched_at: Utc::now(),
        }
    }

    pub fn with_ruleset(mut self, ruleset_id: impl Into<String>) -> Self {
        self.ruleset_id = Some(ruleset_id.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = Some(action);
        self
    }
}

pub type MatchSender = mpsc::UnboundedSender<RuleMatch>;
pub type MatchReceiver = mpsc::UnboundedReceiver<RuleMatch>;

/// Single-consumer queue carrying match notifications in arrival order
pub fn match_channel() -> (MatchSender, MatchReceiver) {
    mpsc::unbounded_channel()
}
