//! # Local Enforcement Engine
//!
//! In-process stand-in for the request-matching engine:
//! 1. Holds a static manifest occupying the low identifier band; the
//!    manifest can be switched on and off but never edited
//! 2. Holds dynamic rules installed by the controller; installs are atomic
//!    per batch and reject colliding ids and uncompilable patterns
//! 3. Evaluates request URLs against both sets, highest priority first, and
//!    emits one match notification per decided request

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};

use rule_engine::{
    ActionSpec, CompiledRule, EnforcementEngine, EngineError, MatchSender, ResourceType, RuleAction,
    RuleCondition, RuleId, RuleMatch, RuleSource,
};

pub const STATIC_RULESET_ID: &str = "static";
pub const DYNAMIC_RULESET_ID: &str = "_dynamic";

// ============================================================================
// Static manifest
// ============================================================================

/// Rules shipped with the engine, addressed by ids `1..=len`
#[derive(Debug, Clone, Default)]
pub struct StaticManifest {
    rules: Vec<CompiledRule>,
}

impl StaticManifest {
    pub fn new(rules: Vec<CompiledRule>) -> Self {
        Self { rules }
    }

    /// `count` reserved ids with no condition; they occupy the band but
    /// never match
    pub fn reserved(count: u32) -> Self {
        let rules = (1..=count)
            .map(|id| CompiledRule {
                id: RuleId::new(id),
                priority: 1,
                action: ActionSpec {
                    kind: RuleAction::Block,
                },
                condition: RuleCondition::default(),
                source: RuleSource::Balanced,
                description: None,
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Rule plus its compiled pattern
#[derive(Debug, Clone)]
struct ActiveRule {
    rule: CompiledRule,
    pattern: Option<Regex>,
}

impl ActiveRule {
    fn compile(rule: &CompiledRule) -> Result<Self, EngineError> {
        let pattern = match rule.condition.regex_filter.as_deref() {
            Some(raw) if !raw.is_empty() => Some(Regex::new(raw).map_err(|e| EngineError::InvalidRule {
                id: rule.id,
                reason: e.to_string(),
            })?),
            _ => None,
        };
        Ok(Self {
            rule: rule.clone(),
            pattern,
        })
    }

    fn matches(&self, url: &str, resource_type: Option<&ResourceType>) -> bool {
        if self.rule.condition.is_empty() {
            return false;
        }
        let types = &self.rule.condition.resource_types;
        let type_ok = types.is_empty() || resource_type.map_or(false, |rt| types.contains(rt));
        let url_ok = self.pattern.as_ref().map_or(true, |p| p.is_match(url));
        type_ok && url_ok
    }
}

struct EngineState {
    static_rules: Vec<ActiveRule>,
    dynamic: BTreeMap<RuleId, ActiveRule>,
    baseline_enabled: bool,
}

pub struct LocalEngine {
    state: RwLock<EngineState>,
    matches: Option<MatchSender>,
}

impl LocalEngine {
    pub fn new(manifest: StaticManifest, matches: Option<MatchSender>) -> Result<Self, EngineError> {
        let static_rules = manifest
            .rules
            .iter()
            .map(ActiveRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        info!("Local engine loaded {} static rules", static_rules.len());

        Ok(Self {
            state: RwLock::new(EngineState {
                static_rules,
                dynamic: BTreeMap::new(),
                baseline_enabled: true,
            }),
            matches,
        })
    }

    pub fn baseline_enabled(&self) -> bool {
        self.state.read().baseline_enabled
    }

    pub fn dynamic_count(&self) -> usize {
        self.state.read().dynamic.len()
    }

    /// Decide a request; a match is also sent on the notification queue.
    ///
    /// Dynamic rules are consulted before the static manifest; within each
    /// set the highest priority wins, then the lowest id.
    pub fn evaluate(&self, url: &str, resource_type: Option<ResourceType>) -> Option<RuleMatch> {
        let decided = {
            let state = self.state.read();
            let dynamic = best_match(state.dynamic.values(), url, resource_type.as_ref())
                .map(|rule| (rule.rule.clone(), DYNAMIC_RULESET_ID));
            dynamic.or_else(|| {
                if !state.baseline_enabled {
                    return None;
                }
                best_match(state.static_rules.iter(), url, resource_type.as_ref())
                    .map(|rule| (rule.rule.clone(), STATIC_RULESET_ID))
            })
        };

        let (rule, ruleset) = decided?;
        let mut notification = RuleMatch::new(url, Some(rule.id))
            .with_ruleset(ruleset)
            .with_action(rule.action.kind);
        if let Some(rt) = &resource_type {
            notification = notification.with_resource_type(rt.as_str());
        }

        debug!("Request {} decided by rule {} ({})", url, rule.id, ruleset);
        if let Some(sender) = &self.matches {
            if sender.send(notification.clone()).is_err() {
                debug!("Match queue closed; notification for {} dropped", url);
            }
        }
        Some(notification)
    }
}

fn best_match<'a>(
    rules: impl Iterator<Item = &'a ActiveRule>,
    url: &str,
    resource_type: Option<&ResourceType>,
) -> Option<&'a ActiveRule> {
    rules
        .filter(|rule| rule.matches(url, resource_type))
        .min_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then_with(|| a.rule.id.cmp(&b.rule.id))
        })
}

#[async_trait]
impl EnforcementEngine for LocalEngine {
    async fn static_identifiers(&self) -> Result<HashSet<RuleId>, EngineError> {
        Ok(self.state.read().static_rules.iter().map(|r| r.rule.id).collect())
    }

    async fn dynamic_rules(&self) -> Result<Vec<CompiledRule>, EngineError> {
        Ok(self.state.read().dynamic.values().map(|r| r.rule.clone()).collect())
    }

    async fn install_rules(&self, rules: &[CompiledRule]) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let static_ids: HashSet<RuleId> = state.static_rules.iter().map(|r| r.rule.id).collect();

        let mut staged = HashMap::with_capacity(rules.len());
        for rule in rules {
            if static_ids.contains(&rule.id) || state.dynamic.contains_key(&rule.id) || staged.contains_key(&rule.id) {
                return Err(EngineError::IdCollision(rule.id));
            }
            staged.insert(rule.id, ActiveRule::compile(rule)?);
        }

        debug!("Installing {} dynamic rules", staged.len());
        state.dynamic.extend(staged);
        Ok(())
    }

    async fn remove_rules(&self, ids: &[RuleId]) -> Result<(), EngineError> {
        let mut state = self.state.write();
        for id in ids {
            state.dynamic.remove(id);
        }
        Ok(())
    }

    async fn set_baseline_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.state.write().baseline_enabled = enabled;
        Ok(())
    }
}
