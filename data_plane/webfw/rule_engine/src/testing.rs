//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::enforcement::EnforcementEngine;
use crate::error::{EngineError, StoreError};
use crate::store::{KeyValueStore, MemoryStore};
use crate::rule_bundle::CompiledRule;
use crate::rule_metadata::RuleId;

#[derive(Default)]
struct FakeState {
    static_ids: HashSet<RuleId>,
    foreign_ids: HashSet<RuleId>,
    dynamic: BTreeMap<RuleId, CompiledRule>,
    baseline_enabled: bool,
    fail_all_installs: bool,
    install_calls: usize,
}

/// Enforcement engine double.
///
/// Installs are atomic per batch. Ids registered through
/// [`FakeEngine::hide_foreign_id`] collide without ever being listed,
/// like rules owned by an allocator we cannot observe.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn with_static(ids: impl IntoIterator<Item = u32>) -> Self {
        let engine = Self::default();
        engine.state.lock().static_ids = ids.into_iter().map(RuleId::new).collect();
        engine
    }

    pub fn hide_foreign_id(&self, id: RuleId) {
        self.state.lock().foreign_ids.insert(id);
    }

    pub fn fail_all_installs(&self, fail: bool) {
        self.state.lock().fail_all_installs = fail;
    }

    /// Pretend stale rules survived a restart
    pub fn preload(&self, rules: Vec<CompiledRule>) {
        let mut state = self.state.lock();
        for rule in rules {
            state.dynamic.insert(rule.id, rule);
        }
    }

    pub fn installed_ids(&self) -> Vec<RuleId> {
        self.state.lock().dynamic.keys().copied().collect()
    }

    pub fn installed(&self) -> Vec<CompiledRule> {
        self.state.lock().dynamic.values().cloned().collect()
    }

    pub fn baseline_enabled(&self) -> bool {
        self.state.lock().baseline_enabled
    }

    pub fn install_calls(&self) -> usize {
        self.state.lock().install_calls
    }
}

#[async_trait]
impl EnforcementEngine for FakeEngine {
    async fn static_identifiers(&self) -> Result<HashSet<RuleId>, EngineError> {
        Ok(self.state.lock().static_ids.clone())
    }

    async fn dynamic_rules(&self) -> Result<Vec<CompiledRule>, EngineError> {
        Ok(self.installed())
    }

    async fn install_rules(&self, rules: &[CompiledRule]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.install_calls += 1;
        if state.fail_all_installs {
            return Err(EngineError::Unavailable("installs disabled".to_string()));
        }

        let mut batch = HashSet::new();
        for rule in rules {
            if state.static_ids.contains(&rule.id)
                || state.foreign_ids.contains(&rule.id)
                || state.dynamic.contains_key(&rule.id)
                || !batch.insert(rule.id)
            {
                return Err(EngineError::IdCollision(rule.id));
            }
            if let Some(pattern) = &rule.condition.regex_filter {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(EngineError::InvalidRule {
                        id: rule.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        for rule in rules {
            state.dynamic.insert(rule.id, rule.clone());
        }
        Ok(())
    }

    async fn remove_rules(&self, ids: &[RuleId]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for id in ids {
            state.dynamic.remove(id);
        }
        Ok(())
    }

    async fn set_baseline_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.state.lock().baseline_enabled = enabled;
        Ok(())
    }
}

/// Memory store whose reads and writes can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Read {
                key: key.to_string(),
                reason: "store offline".to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write {
                key: key.to_string(),
                reason: "store offline".to_string(),
            });
        }
        self.inner.set(key, value).await
    }
}
