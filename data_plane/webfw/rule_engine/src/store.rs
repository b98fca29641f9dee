//! # Persistent Store Adapter
//!
//! The durable key-value store is external; it only promises eventual
//! persistence and last-writer-wins semantics. `StateStore` layers typed
//! access and documented defaults on top of it.
//!
//! | key                    | type                | default    |
//! |------------------------|---------------------|------------|
//! | `mode`                 | `Mode`              | `balanced` |
//! | `enabled`              | bool                | `true`     |
//! | `customRules`          | `[RuleDefinition]`  | `[]`       |
//! | `blockedCount`         | u64                 | `0`        |
//! | `telemetry`            | `TelemetryAggregate`| absent     |
//! | `staticRulesetEnabled` | bool                | `true`     |

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::rule_metadata::{Mode, RuleDefinition};
use crate::telemetry::TelemetryAggregate;

pub const KEY_MODE: &str = "mode";
pub const KEY_ENABLED: &str = "enabled";
pub const KEY_CUSTOM_RULES: &str = "customRules";
pub const KEY_BLOCKED_COUNT: &str = "blockedCount";
pub const KEY_TELEMETRY: &str = "telemetry";
pub const KEY_STATIC_RULESET_ENABLED: &str = "staticRulesetEnabled";

/// External get/set service
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Process-local store, lost on restart unless shared
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.read().clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// Everything that must survive a process restart
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub mode: Mode,
    pub enabled: bool,
    pub custom_rules: Vec<RuleDefinition>,
    pub blocked_count: u64,
    pub telemetry: Option<TelemetryAggregate>,
    pub static_ruleset_enabled: bool,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            mode: Mode::Balanced,
            enabled: true,
            custom_rules: Vec::new(),
            blocked_count: 0,
            telemetry: None,
            static_ruleset_enabled: true,
        }
    }
}

/// Typed view over a [`KeyValueStore`]
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<dyn KeyValueStore>,
}

impl StateStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StoreError> {
        match self.inner.get(key).await? {
            None | Some(Value::Null) => Ok(default),
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.inner.set(key, value).await
    }

    pub async fn mode(&self) -> Result<Mode, StoreError> {
        self.get_or(KEY_MODE, Mode::Balanced).await
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<(), StoreError> {
        self.put(KEY_MODE, &mode).await
    }

    pub async fn enabled(&self) -> Result<bool, StoreError> {
        self.get_or(KEY_ENABLED, true).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.put(KEY_ENABLED, &enabled).await
    }

    pub async fn custom_rules(&self) -> Result<Vec<RuleDefinition>, StoreError> {
        self.get_or(KEY_CUSTOM_RULES, Vec::new()).await
    }

    pub async fn set_custom_rules(&self, rules: &[RuleDefinition]) -> Result<(), StoreError> {
        self.put(KEY_CUSTOM_RULES, rules).await
    }

    pub async fn blocked_count(&self) -> Result<u64, StoreError> {
        self.get_or(KEY_BLOCKED_COUNT, 0).await
    }

    pub async fn set_blocked_count(&self, count: u64) -> Result<(), StoreError> {
        self.put(KEY_BLOCKED_COUNT, &count).await
    }

    pub async fn telemetry(&self) -> Result<Option<TelemetryAggregate>, StoreError> {
        self.get_or(KEY_TELEMETRY, None).await
    }

    pub async fn set_telemetry(&self, telemetry: &TelemetryAggregate) -> Result<(), StoreError> {
        self.put(KEY_TELEMETRY, telemetry).await
    }

    pub async fn static_ruleset_enabled(&self) -> Result<bool, StoreError> {
        self.get_or(KEY_STATIC_RULESET_ENABLED, true).await
    }

    pub async fn set_static_ruleset_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.put(KEY_STATIC_RULESET_ENABLED, &enabled).await
    }

    /// Read every key, applying defaults for the missing ones
    pub async fn load(&self) -> Result<PersistedState, StoreError> {
        Ok(PersistedState {
            mode: self.mode().await?,
            enabled: self.enabled().await?,
            custom_rules: self.custom_rules().await?,
            blocked_count: self.blocked_count().await?,
            telemetry: self.telemetry().await?,
            static_ruleset_enabled: self.static_ruleset_enabled().await?,
        })
    }

    /// Overwrite the keys seeded on first install
    pub async fn seed_defaults(&self) -> Result<(), StoreError> {
        let defaults = PersistedState::default();
        self.set_mode(defaults.mode).await?;
        self.set_custom_rules(&defaults.custom_rules).await?;
        self.set_enabled(defaults.enabled).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_metadata::RuleCondition;
    use serde_json::json;

    #[tokio::test]
    async fn missing_keys_fall_back_to_defaults() {
        let store = StateStore::memory();
        assert_eq!(store.load().await.unwrap(), PersistedState::default());
    }

    #[tokio::test]
    async fn values_written_are_read_back() {
        let store = StateStore::memory();
        store.set_mode(Mode::Paranoid).await.unwrap();
        store.set_enabled(false).await.unwrap();
        store.set_blocked_count(42).await.unwrap();
        store
            .set_custom_rules(&[RuleDefinition::block(RuleCondition::regex("ads"))])
            .await
            .unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.mode, Mode::Paranoid);
        assert!(!state.enabled);
        assert_eq!(state.blocked_count, 42);
        assert_eq!(state.custom_rules.len(), 1);
    }

    #[tokio::test]
    async fn keys_use_external_names() {
        let raw = MemoryStore::new();
        let store = StateStore::new(Arc::new(raw.clone()));
        store.set_mode(Mode::Off).await.unwrap();
        store.set_static_ruleset_enabled(false).await.unwrap();

        let snapshot = raw.snapshot();
        assert_eq!(snapshot["mode"], json!("off"));
        assert_eq!(snapshot["staticRulesetEnabled"], json!(false));
    }

    #[tokio::test]
    async fn custom_rules_keep_unlisted_resource_types() {
        let raw = MemoryStore::new();
        let store = StateStore::new(Arc::new(raw.clone()));
        let rules: Vec<RuleDefinition> = serde_json::from_value(json!([
            {"condition": {"regexFilter": "report", "resourceTypes": ["csp_report"]}}
        ]))
        .unwrap();
        store.set_custom_rules(&rules).await.unwrap();

        assert_eq!(
            raw.snapshot()["customRules"][0]["condition"]["resourceTypes"],
            json!(["csp_report"])
        );
        assert_eq!(store.custom_rules().await.unwrap(), rules);
    }

    #[tokio::test]
    async fn malformed_value_is_reported() {
        let raw = MemoryStore::new();
        raw.set(KEY_MODE, json!("strict")).await.unwrap();
        let store = StateStore::new(Arc::new(raw));
        assert!(matches!(store.mode().await, Err(StoreError::Decode { .. })));
    }
}
