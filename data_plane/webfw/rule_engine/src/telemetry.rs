//! # Telemetry Recorder
//!
//! Local-only record of blocked requests: a capacity-bounded ring buffer of
//! events plus running per-rule, per-domain and total counters. The whole
//! aggregate is persisted after every mutation so counters survive restarts.

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::enforcement::RuleMatch;
use crate::error::Result;
use crate::rule_metadata::{RuleAction, RuleId};
use crate::store::StateStore;

/// Ruleset attribution used when the engine did not report one
pub const DEFAULT_RULESET_ID: &str = "dynamic/static";

/// One blocked (or allowed) request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub url: String,
    pub domain: String,
    pub rule_id: Option<RuleId>,
    pub ruleset_id: String,
    pub resource_type: Option<String>,
    pub action: RuleAction,
}

impl TelemetryEvent {
    pub fn from_match(notification: &RuleMatch) -> Self {
        Self {
            ts: notification.matched_at,
            url: notification.url.clone(),
            domain: domain_of(&notification.url),
            rule_id: notification.rule_id,
            ruleset_id: notification
                .ruleset_id
                .clone()
                .unwrap_or_else(|| DEFAULT_RULESET_ID.to_string()),
            resource_type: notification.resource_type.clone(),
            action: notification.action.unwrap_or(RuleAction::Block),
        }
    }
}

/// Host part of `url`, or an empty string when it has none
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Ring buffer plus incrementally maintained counters.
///
/// `total_blocked` counts every recorded event, while `per_rule` only
/// counts events that carried a rule id, so the two may diverge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryAggregate {
    pub events: VecDeque<TelemetryEvent>,
    pub per_rule: BTreeMap<RuleId, u64>,
    pub per_domain: BTreeMap<String, u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_reset: DateTime<Utc>,
    pub total_blocked: u64,
}

impl TelemetryAggregate {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            events: VecDeque::new(),
            per_rule: BTreeMap::new(),
            per_domain: BTreeMap::new(),
            last_reset: now,
            total_blocked: 0,
        }
    }

    /// Append an event, evicting the oldest when at `capacity`
    pub fn push(&mut self, event: TelemetryEvent, capacity: usize) {
        while self.events.len() >= capacity.max(1) {
            self.events.pop_front();
        }

        if let Some(rule_id) = event.rule_id {
            *self.per_rule.entry(rule_id).or_insert(0) += 1;
        }
        *self.per_domain.entry(event.domain.clone()).or_insert(0) += 1;
        self.total_blocked += 1;
        self.events.push_back(event);
    }

    /// Most blocked domains, highest count first
    pub fn top_domains(&self, limit: usize) -> Vec<(String, u64)> {
        top_n(self.per_domain.iter().map(|(d, c)| (d.clone(), *c)), limit)
    }

    /// Most triggered rules, highest count first
    pub fn top_rules(&self, limit: usize) -> Vec<(RuleId, u64)> {
        top_n(self.per_rule.iter().map(|(r, c)| (*r, *c)), limit)
    }

    /// Latest events, newest first
    pub fn recent(&self, limit: usize) -> Vec<&TelemetryEvent> {
        self.events.iter().rev().take(limit).collect()
    }

    /// Events as CSV, every field quoted
    pub fn to_csv(&self) -> String {
        let mut out = String::from("\"ts\",\"time\",\"domain\",\"ruleId\",\"rulesetId\",\"action\",\"url\"");
        for ev in &self.events {
            let row = [
                ev.ts.timestamp_millis().to_string(),
                ev.ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                ev.domain.clone(),
                ev.rule_id.map(|id| id.to_string()).unwrap_or_default(),
                ev.ruleset_id.clone(),
                ev.action.to_string(),
                ev.url.clone(),
            ];
            out.push('\n');
            out.push_str(
                &row.iter()
                    .map(|v| format!("\"{}\"", v.replace('"', "\"\"")))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        out
    }
}

fn top_n<K: Ord>(entries: impl Iterator<Item = (K, u64)>, limit: usize) -> Vec<(K, u64)> {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

/// Records match events and keeps the persisted aggregate current
pub struct TelemetryRecorder {
    store: StateStore,
    capacity: usize,
    cache: Mutex<Option<TelemetryAggregate>>,
}

impl TelemetryRecorder {
    pub fn new(store: StateStore, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            cache: Mutex::new(None),
        }
    }

    /// Current aggregate; seeds an empty one in the store on first use
    pub async fn get(&self) -> Result<TelemetryAggregate> {
        let cached = self.cache.lock().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let aggregate = match self.store.telemetry().await? {
            Some(stored) => stored,
            None => {
                let fresh = TelemetryAggregate::new(Utc::now());
                self.store.set_telemetry(&fresh).await?;
                fresh
            }
        };
        *self.cache.lock() = Some(aggregate.clone());
        Ok(aggregate)
    }

    /// Append one event and persist the updated aggregate.
    ///
    /// The cached aggregate only advances once the store accepted it.
    pub async fn record(&self, event: TelemetryEvent) -> Result<TelemetryAggregate> {
        let mut aggregate = self.get().await?;
        debug!("Recording telemetry for {} (rule {:?})", event.domain, event.rule_id);
        aggregate.push(event, self.capacity);

        self.store.set_telemetry(&aggregate).await?;
        *self.cache.lock() = Some(aggregate.clone());
        Ok(aggregate)
    }

    /// Drop all events and counters, restarting the reset clock
    pub async fn clear(&self) -> Result<TelemetryAggregate> {
        let fresh = TelemetryAggregate::new(Utc::now());
        self.store.set_telemetry(&fresh).await?;
        *self.cache.lock() = Some(fresh.clone());
        Ok(fresh)
    }
}
