//! # Message API
//!
//! Request/response contracts consumed by UI collaborators and the
//! [`MessageHandler`] that dispatches them onto the [`ModeController`].
//!
//! Requests are tagged by `type` with the external names (`getState`,
//! `setMode`, `telemetry:get`, ...). Every failure is answered with
//! `{ok: false, error}` rather than surfaced as a transport error.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{FirewallError, Result, StoreError};
use crate::mode_controller::ModeController;
use crate::rule_bundle::CompiledRule;
use crate::rule_metadata::{Mode, RuleDefinition, RuleId};
use crate::store::KEY_TELEMETRY;
use crate::telemetry::{TelemetryAggregate, TelemetryEvent};

/// Description returned for ids this controller did not install
pub const FALLBACK_RULE_DESCRIPTION: &str = "Security rule";

pub const DEFAULT_TOP_LIMIT: usize = 10;

fn default_top_limit() -> usize {
    DEFAULT_TOP_LIMIT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// Inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "getState")]
    GetState,

    /// Mode is kept as text so an unknown value gets a readable error
    #[serde(rename = "setMode")]
    SetMode { mode: String },

    #[serde(rename = "setCustomRules")]
    SetCustomRules { rules: Vec<RuleDefinition> },

    #[serde(rename = "toggleEnabled")]
    ToggleEnabled,

    #[serde(rename = "telemetry:get")]
    TelemetryGet,

    #[serde(rename = "telemetry:clear")]
    TelemetryClear,

    #[serde(rename = "telemetry:top")]
    TelemetryTop {
        #[serde(default = "default_top_limit")]
        limit: usize,
    },

    #[serde(rename = "telemetry:export")]
    TelemetryExport {
        #[serde(default)]
        format: ExportFormat,
    },

    #[serde(rename = "getRuleDescription")]
    GetRuleDescription {
        #[serde(rename = "ruleId")]
        rule_id: RuleId,
    },

    // Diagnostics
    #[serde(rename = "listActiveRules")]
    ListActiveRules,

    #[serde(rename = "fullReset")]
    FullReset,

    #[serde(rename = "emergencyClear")]
    EmergencyClear,
}

/// Count keyed by domain or rule id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranked<K> {
    pub key: K,
    pub count: u64,
}

impl<K> From<(K, u64)> for Ranked<K> {
    fn from((key, count): (K, u64)) -> Self {
        Self { key, count }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopTelemetry {
    pub domains: Vec<Ranked<String>>,
    pub rules: Vec<Ranked<RuleId>>,
    /// Newest first
    pub recent: Vec<TelemetryEvent>,
}

/// Outbound message. Absent fields are omitted from the wire form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryAggregate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<TopTelemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<CompiledRule>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: Some(true),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: Some(false),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Dispatches [`Request`]s to the controller
#[derive(Clone)]
pub struct MessageHandler {
    controller: Arc<ModeController>,
}

impl MessageHandler {
    pub fn new(controller: Arc<ModeController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<ModeController> {
        &self.controller
    }

    /// Decode one JSON message, dispatch it and encode the reply
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Rejecting malformed message: {}", e);
                Response::error(format!("Malformed message: {}", e))
            }
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"Unencodable response: {}"}}"#, e))
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!("Handling {:?}", request);
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request failed: {}", e);
                Response::error(e.to_string())
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        let controller = &self.controller;
        let response = match request {
            Request::GetState => {
                let state = controller.get_state().await?;
                Response {
                    mode: Some(state.mode),
                    blocked_count: Some(state.blocked_count),
                    ..Response::default()
                }
            }
            Request::SetMode { mode } => {
                let mode: Mode = mode.parse().map_err(FirewallError::InvalidMode)?;
                controller.set_mode(mode).await?;
                Response::ok()
            }
            Request::SetCustomRules { rules } => {
                controller.apply_custom_rules(rules).await?;
                Response::ok()
            }
            Request::ToggleEnabled => {
                let enabled = controller.toggle_enabled().await?;
                Response {
                    enabled: Some(enabled),
                    ..Response::ok()
                }
            }
            Request::TelemetryGet => Response {
                telemetry: Some(controller.telemetry().await?),
                ..Response::ok()
            },
            Request::TelemetryClear => {
                controller.clear_telemetry().await?;
                Response::ok()
            }
            Request::TelemetryTop { limit } => {
                let telemetry = controller.telemetry().await?;
                let top = TopTelemetry {
                    domains: telemetry.top_domains(limit).into_iter().map(Ranked::from).collect(),
                    rules: telemetry.top_rules(limit).into_iter().map(Ranked::from).collect(),
                    recent: telemetry.recent(limit).into_iter().cloned().collect(),
                };
                Response {
                    top: Some(top),
                    ..Response::ok()
                }
            }
            Request::TelemetryExport { format } => {
                let telemetry = controller.telemetry().await?;
                let export = match format {
                    ExportFormat::Csv => telemetry.to_csv(),
                    ExportFormat::Json => serde_json::to_string_pretty(&telemetry).map_err(|e| StoreError::Decode {
                        key: KEY_TELEMETRY.to_string(),
                        reason: e.to_string(),
                    })?,
                };
                Response {
                    export: Some(export),
                    ..Response::ok()
                }
            }
            Request::GetRuleDescription { rule_id } => {
                let description = controller
                    .rule_description(rule_id)
                    .unwrap_or_else(|| FALLBACK_RULE_DESCRIPTION.to_string());
                Response {
                    description: Some(description),
                    ..Response::ok()
                }
            }
            Request::ListActiveRules => Response {
                rules: Some(controller.list_active_rules().await?),
                ..Response::ok()
            },
            Request::FullReset => {
                controller.full_reset().await?;
                Response::ok()
            }
            Request::EmergencyClear => {
                controller.emergency_clear().await?;
                Response::ok()
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::enforcement::RuleMatch;
    use crate::rule_bundle::PresetCatalog;
    use crate::rule_metadata::RuleCondition;
    use crate::store::StateStore;
    use crate::testing::FakeEngine;
    use serde_json::{json, Value};

    fn handler() -> (MessageHandler, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::default());
        let presets = PresetCatalog::new(
            vec![RuleDefinition::block(RuleCondition::regex("tracker")).with_description("Known trackers")],
            vec![],
        );
        let controller = ModeController::new(
            ControllerConfig::immediate(),
            StateStore::memory(),
            engine.clone(),
            presets,
        );
        (MessageHandler::new(Arc::new(controller)), engine)
    }

    async fn call(handler: &MessageHandler, message: Value) -> Value {
        let raw = handler.handle_json(&message.to_string()).await;
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn requests_use_external_names() {
        let request: Request = serde_json::from_value(json!({"type": "telemetry:top"})).unwrap();
        assert_eq!(request, Request::TelemetryTop { limit: DEFAULT_TOP_LIMIT });

        let request: Request = serde_json::from_value(json!({"type": "getRuleDescription", "ruleId": 42})).unwrap();
        assert_eq!(request, Request::GetRuleDescription { rule_id: RuleId::new(42) });

        let request: Request = serde_json::from_value(json!({
            "type": "setCustomRules",
            "rules": [{"condition": {"regexFilter": "ads"}}]
        }))
        .unwrap();
        assert!(matches!(request, Request::SetCustomRules { ref rules } if rules.len() == 1));
    }

    #[tokio::test]
    async fn get_state_reports_mode_and_count() {
        let (handler, _) = handler();
        let reply = call(&handler, json!({"type": "getState"})).await;
        assert_eq!(reply, json!({"mode": "balanced", "blockedCount": 0}));
    }

    #[tokio::test]
    async fn set_mode_accepts_known_modes_only() {
        let (handler, engine) = handler();
        let reply = call(&handler, json!({"type": "setMode", "mode": "off"})).await;
        assert_eq!(reply, json!({"ok": true}));
        assert!(engine.installed_ids().is_empty());

        let reply = call(&handler, json!({"type": "setMode", "mode": "strict"})).await;
        assert_eq!(reply["ok"], json!(false));
        assert!(reply["error"].as_str().unwrap().contains("strict"));
    }

    #[tokio::test]
    async fn malformed_message_gets_error_reply() {
        let (handler, _) = handler();
        let reply = handler.handle_json("{\"type\": \"launchRockets\"}").await;
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["ok"], json!(false));
    }

    #[tokio::test]
    async fn custom_rules_and_telemetry_round_trip() {
        let (handler, engine) = handler();
        let reply = call(
            &handler,
            json!({"type": "setCustomRules", "rules": [{"condition": {"regexFilter": "ads\\.example\\.com"}}]}),
        )
        .await;
        assert_eq!(reply, json!({"ok": true}));
        assert_eq!(engine.installed_ids().len(), 2);

        let custom = engine
            .installed()
            .into_iter()
            .find(|r| r.condition.regex_filter.as_deref() == Some("ads\\.example\\.com"))
            .unwrap();
        handler
            .controller()
            .on_match(RuleMatch::new("https://ads.example.com/x.js", Some(custom.id)))
            .await
            .unwrap();

        let reply = call(&handler, json!({"type": "telemetry:get"})).await;
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["telemetry"]["totalBlocked"], json!(1));
        assert_eq!(reply["telemetry"]["perDomain"]["ads.example.com"], json!(1));

        let reply = call(&handler, json!({"type": "telemetry:top", "limit": 1})).await;
        assert_eq!(reply["top"]["domains"][0], json!({"key": "ads.example.com", "count": 1}));

        let reply = call(&handler, json!({"type": "telemetry:export", "format": "csv"})).await;
        let csv = reply["export"].as_str().unwrap();
        assert!(csv.starts_with("\"ts\",\"time\",\"domain\""));
        assert_eq!(csv.lines().count(), 2);

        let reply = call(&handler, json!({"type": "telemetry:clear"})).await;
        assert_eq!(reply, json!({"ok": true}));
        let reply = call(&handler, json!({"type": "getState"})).await;
        assert_eq!(reply["blockedCount"], json!(0));
    }

    #[tokio::test]
    async fn rule_description_falls_back_for_unknown_ids() {
        let (handler, engine) = handler();
        call(&handler, json!({"type": "setMode", "mode": "balanced"})).await;
        let preset_id = engine.installed_ids()[0];

        let reply = call(&handler, json!({"type": "getRuleDescription", "ruleId": preset_id})).await;
        assert_eq!(reply["description"], json!("Known trackers"));

        let reply = call(&handler, json!({"type": "getRuleDescription", "ruleId": 3})).await;
        assert_eq!(reply["description"], json!(FALLBACK_RULE_DESCRIPTION));
    }

    #[tokio::test]
    async fn diagnostics_are_idempotent() {
        let (handler, engine) = handler();
        for _ in 0..2 {
            assert_eq!(call(&handler, json!({"type": "emergencyClear"})).await, json!({"ok": true}));
        }
        assert!(engine.installed_ids().is_empty());

        for _ in 0..2 {
            assert_eq!(call(&handler, json!({"type": "fullReset"})).await, json!({"ok": true}));
        }
        let reply = call(&handler, json!({"type": "listActiveRules"})).await;
        assert_eq!(reply["rules"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn toggle_reports_new_flag() {
        let (handler, _) = handler();
        let reply = call(&handler, json!({"type": "toggleEnabled"})).await;
        assert_eq!(reply, json!({"ok": true, "enabled": false}));
    }
}
