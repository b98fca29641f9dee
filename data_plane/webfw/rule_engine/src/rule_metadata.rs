// Core vocabulary for firewall rules
//
// This module defines the identity and shape of every rule handled by the
// lifecycle manager: the numeric identifier shared with the enforcement
// engine, the protection mode, and the declarative rule definition that
// presets and user-supplied custom rules are both expressed in.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifier of an installed rule.
///
/// The namespace is shared with the enforcement engine: the lowest band is
/// owned by its static manifest, everything above is handed out by the
/// identifier allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(u32);

impl RuleId {
    pub fn new(id: u32) -> Self {
        RuleId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for RuleId {
    fn from(id: u32) -> Self {
        RuleId(id)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Active protection tier.
///
/// Exactly one mode is current at any time. `Off` installs nothing and
/// disables the static baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Off,
    #[default]
    Balanced,
    Paranoid,
}

impl Mode {
    /// Whether this mode installs any rules at all
    pub fn is_active(&self) -> bool {
        !matches!(self, Mode::Off)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Balanced => "balanced",
            Mode::Paranoid => "paranoid",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Mode::Off),
            "balanced" => Ok(Mode::Balanced),
            "paranoid" => Ok(Mode::Paranoid),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// What the enforcement engine does with a matching request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    #[default]
    Block,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Block => "block",
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of resource a request loads.
///
/// Names the enum does not know are carried through verbatim, so a custom
/// rule filters on exactly the types its author wrote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Font,
    Object,
    Xmlhttprequest,
    Ping,
    Media,
    Websocket,
    Other(String),
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::MainFrame => "main_frame",
            ResourceType::SubFrame => "sub_frame",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Script => "script",
            ResourceType::Image => "image",
            ResourceType::Font => "font",
            ResourceType::Object => "object",
            ResourceType::Xmlhttprequest => "xmlhttprequest",
            ResourceType::Ping => "ping",
            ResourceType::Media => "media",
            ResourceType::Websocket => "websocket",
            ResourceType::Other(name) => name,
        }
    }
}

impl From<String> for ResourceType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "main_frame" => ResourceType::MainFrame,
            "sub_frame" => ResourceType::SubFrame,
            "stylesheet" => ResourceType::Stylesheet,
            "script" => ResourceType::Script,
            "image" => ResourceType::Image,
            "font" => ResourceType::Font,
            "object" => ResourceType::Object,
            "xmlhttprequest" => ResourceType::Xmlhttprequest,
            "ping" => ResourceType::Ping,
            "media" => ResourceType::Media,
            "websocket" => ResourceType::Websocket,
            _ => ResourceType::Other(name),
        }
    }
}

impl From<ResourceType> for String {
    fn from(resource_type: ResourceType) -> Self {
        match resource_type {
            ResourceType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-matching condition of a rule.
///
/// Only the fields the lifecycle manager needs to reason about are typed;
/// matching itself is the enforcement engine's business.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
}

impl RuleCondition {
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            regex_filter: Some(pattern.into()),
            resource_types: Vec::new(),
        }
    }

    /// A condition with no filter at all would match every request
    pub fn is_empty(&self) -> bool {
        self.regex_filter.as_deref().map_or(true, str::is_empty) && self.resource_types.is_empty()
    }
}

/// Declarative rule as authored by a preset bundle or by the user.
///
/// Custom rules arrive in this shape over the message API, e.g.
/// `{"type": "block", "condition": {"regexFilter": "ads\\.example\\.com"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(rename = "type", default)]
    pub action: RuleAction,
    #[serde(default)]
    pub condition: RuleCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RuleDefinition {
    pub fn block(condition: RuleCondition) -> Self {
        Self {
            action: RuleAction::Block,
            condition,
            priority: None,
            description: None,
        }
    }

    pub fn allow(condition: RuleCondition) -> Self {
        Self {
            action: RuleAction::Allow,
            ..Self::block(condition)
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Which bundle a compiled rule was drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Balanced,
    Paranoid,
    Custom,
}

impl RuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSource::Balanced => "balanced",
            RuleSource::Paranoid => "paranoid",
            RuleSource::Custom => "custom",
        }
    }
}
