// Preset bundles, rule validation and compilation
//
// This module provides:
// 1. The immutable preset catalog ("balanced" and "paranoid" bundles)
// 2. JSON parsing of the bundled catalog
// 3. Validation of preset and custom rule definitions
// 4. The rule compiler turning (mode, presets, custom rules) into an ordered
//    list of pending rules, ready for identifier assignment

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::FirewallError;
use crate::rule_metadata::{
    Mode, ResourceType, RuleAction, RuleCondition, RuleDefinition, RuleId, RuleSource,
};

/// Catalog shipped with the firewall
const BUNDLED_PRESETS: &str = include_str!("../rules/presets.json");

/// Priority given to preset rules and to custom rules that omit one
pub const DEFAULT_PRIORITY: u32 = 1;

/// Highest priority a rule may carry
pub const MAX_PRIORITY: u32 = 10_000;

// ============================================================================
// Preset catalog
// ============================================================================

/// Flat preset record as stored in the bundled catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresetEntry {
    #[serde(rename = "type", default)]
    action: RuleAction,
    regex_filter: Option<String>,
    #[serde(default)]
    resource_types: Vec<ResourceType>,
    description: Option<String>,
}

impl From<PresetEntry> for RuleDefinition {
    fn from(entry: PresetEntry) -> Self {
        RuleDefinition {
            action: entry.action,
            condition: RuleCondition {
                regex_filter: entry.regex_filter,
                resource_types: entry.resource_types,
            },
            priority: Some(DEFAULT_PRIORITY),
            description: entry.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PresetFile {
    #[serde(default)]
    balanced: Vec<PresetEntry>,
    #[serde(default)]
    paranoid: Vec<PresetEntry>,
}

/// Immutable preset bundles
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    balanced: Vec<RuleDefinition>,
    paranoid: Vec<RuleDefinition>,
    digest: String,
}

impl PresetCatalog {
    pub fn new(balanced: Vec<RuleDefinition>, paranoid: Vec<RuleDefinition>) -> Self {
        let digest = match serde_json::to_vec(&(&balanced, &paranoid)) {
            Ok(bytes) => hex_digest(&bytes),
            Err(_) => String::new(),
        };
        Self {
            balanced,
            paranoid,
            digest,
        }
    }

    /// Catalog compiled into the binary
    pub fn bundled() -> Result<Self, ParseError> {
        BundleParser::from_json(BUNDLED_PRESETS)
    }

    /// Catalog from `path` when given, else the bundled one
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, FirewallError> {
        let parsed = match path {
            Some(path) => BundleParser::from_path(path),
            None => Self::bundled(),
        };
        parsed.map_err(|e| FirewallError::PresetLoad(e.to_string()))
    }

    /// Catalog with no rules, for tests and tooling
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn balanced(&self) -> &[RuleDefinition] {
        &self.balanced
    }

    pub fn paranoid(&self) -> &[RuleDefinition] {
        &self.paranoid
    }

    /// SHA-256 of the catalog source, hex encoded
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.balanced.len() + self.paranoid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Parser for the preset catalog
pub struct BundleParser;

impl BundleParser {
    /// Parse a catalog from its JSON source
    pub fn from_json(json: &str) -> Result<PresetCatalog, ParseError> {
        let file: PresetFile =
            serde_json::from_str(json).map_err(|e| ParseError::JsonParseError(e.to_string()))?;

        let catalog = PresetCatalog {
            balanced: file.balanced.into_iter().map(RuleDefinition::from).collect(),
            paranoid: file.paranoid.into_iter().map(RuleDefinition::from).collect(),
            digest: hex_digest(json.as_bytes()),
        };

        let result = BundleValidator::new().validate_presets(&catalog);
        if let Some(error) = result.errors.into_iter().next() {
            return Err(ParseError::InvalidFormat(error.to_string()));
        }
        Ok(catalog)
    }

    /// Parse a catalog from a file on disk
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<PresetCatalog, ParseError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ParseError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

/// Parse Errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(String),
}

// ============================================================================
// Validation
// ============================================================================

/// Validation result with detailed errors
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validation error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Rule {index} in {bundle} has an empty condition")]
    EmptyCondition { bundle: &'static str, index: usize },

    #[error("Rule {index} in {bundle} has an invalid regex: {reason}")]
    InvalidRegex {
        bundle: &'static str,
        index: usize,
        reason: String,
    },

    #[error("Rule {index} in {bundle} has priority {priority} outside 1..={max}")]
    InvalidPriority {
        bundle: &'static str,
        index: usize,
        priority: u32,
        max: u32,
    },
}

/// Checks rule definitions before they reach the enforcement engine.
///
/// Presets are held to the full standard. Custom rules are only
/// warned about: the engine is the final judge and the apply fallback
/// drops whatever it rejects.
pub struct BundleValidator {
    max_priority: u32,
}

impl BundleValidator {
    pub fn new() -> Self {
        Self {
            max_priority: MAX_PRIORITY,
        }
    }

    pub fn validate_presets(&self, catalog: &PresetCatalog) -> ValidationResult {
        let mut result = ValidationResult::default();
        self.check_rules("balanced", &catalog.balanced, &mut result.errors);
        self.check_rules("paranoid", &catalog.paranoid, &mut result.errors);
        result
    }

    pub fn validate_custom(&self, rules: &[RuleDefinition]) -> ValidationResult {
        let mut result = ValidationResult::default();
        self.check_rules("custom", rules, &mut result.warnings);
        result
    }

    fn check_rules(&self, bundle: &'static str, rules: &[RuleDefinition], out: &mut Vec<ValidationError>) {
        for (index, rule) in rules.iter().enumerate() {
            if rule.condition.is_empty() {
                out.push(ValidationError::EmptyCondition { bundle, index });
            }

            if let Some(pattern) = &rule.condition.regex_filter {
                if let Err(e) = regex::Regex::new(pattern) {
                    out.push(ValidationError::InvalidRegex {
                        bundle,
                        index,
                        reason: e.to_string(),
                    });
                }
            }

            if let Some(priority) = rule.priority {
                if priority == 0 || priority > self.max_priority {
                    out.push(ValidationError::InvalidPriority {
                        bundle,
                        index,
                        priority,
                        max: self.max_priority,
                    });
                }
            }
        }
    }
}

impl Default for BundleValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Rule definition tagged with its bundle, awaiting an identifier
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRule {
    pub definition: RuleDefinition,
    pub source: RuleSource,
}

/// Action block of an installed rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub kind: RuleAction,
}

/// Rule definition bound to a concrete installed identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub id: RuleId,
    pub priority: u32,
    pub action: ActionSpec,
    pub condition: RuleCondition,
    pub source: RuleSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CompiledRule {
    pub fn bind(pending: &PendingRule, id: RuleId) -> Self {
        let definition = &pending.definition;
        Self {
            id,
            priority: definition.priority.unwrap_or(DEFAULT_PRIORITY),
            action: ActionSpec {
                kind: definition.action,
            },
            condition: definition.condition.clone(),
            source: pending.source,
            description: definition.description.clone(),
        }
    }

    /// Same rule under a different identifier
    pub fn with_id(&self, id: RuleId) -> Self {
        Self { id, ..self.clone() }
    }

    /// Human readable summary used by telemetry views
    pub fn describe(&self) -> String {
        match (&self.description, self.source) {
            (Some(description), _) => description.clone(),
            (None, RuleSource::Custom) => match &self.condition.regex_filter {
                Some(pattern) => format!("Custom {} rule: {}", self.action.kind, pattern),
                None => format!("Custom {} rule", self.action.kind),
            },
            (None, source) => format!("{} preset rule", source.as_str()),
        }
    }
}

/// Turns a mode and the current rule sources into the ordered rule list.
///
/// Order only decides identifier draw order; matching priority is carried
/// explicitly on every rule.
pub struct RuleCompiler;

impl RuleCompiler {
    pub fn compile(mode: Mode, presets: &PresetCatalog, custom: &[RuleDefinition]) -> Vec<PendingRule> {
        let mut rules = Vec::new();
        if !mode.is_active() {
            return rules;
        }

        let tag = |defs: &[RuleDefinition], source: RuleSource| {
            defs.iter()
                .cloned()
                .map(move |definition| PendingRule { definition, source })
                .collect::<Vec<_>>()
        };

        rules.extend(tag(presets.balanced(), RuleSource::Balanced));
        if mode == Mode::Paranoid {
            rules.extend(tag(presets.paranoid(), RuleSource::Paranoid));
        }
        rules.extend(tag(custom, RuleSource::Custom));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PresetCatalog {
        PresetCatalog::new(
            vec![
                RuleDefinition::block(RuleCondition::regex("tracker")),
                RuleDefinition::block(RuleCondition::regex("ads")),
            ],
            vec![RuleDefinition::block(RuleCondition::regex("pixel"))],
        )
    }

    #[test]
    fn bundled_catalog_parses_and_validates() {
        let catalog = PresetCatalog::bundled().unwrap();
        assert!(!catalog.balanced().is_empty());
        assert!(!catalog.paranoid().is_empty());
        assert_eq!(catalog.digest().len(), 64);
        assert!(catalog.balanced().iter().all(|r| r.priority == Some(DEFAULT_PRIORITY)));
    }

    #[test]
    fn unreadable_preset_file_is_a_load_error() {
        let missing = std::path::Path::new("/nonexistent/webfw/presets.json");
        let err = PresetCatalog::load(Some(missing)).unwrap_err();
        assert!(matches!(&err, FirewallError::PresetLoad(reason) if reason.starts_with("I/O error")));
        assert!(!PresetCatalog::load(None).unwrap().is_empty());
    }

    #[test]
    fn invalid_preset_regex_is_rejected() {
        let json = r#"{"balanced": [{"type": "block", "regexFilter": "(unclosed"}], "paranoid": []}"#;
        assert!(matches!(BundleParser::from_json(json), Err(ParseError::InvalidFormat(_))));
    }

    #[test]
    fn off_compiles_to_nothing() {
        let custom = vec![RuleDefinition::block(RuleCondition::regex("x"))];
        assert!(RuleCompiler::compile(Mode::Off, &catalog(), &custom).is_empty());
    }

    #[test]
    fn paranoid_is_balanced_then_paranoid_then_custom() {
        let custom = vec![RuleDefinition::allow(RuleCondition::regex("intranet"))];
        let rules = RuleCompiler::compile(Mode::Paranoid, &catalog(), &custom);
        let sources: Vec<_> = rules.iter().map(|r| r.source).collect();
        assert_eq!(
            sources,
            vec![RuleSource::Balanced, RuleSource::Balanced, RuleSource::Paranoid, RuleSource::Custom]
        );
        assert_eq!(rules[3].definition.action, RuleAction::Allow);
    }

    #[test]
    fn balanced_skips_paranoid_bundle() {
        let rules = RuleCompiler::compile(Mode::Balanced, &catalog(), &[]);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.source == RuleSource::Balanced));
    }

    #[test]
    fn custom_validation_only_warns() {
        let rules = vec![
            RuleDefinition::block(RuleCondition::default()),
            RuleDefinition::block(RuleCondition::regex("[bad")).with_priority(0),
        ];
        let result = BundleValidator::new().validate_custom(&rules);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 3);
    }

    #[test]
    fn compiled_rule_defaults_priority_and_describes_itself() {
        let pending = PendingRule {
            definition: RuleDefinition::block(RuleCondition::regex("ads\\.example\\.com")),
            source: RuleSource::Custom,
        };
        let rule = CompiledRule::bind(&pending, RuleId::new(123_456));
        assert_eq!(rule.priority, DEFAULT_PRIORITY);
        assert_eq!(rule.describe(), "Custom block rule: ads\\.example\\.com");
        assert_eq!(rule.with_id(RuleId::new(7)).id, RuleId::new(7));

        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["action"]["type"], "block");
        assert_eq!(value["condition"]["regexFilter"], "ads\\.example\\.com");
    }
}
