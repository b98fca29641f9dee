//! Runtime configuration for the bridge process, read from the environment.

use std::path::PathBuf;

use rule_engine::STATIC_BAND_CEILING;

pub const ENV_DB_PATH: &str = "WEBFW_DB_PATH";
pub const ENV_LISTEN_ADDR: &str = "WEBFW_LISTEN_ADDR";
pub const ENV_PRESETS_PATH: &str = "WEBFW_PRESETS_PATH";
pub const ENV_STATIC_RULES: &str = "WEBFW_STATIC_RULES";

const DEFAULT_STATIC_RULES: u32 = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    /// SQLite file backing the persisted state
    pub db_path: PathBuf,
    /// Address of the JSON-lines message listener
    pub listen_addr: String,
    /// Preset catalog on disk; the bundled catalog is used when unset
    pub presets_path: Option<PathBuf>,
    /// Size of the static manifest occupying ids `1..=static_rules`
    pub static_rules: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./var/data/webfw.db"),
            listen_addr: "127.0.0.1:7878".to_string(),
            presets_path: None,
            static_rules: DEFAULT_STATIC_RULES,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or unparsable values
    /// keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let static_rules = lookup(ENV_STATIC_RULES)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .map(|n| n.min(STATIC_BAND_CEILING))
            .unwrap_or(defaults.static_rules);

        Self {
            db_path: lookup(ENV_DB_PATH).map(PathBuf::from).unwrap_or(defaults.db_path),
            listen_addr: lookup(ENV_LISTEN_ADDR).unwrap_or(defaults.listen_addr),
            presets_path: lookup(ENV_PRESETS_PATH).filter(|p| !p.is_empty()).map(PathBuf::from),
            static_rules,
        }
    }
}
