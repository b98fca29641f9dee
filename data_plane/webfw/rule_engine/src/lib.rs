//! Rule lifecycle core for the web firewall.
//!
//! Compiles preset and custom rules for the active mode, binds them to
//! collision-free identifiers, installs them through an
//! [`EnforcementEngine`], and keeps counters and telemetry in a
//! [`KeyValueStore`] so they survive restarts.

pub mod config;
pub mod enforcement;
pub mod error;
pub mod id_allocator;
pub mod message_api;
pub mod mode_controller;
pub mod rule_bundle;
pub mod rule_metadata;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{
    ControllerConfig,       // Timing and allocation bounds
    DYNAMIC_PROBE_FLOOR,
    ID_CEILING,
    STATIC_BAND_CEILING,
    TELEMETRY_MAX_EVENTS,
};

pub use error::{EngineError, FirewallError, Result, StoreError};

pub use rule_metadata::{
    Mode,                   // off / balanced / paranoid
    ResourceType,
    RuleAction,
    RuleCondition,
    RuleDefinition,         // Uncompiled rule (preset or custom)
    RuleId,
    RuleSource,
};

pub use rule_bundle::{
    ActionSpec,
    BundleParser,           // Preset catalog parsing
    BundleValidator,        // Preset and custom rule checks
    CompiledRule,           // Rule bound to an installed id
    ParseError,
    PendingRule,            // Compiler output awaiting an id
    PresetCatalog,
    RuleCompiler,
    ValidationError,
    ValidationResult,
};

pub use enforcement::{match_channel, EnforcementEngine, MatchReceiver, MatchSender, RuleMatch};

pub use id_allocator::{IdAllocator, ProbeRange};

pub use store::{KeyValueStore, MemoryStore, PersistedState, StateStore};

pub use telemetry::{TelemetryAggregate, TelemetryEvent, TelemetryRecorder};

pub use mode_controller::{ControllerState, MatchOutcome, ModeController, StateSnapshot};

pub use message_api::{ExportFormat, MessageHandler, Request, Response};
