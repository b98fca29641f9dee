//! Tunables for the rule lifecycle manager.

use std::time::Duration;

/// Highest identifier reserved for the enforcement engine's static manifest
pub const STATIC_BAND_CEILING: u32 = 19_999;

/// Lowest identifier the allocator probes from
pub const DYNAMIC_PROBE_FLOOR: u32 = 100_000;

/// Largest identifier the enforcement engine accepts
pub const ID_CEILING: u32 = i32::MAX as u32;

/// Ring buffer capacity for telemetry events
pub const TELEMETRY_MAX_EVENTS: usize = 5000;

/// Configuration for the mode controller and its collaborators
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pause between bulk removal and reapplication
    pub settle_delay: Duration,

    /// Probe attempts before a range allocation gives up
    pub allocation_attempts: usize,

    /// Fresh ids tried for a single rule after the bulk install was rejected
    pub per_rule_retries: usize,

    /// Identifiers at or below this value belong to the static manifest
    pub static_band_ceiling: u32,

    /// Start of the high sub-range sampled for dynamic rules
    pub probe_floor: u32,

    /// Inclusive upper bound of the identifier space
    pub id_ceiling: u32,

    /// Telemetry ring buffer capacity
    pub telemetry_capacity: usize,

    /// Delay before a full reset re-enables balanced mode
    pub reset_reenable_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            allocation_attempts: 1000,
            per_rule_retries: 100,
            static_band_ceiling: STATIC_BAND_CEILING,
            probe_floor: DYNAMIC_PROBE_FLOOR,
            id_ceiling: ID_CEILING,
            telemetry_capacity: TELEMETRY_MAX_EVENTS,
            reset_reenable_delay: Duration::from_millis(250),
        }
    }
}

impl ControllerConfig {
    /// Config with no artificial delays, for tests and tooling
    pub fn immediate() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            reset_reenable_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Lowest id a dynamic rule may receive
    pub fn dynamic_floor(&self) -> u32 {
        self.probe_floor.max(self.static_band_ceiling.saturating_add(1))
    }
}
