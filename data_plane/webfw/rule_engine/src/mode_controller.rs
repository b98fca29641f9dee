// Mode controller: orchestrates the rule lifecycle
//
// Owns the current mode, the enabled flag and the blocked counter, and
// drives compiler + allocator + enforcement engine + telemetry on every
// mode change, custom-rule change, enable/disable toggle and restart.
//
// Design Principles:
// 1. The persisted state is the source of truth; `ControllerState` is a
//    cache that is only (re)initialised through `restore_state`
// 2. Every apply is an unconditional remove-then-reapply, so stale rules
//    left in the engine by a previous process are swept away
// 3. The state cache lock is never held across a suspension point. Engine
//    synchronisation (remove, settle, install) runs under a separate async
//    lock, so overlapping calls complete in arrival order and the last one
//    decides what the engine holds
// 4. On unrecoverable custom-rule failure the mode is coerced to balanced
//    rather than left ambiguous

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::enforcement::{EnforcementEngine, RuleMatch};
use crate::error::Result;
use crate::id_allocator::IdAllocator;
use crate::rule_bundle::{BundleValidator, CompiledRule, PresetCatalog, RuleCompiler};
use crate::rule_metadata::{Mode, RuleDefinition, RuleId};
use crate::store::StateStore;
use crate::telemetry::{TelemetryAggregate, TelemetryEvent, TelemetryRecorder};

// ============================================================================
// Core Types
// ============================================================================

/// In-memory cache of the persisted controller state
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub mode: Mode,
    pub enabled: bool,
    pub blocked_count: u64,
    /// Rules this controller installed in the enforcement engine
    pub applied: Vec<CompiledRule>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            mode: Mode::Off,
            enabled: true,
            blocked_count: 0,
            applied: Vec::new(),
        }
    }
}

/// Externally visible state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub mode: Mode,
    pub blocked_count: u64,
}

/// What happened to a match notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Recorded { blocked_count: u64 },
    /// Arrived while disabled or off; dropped without recording
    Stale,
}

// ============================================================================
// Mode Controller
// ============================================================================

pub struct ModeController {
    config: ControllerConfig,
    store: StateStore,
    engine: Arc<dyn EnforcementEngine>,
    presets: PresetCatalog,
    allocator: IdAllocator,
    telemetry: TelemetryRecorder,
    state: Mutex<ControllerState>,
    /// Held for a whole remove-settle-install cycle
    engine_sync: AsyncMutex<()>,
    restored: OnceCell<()>,
}

impl ModeController {
    pub fn new(
        config: ControllerConfig,
        store: StateStore,
        engine: Arc<dyn EnforcementEngine>,
        presets: PresetCatalog,
    ) -> Self {
        let allocator = IdAllocator::new(&config);
        Self::with_allocator(config, store, engine, presets, allocator)
    }

    pub fn with_allocator(
        config: ControllerConfig,
        store: StateStore,
        engine: Arc<dyn EnforcementEngine>,
        presets: PresetCatalog,
        allocator: IdAllocator,
    ) -> Self {
        let telemetry = TelemetryRecorder::new(store.clone(), config.telemetry_capacity);
        Self {
            config,
            store,
            engine,
            presets,
            allocator,
            telemetry,
            state: Mutex::new(ControllerState::default()),
            engine_sync: AsyncMutex::new(()),
            restored: OnceCell::new(),
        }
    }

    pub fn presets(&self) -> &PresetCatalog {
        &self.presets
    }

    /// Copy of the cached state, without triggering a restore
    pub fn cached_state(&self) -> ControllerState {
        self.state.lock().clone()
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rehydrate from the store and resynchronise the engine.
    ///
    /// Runs at most once per process; later calls return immediately and
    /// concurrent callers wait for the first one. A store failure leaves
    /// the controller unrestored so the next call tries again.
    pub async fn restore_state(&self) -> Result<()> {
        self.restored.get_or_try_init(|| self.restore_inner()).await?;
        Ok(())
    }

    async fn restore_inner(&self) -> Result<()> {
        let persisted = self.store.load().await?;
        {
            let mut state = self.state.lock();
            state.mode = persisted.mode;
            state.enabled = persisted.enabled;
            state.blocked_count = persisted.blocked_count;
        }
        info!(
            "Restoring state: mode={}, enabled={}, blocked={}",
            persisted.mode, persisted.enabled, persisted.blocked_count
        );

        let resync = if persisted.enabled {
            self.apply_mode(persisted.mode, false).await
        } else {
            self.withdraw_rules().await
        };
        if let Err(e) = resync {
            warn!("Engine resync after restore incomplete: {}", e);
        }
        Ok(())
    }

    /// First-install seeding: defaults, empty telemetry, balanced mode
    pub async fn install(&self) -> Result<()> {
        self.store.seed_defaults().await?;
        self.telemetry.get().await?;
        {
            let mut state = self.state.lock();
            state.mode = Mode::Balanced;
            state.enabled = true;
        }
        let _ = self.restored.set(());
        self.apply_mode(Mode::Balanced, true).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_state(&self) -> Result<StateSnapshot> {
        self.restore_state().await?;
        let state = self.state.lock();
        Ok(StateSnapshot {
            mode: state.mode,
            blocked_count: state.blocked_count,
        })
    }

    /// Badge label: the blocked count, empty when zero or disabled
    pub fn badge_text(&self) -> String {
        let state = self.state.lock();
        if !state.enabled || state.blocked_count == 0 {
            String::new()
        } else {
            state.blocked_count.to_string()
        }
    }

    /// Dynamic rules the engine currently holds
    pub async fn list_active_rules(&self) -> Result<Vec<CompiledRule>> {
        Ok(self.engine.dynamic_rules().await?)
    }

    /// Description of an applied rule, if this controller installed it
    pub fn rule_description(&self, id: RuleId) -> Option<String> {
        self.state
            .lock()
            .applied
            .iter()
            .find(|rule| rule.id == id)
            .map(CompiledRule::describe)
    }

    // ========================================================================
    // Mode and enable transitions
    // ========================================================================

    /// Switch mode; resets the blocked counter
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        self.restore_state().await?;
        self.apply_mode(mode, true).await
    }

    /// Gate rule installation without touching the persisted mode
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.restore_state().await?;
        self.store.set_enabled(enabled).await?;
        self.state.lock().enabled = enabled;
        info!("Firewall {}", if enabled { "enabled" } else { "disabled" });

        if enabled {
            let mode = self.store.mode().await?;
            self.apply_mode(mode, false).await
        } else {
            self.withdraw_rules().await
        }
    }

    /// Flip the enabled flag; returns the new value
    pub async fn toggle_enabled(&self) -> Result<bool> {
        self.restore_state().await?;
        let enabled = !self.store.enabled().await?;
        self.set_enabled(enabled).await?;
        Ok(enabled)
    }

    /// Persist new custom rules and reapply the current mode with them.
    ///
    /// When nothing could be installed, the previous rules and mode are
    /// reapplied; if that fails too the mode is forced to balanced. The
    /// original error is returned either way.
    pub async fn apply_custom_rules(&self, rules: Vec<RuleDefinition>) -> Result<()> {
        self.restore_state().await?;

        for warning in BundleValidator::new().validate_custom(&rules).warnings {
            warn!("Custom rule: {}", warning);
        }

        let previous = self.store.custom_rules().await?;
        self.store.set_custom_rules(&rules).await?;
        let mode = self.state.lock().mode;

        let Err(err) = self.apply_mode(mode, true).await else {
            return Ok(());
        };
        warn!("Applying {} custom rules failed: {}; restoring previous set", rules.len(), err);

        if let Err(recovery) = self.reapply_previous(mode, &previous).await {
            error!("Recovery failed ({}); forcing balanced mode", recovery);
            self.state.lock().mode = Mode::Balanced;
            if let Err(e) = self.store.set_mode(Mode::Balanced).await {
                error!("Could not persist fallback mode: {}", e);
            }
        }
        Err(err)
    }

    async fn reapply_previous(&self, mode: Mode, previous: &[RuleDefinition]) -> Result<()> {
        self.store.set_custom_rules(previous).await?;
        self.apply_mode(mode, true).await
    }

    /// Remove every dynamic rule and the baseline, leaving persisted mode
    /// and enabled flag alone
    pub async fn emergency_clear(&self) -> Result<()> {
        warn!("Emergency clear requested");
        self.withdraw_rules().await
    }

    /// Wipe all persisted state and come back up in balanced mode
    pub async fn full_reset(&self) -> Result<()> {
        warn!("Full reset requested");
        self.withdraw_rules().await?;
        self.store.seed_defaults().await?;
        self.store.set_blocked_count(0).await?;
        self.store.set_static_ruleset_enabled(true).await?;
        self.telemetry.clear().await?;
        {
            let mut state = self.state.lock();
            *state = ControllerState {
                mode: Mode::Balanced,
                ..ControllerState::default()
            };
        }
        let _ = self.restored.set(());

        if !self.config.reset_reenable_delay.is_zero() {
            tokio::time::sleep(self.config.reset_reenable_delay).await;
        }
        self.apply_mode(Mode::Balanced, true).await
    }

    // ========================================================================
    // Match notifications and telemetry
    // ========================================================================

    /// Count and record a match; stale notifications are dropped
    pub async fn on_match(&self, notification: RuleMatch) -> Result<MatchOutcome> {
        self.restore_state().await?;

        let (enabled, mode, count) = {
            let state = self.state.lock();
            (state.enabled, state.mode, state.blocked_count)
        };
        if !enabled || !mode.is_active() {
            debug!("Dropping stale match for rule {:?}", notification.rule_id);
            return Ok(MatchOutcome::Stale);
        }

        // telemetry first: the badge never counts a block that totalBlocked lacks
        self.telemetry.record(TelemetryEvent::from_match(&notification)).await?;

        let blocked_count = count + 1;
        self.store.set_blocked_count(blocked_count).await?;
        {
            let mut state = self.state.lock();
            state.blocked_count = state.blocked_count.max(blocked_count);
        }
        Ok(MatchOutcome::Recorded { blocked_count })
    }

    pub async fn telemetry(&self) -> Result<TelemetryAggregate> {
        self.telemetry.get().await
    }

    /// Clear telemetry and the visible blocked counter
    pub async fn clear_telemetry(&self) -> Result<()> {
        self.telemetry.clear().await?;
        self.store.set_blocked_count(0).await?;
        self.state.lock().blocked_count = 0;
        Ok(())
    }

    // ========================================================================
    // Engine synchronisation
    // ========================================================================

    /// Remove-then-reapply cycle for `mode`.
    ///
    /// The persisted mode only changes once the new rule set is installed.
    async fn apply_mode(&self, mode: Mode, reset_counter: bool) -> Result<()> {
        let _sync = self.engine_sync.lock().await;
        let run = Uuid::new_v4();
        info!("[{}] Applying mode {}", run, mode);

        if reset_counter {
            self.store.set_blocked_count(0).await?;
            self.state.lock().blocked_count = 0;
        }

        let enabled = self.state.lock().enabled;
        let baseline = enabled && mode.is_active();
        self.engine.set_baseline_enabled(baseline).await?;
        self.store.set_static_ruleset_enabled(baseline).await?;

        self.remove_dynamic_rules().await?;
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let pending = if enabled {
            let custom = self.store.custom_rules().await?;
            RuleCompiler::compile(mode, &self.presets, &custom)
        } else {
            Vec::new()
        };

        let installed = self.allocator.assign_and_apply(self.engine.as_ref(), &pending).await?;
        self.store.set_mode(mode).await?;

        info!("[{}] Mode {} active with {} dynamic rules", run, mode, installed.len());
        let mut state = self.state.lock();
        state.mode = mode;
        state.applied = installed;
        Ok(())
    }

    async fn remove_dynamic_rules(&self) -> Result<()> {
        let ids = self.engine.dynamic_identifiers().await?;
        if !ids.is_empty() {
            debug!("Removing {} dynamic rules", ids.len());
            self.engine.remove_rules(&ids).await?;
        }
        self.state.lock().applied.clear();
        Ok(())
    }

    async fn withdraw_rules(&self) -> Result<()> {
        let _sync = self.engine_sync.lock().await;
        self.remove_dynamic_rules().await?;
        self.engine.set_baseline_enabled(false).await?;
        self.store.set_static_ruleset_enabled(false).await?;
        Ok(())
    }
}
