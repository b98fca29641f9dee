// Collision-avoiding identifier allocation
//
// The identifier namespace is shared with the enforcement engine's static
// manifest, which this crate cannot fully observe. Collisions are therefore
// treated as likely rather than impossible:
// 1. Ranges are found by random probing in a high sub-range of the space,
//    bounded by an attempt count rather than wall-clock time
// 2. A rejected bulk install degrades to one-rule-at-a-time installs
// 3. A single rejected rule is retried under freshly drawn ids before it is
//    dropped; the rest of the batch carries on

use log::{debug, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

use crate::config::ControllerConfig;
use crate::enforcement::EnforcementEngine;
use crate::error::{FirewallError, Result};
use crate::rule_bundle::{CompiledRule, PendingRule};
use crate::rule_metadata::RuleId;

// ============================================================================
// Pure probing
// ============================================================================

/// Inclusive bounds of the sub-range probed for identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRange {
    pub floor: u32,
    pub ceiling: u32,
}

impl ProbeRange {
    pub fn new(floor: u32, ceiling: u32) -> Self {
        Self { floor, ceiling }
    }

    /// Highest start that still fits `count` consecutive ids, if any
    pub fn max_start(&self, count: usize) -> Option<u32> {
        let span = u32::try_from(count.saturating_sub(1)).ok()?;
        let max_start = self.ceiling.checked_sub(span)?;
        (max_start >= self.floor).then_some(max_start)
    }
}

fn range_is_free(existing: &HashSet<RuleId>, start: u32, count: usize) -> bool {
    (0..count as u64).all(|offset| {
        u32::try_from(start as u64 + offset)
            .map(|id| !existing.contains(&RuleId::new(id)))
            .unwrap_or(false)
    })
}

/// Probe with an arbitrary start sampler.
///
/// Returns the first sampled start whose `count` consecutive ids are all
/// unused, or `AllocationExhausted` once `attempts` samples collided.
pub fn allocate_range_with<F>(
    existing: &HashSet<RuleId>,
    count: usize,
    attempts: usize,
    mut sample: F,
) -> Result<RuleId>
where
    F: FnMut() -> u32,
{
    for attempt in 0..attempts {
        let start = sample();
        if range_is_free(existing, start, count) {
            if attempt > 0 {
                debug!("Allocated {} ids at {} after {} collisions", count, start, attempt);
            }
            return Ok(RuleId::new(start));
        }
    }
    Err(FirewallError::AllocationExhausted { count, attempts })
}

/// Probe uniformly random starts inside `range`
pub fn allocate_range<R: Rng>(
    existing: &HashSet<RuleId>,
    count: usize,
    range: ProbeRange,
    attempts: usize,
    rng: &mut R,
) -> Result<RuleId> {
    let Some(max_start) = range.max_start(count.max(1)) else {
        return Err(FirewallError::AllocationExhausted { count, attempts: 0 });
    };
    allocate_range_with(existing, count, attempts, || rng.gen_range(range.floor..=max_start))
}

// ============================================================================
// Allocator bound to an enforcement engine
// ============================================================================

/// Hands out identifiers and installs rules with per-rule fallback
pub struct IdAllocator {
    range: ProbeRange,
    attempts: usize,
    per_rule_retries: usize,
    rng: Mutex<StdRng>,
}

impl IdAllocator {
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Allocator with a caller-provided generator (deterministic in tests)
    pub fn with_rng(config: &ControllerConfig, rng: StdRng) -> Self {
        Self {
            range: ProbeRange::new(config.dynamic_floor(), config.id_ceiling),
            attempts: config.allocation_attempts,
            per_rule_retries: config.per_rule_retries,
            rng: Mutex::new(rng),
        }
    }

    pub fn range(&self) -> ProbeRange {
        self.range
    }

    /// Find `count` consecutive ids unknown to the engine, starting no
    /// lower than `candidate_floor`
    pub async fn allocate_range(
        &self,
        engine: &dyn EnforcementEngine,
        candidate_floor: u32,
        count: usize,
    ) -> Result<RuleId> {
        let existing = engine.list_identifiers().await?;
        let range = ProbeRange::new(candidate_floor.max(self.range.floor), self.range.ceiling);
        let mut rng = self.rng.lock();
        allocate_range(&existing, count, range, self.attempts, &mut *rng)
    }

    /// Draw one id that is not in `taken`
    fn draw_single(&self, taken: &HashSet<RuleId>) -> Option<RuleId> {
        let mut rng = self.rng.lock();
        allocate_range(taken, 1, self.range, self.attempts, &mut *rng).ok()
    }

    /// Assign ids to `pending` and install them.
    ///
    /// A contiguous range is tried first. When none is found, every rule
    /// gets an individually drawn id instead and rules that still cannot be
    /// placed are skipped.
    pub async fn assign_and_apply(
        &self,
        engine: &dyn EnforcementEngine,
        pending: &[PendingRule],
    ) -> Result<Vec<CompiledRule>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let compiled = match self.allocate_range(engine, self.range.floor, pending.len()).await {
            Ok(start) => pending
                .iter()
                .enumerate()
                .map(|(offset, rule)| CompiledRule::bind(rule, RuleId::new(start.as_u32() + offset as u32)))
                .collect(),
            Err(FirewallError::AllocationExhausted { count, attempts }) => {
                warn!(
                    "No contiguous range for {} rules after {} attempts, drawing ids per rule",
                    count, attempts
                );
                let mut taken = engine.list_identifiers().await?;
                let mut compiled = Vec::with_capacity(pending.len());
                for rule in pending {
                    match self.draw_single(&taken) {
                        Some(id) => {
                            taken.insert(id);
                            compiled.push(CompiledRule::bind(rule, id));
                        }
                        None => warn!("Skipping {} rule: identifier space exhausted", rule.source.as_str()),
                    }
                }
                compiled
            }
            Err(e) => return Err(e),
        };

        self.apply_with_fallback(engine, compiled).await
    }

    /// Install `rules`, degrading to one-at-a-time installs on rejection.
    ///
    /// Returns the installed subset. Only an entirely empty result is an
    /// error.
    pub async fn apply_with_fallback(
        &self,
        engine: &dyn EnforcementEngine,
        rules: Vec<CompiledRule>,
    ) -> Result<Vec<CompiledRule>> {
        if rules.is_empty() {
            return Ok(rules);
        }

        match engine.install_rules(&rules).await {
            Ok(()) => return Ok(rules),
            Err(e) => warn!("Bulk install of {} rules rejected ({}), installing one by one", rules.len(), e),
        }

        let attempted = rules.len();
        let mut taken = engine.list_identifiers().await?;
        taken.extend(rules.iter().map(|r| r.id));

        let mut installed = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Some(rule) = self.install_single(engine, rule, &mut taken).await {
                installed.push(rule);
            }
        }

        if installed.is_empty() {
            return Err(FirewallError::ApplyFailed { attempted });
        }
        if installed.len() < attempted {
            warn!("Installed {} of {} rules", installed.len(), attempted);
        }
        Ok(installed)
    }

    async fn install_single(
        &self,
        engine: &dyn EnforcementEngine,
        mut rule: CompiledRule,
        taken: &mut HashSet<RuleId>,
    ) -> Option<CompiledRule> {
        let mut retries = 0;
        loop {
            match engine.install_rules(std::slice::from_ref(&rule)).await {
                Ok(()) => return Some(rule),
                Err(e) if e.is_collision() && retries < self.per_rule_retries => {
                    taken.insert(rule.id);
                    let Some(id) = self.draw_single(taken) else {
                        warn!("Dropping rule {}: no free id left to retry with", rule.id);
                        return None;
                    };
                    taken.insert(id);
                    rule = rule.with_id(id);
                    retries += 1;
                }
                Err(e) => {
                    warn!("Dropping rule {} after {} retries: {}", rule.id, retries, e);
                    return None;
                }
            }
        }
    }
}
