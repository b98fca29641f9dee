//! Match pump - background task feeding engine notifications to the controller.
//!
//! Notifications are handled one at a time, in arrival order, so counter
//! updates never race each other.

use log::{debug, error, info};
use std::sync::Arc;
use tokio::task::JoinHandle;

use rule_engine::{MatchOutcome, MatchReceiver, ModeController};

/// Totals reported when the queue closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub recorded: u64,
    pub stale: u64,
    pub failed: u64,
}

pub struct MatchPump {
    controller: Arc<ModeController>,
    receiver: MatchReceiver,
}

impl MatchPump {
    pub fn new(controller: Arc<ModeController>, receiver: MatchReceiver) -> Self {
        Self { controller, receiver }
    }

    /// Spawn the pump as a tokio task
    pub fn spawn(self) -> JoinHandle<PumpStats> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until every sender is gone.
    pub async fn run(mut self) -> PumpStats {
        info!("Match pump started");
        let mut stats = PumpStats::default();

        while let Some(notification) = self.receiver.recv().await {
            match self.controller.on_match(notification).await {
                Ok(MatchOutcome::Recorded { blocked_count }) => {
                    debug!("Blocked count now {}", blocked_count);
                    stats.recorded += 1;
                }
                Ok(MatchOutcome::Stale) => stats.stale += 1,
                Err(e) => {
                    error!("Failed to record match: {}", e);
                    stats.failed += 1;
                }
            }
        }

        info!(
            "Match pump stopped: {} recorded, {} stale, {} failed",
            stats.recorded, stats.stale, stats.failed
        );
        stats
    }
}
