//! # Tiering Controller
//!
//! A periodic pressure evaluator. Each tick it snapshots per-tier
//! occupancy, asks the eviction policy for a victim in every tier over
//! its limit, and enqueues a demotion task one tier down. It also runs
//! the TTL sweep. The controller never touches storage itself; every
//! effect funnels through the spill queue into the payload manager's
//! per-payload critical section.
//!
//! The policy seam is pluggable: the reference implementation is LRU
//! biased against leased payloads, but LFU, size-weighted, or cost
//! models drop in without touching the controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::{PayloadId, Tier};
use crate::manager::{CensusEntry, PayloadManager};
use crate::spill::{SpillScheduler, SpillTask};

/// One tier's occupancy at evaluation time, with its resident payloads.
#[derive(Debug, Clone)]
pub struct PressureSnapshot {
    pub tier: Tier,
    pub occupancy_bytes: u64,
    pub limit_bytes: u64,
    pub entries: Vec<CensusEntry>,
}

impl PressureSnapshot {
    pub fn over_limit(&self) -> bool {
        self.limit_bytes > 0 && self.occupancy_bytes > self.limit_bytes
    }
}

/// Eviction victim selection.
pub trait TieringPolicy: Send + Sync {
    /// Pick a payload to demote out of the pressured tier, or `None`
    /// when nothing is evictable.
    fn choose_victim(&self, snapshot: &PressureSnapshot) -> Option<PayloadId>;
}

/// Least-recently-used victim selection, biased against payloads that
/// are leased or not yet committed.
#[derive(Debug, Default)]
pub struct LruTieringPolicy;

impl TieringPolicy for LruTieringPolicy {
    fn choose_victim(&self, snapshot: &PressureSnapshot) -> Option<PayloadId> {
        snapshot
            .entries
            .iter()
            .filter(|e| !e.leased && e.state.is_readable())
            .min_by_key(|e| e.last_access_ms)
            .map(|e| e.id)
    }
}

/// Periodic pressure evaluator and TTL sweeper.
pub struct TieringController {
    manager: Arc<PayloadManager>,
    scheduler: Arc<SpillScheduler>,
    policy: Arc<dyn TieringPolicy>,
    limits: HashMap<Tier, u64>,
    interval: Duration,
}

impl TieringController {
    pub fn new(
        manager: Arc<PayloadManager>,
        scheduler: Arc<SpillScheduler>,
        policy: Arc<dyn TieringPolicy>,
        limits: HashMap<Tier, u64>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            scheduler,
            policy,
            limits,
            interval,
        }
    }

    /// One evaluation pass. Returns the number of spill tasks enqueued.
    pub async fn evaluate(&self) -> usize {
        let census = match self.manager.census().await {
            Ok(census) => census,
            Err(e) => {
                tracing::warn!(error = %e, "tiering census failed");
                return 0;
            }
        };

        let mut enqueued = 0;
        for tier in Tier::ALL {
            let Some(target) = tier.next_slower() else {
                continue;
            };
            let limit = self.limits.get(&tier).copied().unwrap_or(0);
            let entries: Vec<CensusEntry> =
                census.iter().filter(|e| e.tier == tier).cloned().collect();
            let snapshot = PressureSnapshot {
                tier,
                occupancy_bytes: entries.iter().map(|e| e.size_bytes).sum(),
                limit_bytes: limit,
                entries,
            };
            if !snapshot.over_limit() {
                continue;
            }

            match self.policy.choose_victim(&snapshot) {
                Some(victim) => {
                    tracing::info!(%victim, from = %tier, to = %target,
                        occupancy = snapshot.occupancy_bytes, limit,
                        "pressure eviction scheduled");
                    match self.scheduler.enqueue(SpillTask::demote(victim, target)) {
                        Ok(()) => enqueued += 1,
                        Err(e) => {
                            tracing::warn!(error = %e, "spill enqueue failed")
                        }
                    }
                }
                None => {
                    tracing::debug!(%tier, "tier over limit but nothing evictable");
                }
            }
        }

        // expired payloads ride the same cadence
        match self.manager.sweep_expired().await {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(count = removed.len(), "expired payloads removed");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
        }

        enqueued
    }

    /// Spawn the evaluation loop. The returned handle stops it.
    pub fn start(self) -> TieringControllerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.evaluate().await;
                    }
                    result = stop_rx.changed() => {
                        if result.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("tiering controller stopped");
        });
        TieringControllerHandle {
            stop: stop_tx,
            handle,
        }
    }
}

/// Running controller loop.
pub struct TieringControllerHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TieringControllerHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
