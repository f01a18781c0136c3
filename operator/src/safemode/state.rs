use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use shared_types::SafeModeReport;
use tokio::sync::Mutex;

/// What is known about the runtime agent of one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compatibility {
    #[default]
    Unknown,
    Compatible,
    Incompatible,
}

impl From<bool> for Compatibility {
    fn from(compatible: bool) -> Self {
        if compatible {
            Compatibility::Compatible
        } else {
            Compatibility::Incompatible
        }
    }
}

/// A started pod whose agent has not been resolved yet.
#[derive(Debug, Clone)]
pub struct PendingWorkload {
    pub report: SafeModeReport,
    /// Outcome reported by the agent so far.
    pub outcome: Compatibility,
    pub inserted_at: Instant,
}

/// Compatibility per workload and pending instances.
///
/// Removing an instance from the pending map is the claim that resolves it:
/// whoever removes it applies the resolution, so each instance is resolved
/// at most once.
#[derive(Default)]
pub struct SafeModeState {
    compatibility: DashMap<String, Compatibility>,
    /// instance id → pending workload
    pending: Mutex<HashMap<String, PendingWorkload>>,
}

impl SafeModeState {
    pub fn compatibility(&self, wlid: &str) -> Compatibility {
        self.compatibility
            .get(wlid)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    pub fn set_compatibility(&self, wlid: &str, compatibility: Compatibility) {
        if wlid.is_empty() {
            return;
        }
        self.compatibility.insert(wlid.to_string(), compatibility);
    }

    /// Reports without an instance id are ignored.
    pub async fn insert_pending(&self, report: SafeModeReport, now: Instant) -> bool {
        if report.instance_id.is_empty() {
            return false;
        }
        let instance = report.instance_id.clone();
        self.pending.lock().await.insert(
            instance,
            PendingWorkload {
                report,
                outcome: Compatibility::Unknown,
                inserted_at: now,
            },
        );
        true
    }

    pub async fn is_pending(&self, instance: &str) -> bool {
        self.pending.lock().await.contains_key(instance)
    }

    /// Returns false when the instance is not pending.
    pub async fn record_outcome(&self, instance: &str, outcome: Compatibility) -> bool {
        match self.pending.lock().await.get_mut(instance) {
            Some(entry) => {
                entry.outcome = outcome;
                true
            }
            None => false,
        }
    }

    pub async fn claim(&self, instance: &str) -> Option<PendingWorkload> {
        self.pending.lock().await.remove(instance)
    }

    /// Claim the instance only if it has been pending for at least `grace`.
    pub async fn claim_expired(
        &self,
        instance: &str,
        now: Instant,
        grace: Duration,
    ) -> Option<PendingWorkload> {
        let mut pending = self.pending.lock().await;
        let expired = pending
            .get(instance)
            .is_some_and(|entry| now.saturating_duration_since(entry.inserted_at) >= grace);
        if expired {
            pending.remove(instance)
        } else {
            None
        }
    }

    pub async fn pending_instances(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
