//! Runtime agent safe mode.
//!
//! The init container reports when a pod starts, the agent reports whether
//! it initialized. A pod whose agent fails, or stays silent past the grace
//! period, gets its workload marked incompatible and a detach command.

pub mod state;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use shared_types::{Command, CommandName, JobStatus, ReporterKind, SafeModeReport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::{DispatchQueue, SessionFactory},
    kube::{KubeError, WorkloadLabeler},
};

pub use state::{Compatibility, PendingWorkload, SafeModeState};

/// Reporter name on safe-mode status events and detach commands.
pub const SAFE_MODE_REPORTER: &str = "SafeMode";

#[derive(Debug, Clone)]
pub struct SafeModeConfig {
    pub sweep_interval: Duration,
    pub grace_period: Duration,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(120),
            grace_period: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub compatible: usize,
    pub incompatible: usize,
    pub dropped: usize,
}

pub struct SafeModeHandler {
    state: SafeModeState,
    labeler: Arc<dyn WorkloadLabeler>,
    sessions: SessionFactory,
    dispatch: DispatchQueue,
    config: SafeModeConfig,
}

impl SafeModeHandler {
    pub fn new(
        labeler: Arc<dyn WorkloadLabeler>,
        sessions: SessionFactory,
        dispatch: DispatchQueue,
        config: SafeModeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: SafeModeState::default(),
            labeler,
            sessions,
            dispatch,
            config,
        })
    }

    pub fn state(&self) -> &SafeModeState {
        &self.state
    }

    /// Seed workload compatibility from existing labels.
    pub async fn bootstrap(&self) -> Result<usize, KubeError> {
        let known = self.labeler.list_agent_compatibility().await?;
        for (wlid, compatible) in &known {
            self.state.set_compatibility(wlid, (*compatible).into());
        }
        Ok(known.len())
    }

    pub async fn handle_report(&self, report: SafeModeReport) {
        self.handle_report_at(report, Instant::now()).await
    }

    pub async fn handle_report_at(&self, report: SafeModeReport, now: Instant) {
        debug!(
            reporter = %report.reporter,
            wlid = %report.wlid,
            instance = %report.instance_id,
            status_code = report.status_code,
            "safe-mode report"
        );
        match &report.reporter {
            ReporterKind::InitContainer => self.handle_pod_started(report, now).await,
            ReporterKind::Agent => self.handle_agent_report(report).await,
            ReporterKind::Webhook => {}
            ReporterKind::Other(other) => {
                warn!(reporter = %other, wlid = %report.wlid, "unknown safe-mode reporter")
            }
        }
    }

    async fn handle_pod_started(&self, report: SafeModeReport, now: Instant) {
        if report.status_code != 0 {
            debug!(wlid = %report.wlid, code = report.status_code, "ignoring failed init container report");
            return;
        }
        if self.state.compatibility(&report.wlid) == Compatibility::Compatible {
            debug!(wlid = %report.wlid, "workload already compatible; not tracking pod");
            return;
        }
        let reporter = self
            .sessions
            .reporter(SAFE_MODE_REPORTER, &report.wlid, &report.job_id)
            .with_action_name("Attach agent");
        if self.state.insert_pending(report.clone(), now).await {
            info!(wlid = %report.wlid, instance = %report.instance_id, "tracking started pod");
            reporter.send_status(JobStatus::Done, &report.message).await;
        }
    }

    async fn handle_agent_report(&self, report: SafeModeReport) {
        if report.status_code == 0 {
            info!(wlid = %report.wlid, instance = %report.instance_id, "agent initialized");
            self.state
                .set_compatibility(&report.wlid, Compatibility::Compatible);
            self.state
                .record_outcome(&report.instance_id, Compatibility::Compatible)
                .await;
            return;
        }

        if !self.state.is_pending(&report.instance_id).await {
            error!(
                wlid = %report.wlid,
                instance = %report.instance_id,
                "agent failure for an instance that is not being watched"
            );
            return;
        }
        if self.state.compatibility(&report.wlid) == Compatibility::Compatible {
            error!(
                wlid = %report.wlid,
                instance = %report.instance_id,
                "agent failure contradicts a compatible workload; ignoring"
            );
            return;
        }
        match self.state.claim(&report.instance_id).await {
            Some(_) => self.resolve_incompatible(&report).await,
            None => debug!(instance = %report.instance_id, "instance already resolved"),
        }
    }

    async fn resolve_compatible(&self, report: &SafeModeReport) {
        info!(wlid = %report.wlid, instance = %report.instance_id, "workload compatible");
        self.state
            .set_compatibility(&report.wlid, Compatibility::Compatible);
        if let Err(e) = self.labeler.set_agent_compatible(&report.wlid, true).await {
            error!(wlid = %report.wlid, error = %e, "failed to label workload compatible");
        }
    }

    async fn resolve_incompatible(&self, report: &SafeModeReport) {
        warn!(
            wlid = %report.wlid,
            instance = %report.instance_id,
            code = report.status_code,
            message = %report.message,
            "workload INCOMPATIBLE; detaching agent"
        );
        self.state
            .set_compatibility(&report.wlid, Compatibility::Incompatible);
        if let Err(e) = self.labeler.set_agent_compatible(&report.wlid, false).await {
            error!(wlid = %report.wlid, error = %e, "failed to label workload incompatible");
        }

        self.sessions
            .reporter(SAFE_MODE_REPORTER, &report.wlid, &report.job_id)
            .with_action_name("Agent incompatible - detaching")
            .send_error(&report.message)
            .await;

        let detach = Command {
            name: CommandName::Incompatible,
            wlid: report.wlid.clone(),
            ..Default::default()
        };
        let session = self
            .sessions
            .session(detach, SAFE_MODE_REPORTER, "", &report.job_id, 1);
        if let Err(e) = self.dispatch.submit(session).await {
            error!(wlid = %report.wlid, error = %e, "failed to dispatch detach command");
        }
    }

    /// Resolve every instance pending longer than the grace period.
    pub async fn sweep_at(&self, now: Instant) -> SweepSummary {
        let mut summary = SweepSummary::default();
        for instance in self.state.pending_instances().await {
            let Some(entry) = self
                .state
                .claim_expired(&instance, now, self.config.grace_period)
                .await
            else {
                continue;
            };
            match entry.outcome {
                Compatibility::Compatible => {
                    self.resolve_compatible(&entry.report).await;
                    summary.compatible += 1;
                }
                Compatibility::Unknown | Compatibility::Incompatible => {
                    if self.state.compatibility(&entry.report.wlid) == Compatibility::Compatible {
                        warn!(
                            wlid = %entry.report.wlid,
                            instance = %instance,
                            "silent agent on a compatible workload; dropping"
                        );
                        summary.dropped += 1;
                    } else {
                        self.resolve_incompatible(&entry.report).await;
                        summary.incompatible += 1;
                    }
                }
            }
        }
        summary
    }

    /// Consume reports until cancelled or every sender is gone.
    pub async fn run(
        self: Arc<Self>,
        mut reports: mpsc::Receiver<SafeModeReport>,
        cancel: CancellationToken,
    ) {
        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = reports.recv() => report,
            };
            let Some(report) = report else { break };
            self.handle_report(report).await;
        }
        info!("safe-mode tracker stopped");
    }

    pub async fn run_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let period = if self.config.sweep_interval.is_zero() {
            warn!("zero safe-mode sweep interval; using the default");
            SafeModeConfig::default().sweep_interval
        } else {
            self.config.sweep_interval
        };
        let mut ticker = tokio::time::interval(period);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.sweep_at(Instant::now()).await;
                    if summary != SweepSummary::default() {
                        info!(
                            compatible = summary.compatible,
                            incompatible = summary.incompatible,
                            dropped = summary.dropped,
                            "safe-mode sweep resolved pods"
                        );
                    }
                }
            }
        }
        info!("safe-mode sweep stopped");
    }
}
