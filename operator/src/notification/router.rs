use async_trait::async_trait;
use shared_types::{Commands, SafeModeReport};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Destination, EnvelopeHandler, NotificationEnvelope};
use crate::dispatch::{DispatchError, DispatchQueue, SessionFactory};

/// Reporter name for commands received over the notification connection.
pub const WEBSOCKET_REPORTER: &str = "WebSocket";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("failed to convert notification to commands: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("safe-mode tracker is not accepting reports")]
    TrackerClosed,
}

/// Routes trigger notifications to the dispatch queue.
pub struct CommandRouter {
    sessions: SessionFactory,
    dispatch: DispatchQueue,
}

impl CommandRouter {
    pub fn new(sessions: SessionFactory, dispatch: DispatchQueue) -> Self {
        Self { sessions, dispatch }
    }

    /// Submit every command in order. The action number is advanced by one
    /// and a missing job id is generated.
    pub async fn route_commands(&self, commands: Commands) -> Result<usize, RouteError> {
        let mut routed = 0;
        for command in commands.commands {
            let lineage = command.job_tracking.clone();
            let session = self
                .sessions
                .session(
                    command,
                    WEBSOCKET_REPORTER,
                    &lineage.parent_id,
                    &lineage.job_id,
                    lineage.last_action_number.saturating_add(1),
                )
                .with_error_channel();
            debug!(
                command = %session.command.name,
                job_id = %session.job_id(),
                "routing command"
            );
            self.dispatch.submit(session).await?;
            routed += 1;
        }
        Ok(routed)
    }
}

#[async_trait]
impl EnvelopeHandler for CommandRouter {
    async fn handle_envelope(&self, envelope: NotificationEnvelope) -> Result<(), RouteError> {
        match envelope.destination() {
            Destination::Trigger => {
                let commands: Commands = envelope.notification.parse()?;
                let routed = self.route_commands(commands).await?;
                info!(routed, "trigger notification dispatched");
            }
            other => debug!(destination = ?other, "ignoring notification"),
        }
        Ok(())
    }
}

/// Forwards every envelope on the safe-mode connection to the tracker.
pub struct SafeModeForwarder {
    reports: mpsc::Sender<SafeModeReport>,
}

impl SafeModeForwarder {
    pub fn new(reports: mpsc::Sender<SafeModeReport>) -> Self {
        Self { reports }
    }
}

#[async_trait]
impl EnvelopeHandler for SafeModeForwarder {
    async fn handle_envelope(&self, envelope: NotificationEnvelope) -> Result<(), RouteError> {
        let report: SafeModeReport = envelope.notification.parse()?;
        self.reports
            .send(report)
            .await
            .map_err(|_| RouteError::TrackerClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Payload;
    use crate::reporter::test_support::RecordingSender;
    use shared_types::{CommandName, ReporterKind};
    use std::{collections::HashMap, sync::Arc};

    fn envelope(dest: &str, body: serde_json::Value) -> NotificationEnvelope {
        NotificationEnvelope {
            target: HashMap::from([("dest".to_string(), dest.to_string())]),
            notification: Payload::Json(body),
        }
    }

    fn router(capacity: usize) -> (CommandRouter, mpsc::Receiver<crate::dispatch::SessionObj>) {
        let factory = SessionFactory::new("acct", "prod", Arc::new(RecordingSender::default()));
        let (queue, rx) = DispatchQueue::bounded(capacity);
        (CommandRouter::new(factory, queue), rx)
    }

    #[tokio::test]
    async fn test_trigger_advances_action_number() {
        let (router, mut rx) = router(4);
        let body = serde_json::json!({"commands": [
            {"commandName": "scan", "jobTracking": {"jobID": "j", "parentID": "p", "lastActionNumber": 2}},
            {"commandName": "restart"}
        ]});
        router.handle_envelope(envelope("trigger", body)).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.command.name, CommandName::Scan);
        assert_eq!(first.job_id(), "j");
        assert_eq!(first.action_number(), 3);
        assert!(first.errors.is_some());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.command.name, CommandName::Restart);
        assert_eq!(second.action_number(), 1);
        assert!(!second.job_id().is_empty());
    }

    #[tokio::test]
    async fn test_kubescape_alias_routes_like_trigger() {
        let (router, mut rx) = router(1);
        let body = serde_json::json!({"commands": [{"commandName": "scan"}]});
        router.handle_envelope(envelope("kubescape", body)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().command.name, CommandName::Scan);
    }

    #[tokio::test]
    async fn test_unknown_destination_is_ignored() {
        let (router, mut rx) = router(1);
        let body = serde_json::json!({"commands": [{"commandName": "scan"}]});
        router.handle_envelope(envelope("vuln-scan", body)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_commands_rejected() {
        let (router, _rx) = router(1);
        let err = router
            .handle_envelope(envelope("trigger", serde_json::json!({"commands": "nope"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Payload(_)));
    }

    #[tokio::test]
    async fn test_forwarder_delivers_report() {
        let (tx, mut rx) = mpsc::channel(1);
        let forwarder = SafeModeForwarder::new(tx);
        let body = serde_json::json!({
            "reporter": "agent",
            "wlid": "wlid://cluster-a/namespace-b/deployment-c",
            "instanceID": "i-1",
            "statusCode": 1
        });
        forwarder.handle_envelope(envelope("", body)).await.unwrap();
        let report = rx.recv().await.unwrap();
        assert_eq!(report.reporter, ReporterKind::Agent);
        assert_eq!(report.status_code, 1);
    }
}
