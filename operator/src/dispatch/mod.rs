//! Session construction and the bounded dispatch queue.
//!
//! Commands from both intake paths (notification router and REST API) are
//! wrapped in a [`SessionObj`] carrying final job lineage and a status
//! reporter, then pushed onto a single bounded queue drained by the worker
//! pool in [`worker`].

pub mod worker;

use std::sync::Arc;

use shared_types::{Command, DESIGNATORS_TOKEN};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::reporter::{JobReporter, ReportError, ReportSender};

pub use worker::{run_worker_pool, CommandExecutor, ExecuteError, LoggingExecutor};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue closed; dropping command '{0}'")]
    Closed(String),
}

/// A command paired with its status reporter, ready for execution.
pub struct SessionObj {
    pub command: Command,
    pub reporter: JobReporter,
    /// Report delivery failures, when the session was built with a channel.
    pub errors: Option<mpsc::UnboundedReceiver<ReportError>>,
}

impl SessionObj {
    pub fn with_error_channel(mut self) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reporter = self.reporter.with_error_sink(tx);
        self.errors = Some(rx);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.command.job_tracking.job_id
    }

    pub fn action_number(&self) -> u32 {
        self.command.job_tracking.last_action_number
    }
}

/// Builds sessions for one cluster.
#[derive(Clone)]
pub struct SessionFactory {
    customer_guid: String,
    cluster_name: String,
    sender: Arc<dyn ReportSender>,
}

impl SessionFactory {
    pub fn new(customer_guid: &str, cluster_name: &str, sender: Arc<dyn ReportSender>) -> Self {
        Self {
            customer_guid: customer_guid.to_string(),
            cluster_name: cluster_name.to_string(),
            sender,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Reporter not bound to any command, used for safe-mode status events.
    pub fn reporter(&self, reporter_name: &str, target: &str, job_id: &str) -> JobReporter {
        JobReporter::new(self.sender.clone(), &self.customer_guid, reporter_name)
            .with_target(target)
            .with_job(job_id, "", 0)
    }

    /// Stamp final lineage onto `command` and attach a reporter.
    ///
    /// An empty `job_id` gets a fresh UUID. `action_number` is stored as the
    /// command's action number and reported as-is.
    pub fn session(
        &self,
        mut command: Command,
        reporter_name: &str,
        parent_id: &str,
        job_id: &str,
        action_number: u32,
    ) -> SessionObj {
        let job_id = if job_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            job_id.to_string()
        };
        command.job_tracking.parent_id = parent_id.to_string();
        command.job_tracking.job_id = job_id.clone();
        command.job_tracking.last_action_number = action_number;

        let reporter = JobReporter::new(self.sender.clone(), &self.customer_guid, reporter_name)
            .with_target(self.report_target(&command))
            .with_job(&job_id, parent_id, action_number)
            .with_action_name(command.name.as_str());

        SessionObj {
            command,
            reporter,
            errors: None,
        }
    }

    fn report_target(&self, command: &Command) -> String {
        match command.id() {
            "" => serde_json::Value::Object(command.args.clone()).to_string(),
            DESIGNATORS_TOKEN => format!("wlid://cluster-{}/", self.cluster_name),
            id => id.to_string(),
        }
    }
}

/// Producer handle of the bounded dispatch queue.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<SessionObj>,
}

impl DispatchQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<SessionObj>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Waits for capacity when the queue is full.
    pub async fn submit(&self, session: SessionObj) -> Result<(), DispatchError> {
        self.tx
            .send(session)
            .await
            .map_err(|e| DispatchError::Closed(e.0.command.name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_support::RecordingSender;
    use shared_types::{CommandName, JobTracking};

    fn factory() -> SessionFactory {
        SessionFactory::new("acct", "prod", Arc::new(RecordingSender::default()))
    }

    #[test]
    fn test_session_assigns_job_id_when_missing() {
        let session = factory().session(
            Command {
                name: CommandName::Scan,
                ..Default::default()
            },
            "WebSocket",
            "",
            "",
            1,
        );
        assert!(Uuid::parse_str(session.job_id()).is_ok());
        assert_eq!(session.reporter.job_id(), session.job_id());
        assert_eq!(session.action_number(), 1);
    }

    #[test]
    fn test_session_keeps_lineage() {
        let command = Command {
            name: CommandName::Update,
            wlid: "wlid://cluster-prod/namespace-a/deployment-b".to_string(),
            job_tracking: JobTracking {
                parent_id: "p".to_string(),
                job_id: "j".to_string(),
                last_action_number: 2,
            },
            ..Default::default()
        };
        let session = factory().session(command, "RestAPI", "p", "j", 3);
        assert_eq!(session.job_id(), "j");
        assert_eq!(session.command.job_tracking.parent_id, "p");
        assert_eq!(session.action_number(), 3);
        assert_eq!(
            session.reporter.target(),
            "wlid://cluster-prod/namespace-a/deployment-b"
        );
    }

    #[test]
    fn test_report_target_for_designators_and_args() {
        let f = factory();
        let designators = Command {
            wlid: DESIGNATORS_TOKEN.to_string(),
            ..Default::default()
        };
        assert_eq!(f.report_target(&designators), "wlid://cluster-prod/");

        let mut args = serde_json::Map::new();
        args.insert("registry".to_string(), serde_json::json!("quay.io"));
        let by_args = Command {
            args,
            ..Default::default()
        };
        assert_eq!(f.report_target(&by_args), r#"{"registry":"quay.io"}"#);
    }

    #[tokio::test]
    async fn test_submit_preserves_order() {
        let (queue, mut rx) = DispatchQueue::bounded(4);
        let f = factory();
        for name in [CommandName::Scan, CommandName::Restart] {
            let cmd = Command {
                name,
                ..Default::default()
            };
            queue.submit(f.session(cmd, "WebSocket", "", "", 1)).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().command.name, CommandName::Scan);
        assert_eq!(rx.recv().await.unwrap().command.name, CommandName::Restart);
    }

    #[tokio::test]
    async fn test_submit_to_closed_queue_fails() {
        let (queue, rx) = DispatchQueue::bounded(1);
        drop(rx);
        let session = factory().session(
            Command {
                name: CommandName::Scan,
                ..Default::default()
            },
            "WebSocket",
            "",
            "",
            1,
        );
        let err = queue.submit(session).await.unwrap_err();
        assert!(matches!(err, DispatchError::Closed(name) if name == "scan"));
    }
}
