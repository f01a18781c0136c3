use std::sync::Arc;

use async_trait::async_trait;
use shared_types::JobStatus;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SessionObj;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("unsupported command '{0}'")]
    Unsupported(String),
    #[error("command failed: {0}")]
    Failed(String),
}

/// Executes one dispatched command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, session: &SessionObj) -> Result<(), ExecuteError>;
}

/// Accepts every named command and only logs it.
pub struct LoggingExecutor;

#[async_trait]
impl CommandExecutor for LoggingExecutor {
    async fn execute(&self, session: &SessionObj) -> Result<(), ExecuteError> {
        let command = &session.command;
        if command.name.is_empty() {
            return Err(ExecuteError::Unsupported(String::new()));
        }
        info!(
            command = %command.name,
            target = %command.id(),
            job_id = %session.job_id(),
            action = session.action_number(),
            "executing command"
        );
        Ok(())
    }
}

/// Drain the dispatch queue with `concurrency` workers until cancelled or
/// every producer has been dropped.
pub async fn run_worker_pool(
    rx: mpsc::Receiver<SessionObj>,
    executor: Arc<dyn CommandExecutor>,
    concurrency: usize,
    cancel: CancellationToken,
) {
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for worker_id in 0..concurrency.max(1) {
        workers.spawn(worker_loop(
            worker_id,
            rx.clone(),
            executor.clone(),
            cancel.clone(),
        ));
    }
    info!(concurrency, "worker pool started");

    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "worker task failed");
        }
    }
    info!("worker pool stopped");
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<SessionObj>>>,
    executor: Arc<dyn CommandExecutor>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            session = async { rx.lock().await.recv().await } => session,
        };
        let Some(mut session) = next else {
            debug!(worker_id, "worker exiting");
            return;
        };
        process(worker_id, executor.as_ref(), &mut session).await;
    }
}

async fn process(worker_id: usize, executor: &dyn CommandExecutor, session: &mut SessionObj) {
    session.reporter.send_status(JobStatus::Started, "").await;

    match executor.execute(session).await {
        Ok(()) => session.reporter.send_status(JobStatus::Done, "").await,
        Err(e) => {
            error!(
                worker_id,
                command = %session.command.name,
                job_id = %session.job_id(),
                error = %e,
                "command failed"
            );
            session.reporter.send_error(&e.to_string()).await;
        }
    }

    let job_id = session.job_id().to_string();
    if let Some(errors) = session.errors.as_mut() {
        while let Ok(e) = errors.try_recv() {
            warn!(worker_id, job_id = %job_id, error = %e, "status event was not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchQueue, SessionFactory};
    use crate::reporter::test_support::RecordingSender;
    use shared_types::{Command, CommandName};

    struct RejectingExecutor;

    #[async_trait]
    impl CommandExecutor for RejectingExecutor {
        async fn execute(&self, session: &SessionObj) -> Result<(), ExecuteError> {
            Err(ExecuteError::Unsupported(session.command.name.to_string()))
        }
    }

    async fn run_one(executor: Arc<dyn CommandExecutor>) -> Vec<JobStatus> {
        let sender = Arc::new(RecordingSender::default());
        let factory = SessionFactory::new("acct", "prod", sender.clone());
        let (queue, rx) = DispatchQueue::bounded(2);
        let session = factory.session(
            Command {
                name: CommandName::Scan,
                ..Default::default()
            },
            "WebSocket",
            "",
            "",
            1,
        );
        queue.submit(session).await.unwrap();
        drop(queue);

        run_worker_pool(rx, executor, 2, CancellationToken::new()).await;
        sender.statuses().await
    }

    #[tokio::test]
    async fn test_successful_command_reports_started_then_done() {
        let statuses = run_one(Arc::new(LoggingExecutor)).await;
        assert_eq!(statuses, vec![JobStatus::Started, JobStatus::Done]);
    }

    #[tokio::test]
    async fn test_failed_command_reports_error() {
        let statuses = run_one(Arc::new(RejectingExecutor)).await;
        assert_eq!(statuses, vec![JobStatus::Started, JobStatus::Failed]);
    }

    #[tokio::test]
    async fn test_undelivered_status_events_are_drained() {
        let sender = Arc::new(RecordingSender::failing());
        let factory = SessionFactory::new("acct", "prod", sender);
        let mut session = factory
            .session(
                Command {
                    name: CommandName::Scan,
                    ..Default::default()
                },
                "WebSocket",
                "",
                "job-9",
                1,
            )
            .with_error_channel();

        process(0, &LoggingExecutor, &mut session).await;

        let errors = session.errors.as_mut().expect("error channel");
        assert!(errors.try_recv().is_err());
        assert_eq!(session.job_id(), "job-9");
    }

    #[tokio::test]
    async fn test_pool_stops_on_cancel() {
        let (_queue, rx) = DispatchQueue::bounded(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            run_worker_pool(rx, Arc::new(LoggingExecutor), 3, cancel),
        )
        .await
        .expect("pool should stop once cancelled");
    }
}
