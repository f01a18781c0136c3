//! Job status events.
//!
//! Every dispatched command carries a [`JobReporter`] stamped with its job
//! lineage. Reports go to the event receiver over HTTP; when no receiver is
//! configured a no-op sender is used instead.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{JobReport, JobStatus};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("event receiver rejected report with status {0}")]
    Rejected(reqwest::StatusCode),
    #[error("report sender unavailable: {0}")]
    Unavailable(String),
}

/// Destination for job status events.
#[async_trait]
pub trait ReportSender: Send + Sync {
    async fn send(&self, report: &JobReport) -> Result<(), ReportError>;
}

/// Posts reports as JSON to `{base}/k8s/sysreport`.
pub struct HttpReportSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReportSender {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/k8s/sysreport", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ReportSender for HttpReportSender {
    async fn send(&self, report: &JobReport) -> Result<(), ReportError> {
        let res = self.client.post(&self.endpoint).json(report).send().await?;
        if !res.status().is_success() {
            return Err(ReportError::Rejected(res.status()));
        }
        Ok(())
    }
}

/// Used when no event receiver is configured.
pub struct NoopReportSender;

#[async_trait]
impl ReportSender for NoopReportSender {
    async fn send(&self, report: &JobReport) -> Result<(), ReportError> {
        debug!(
            job_id = %report.job_id,
            target = %report.target,
            status = ?report.status,
            "event receiver not configured; dropping report"
        );
        Ok(())
    }
}

/// Lineage-stamped handle used to emit status events for one job action.
#[derive(Clone)]
pub struct JobReporter {
    sender: Arc<dyn ReportSender>,
    customer_guid: String,
    reporter: String,
    target: String,
    job_id: String,
    parent_action: String,
    action_number: u32,
    action_name: String,
    errors: Option<mpsc::UnboundedSender<ReportError>>,
}

impl JobReporter {
    pub fn new(sender: Arc<dyn ReportSender>, customer_guid: &str, reporter: &str) -> Self {
        Self {
            sender,
            customer_guid: customer_guid.to_string(),
            reporter: reporter.to_string(),
            target: String::new(),
            job_id: String::new(),
            parent_action: String::new(),
            action_number: 0,
            action_name: String::new(),
            errors: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_job(mut self, job_id: &str, parent_action: &str, action_number: u32) -> Self {
        self.job_id = job_id.to_string();
        self.parent_action = parent_action.to_string();
        self.action_number = action_number;
        self
    }

    pub fn with_action_name(mut self, action_name: impl Into<String>) -> Self {
        self.action_name = action_name.into();
        self
    }

    /// Delivery failures are pushed here in addition to being logged.
    pub fn with_error_sink(mut self, errors: mpsc::UnboundedSender<ReportError>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn build(&self, status: JobStatus, details: &str, errors: Vec<String>) -> JobReport {
        JobReport {
            customer_guid: self.customer_guid.clone(),
            reporter: self.reporter.clone(),
            target: self.target.clone(),
            job_id: self.job_id.clone(),
            parent_action: self.parent_action.clone(),
            action_number: self.action_number,
            action_name: self.action_name.clone(),
            status,
            details: details.to_string(),
            errors,
            timestamp: Utc::now(),
        }
    }

    pub async fn send_status(&self, status: JobStatus, details: &str) {
        let report = self.build(status, details, Vec::new());
        self.deliver(report).await;
    }

    pub async fn send_error(&self, error: &str) {
        let report = self.build(JobStatus::Failed, "", vec![error.to_string()]);
        self.deliver(report).await;
    }

    async fn deliver(&self, report: JobReport) {
        if let Err(e) = self.sender.send(&report).await {
            warn!(
                job_id = %report.job_id,
                target = %report.target,
                error = %e,
                "failed to send job report"
            );
            if let Some(errors) = &self.errors {
                let _ = errors.send(e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSender;
    use super::*;

    #[tokio::test]
    async fn test_report_carries_lineage() {
        let sender = Arc::new(RecordingSender::default());
        let reporter = JobReporter::new(sender.clone(), "acct", "WebSocket")
            .with_target("wlid://cluster-x/namespace-y/deployment-z")
            .with_job("job-1", "parent-1", 3)
            .with_action_name("scan");

        reporter.send_status(JobStatus::Done, "finished").await;

        let reports = sender.reports.lock().await;
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.customer_guid, "acct");
        assert_eq!(r.reporter, "WebSocket");
        assert_eq!(r.job_id, "job-1");
        assert_eq!(r.parent_action, "parent-1");
        assert_eq!(r.action_number, 3);
        assert_eq!(r.action_name, "scan");
        assert_eq!(r.status, JobStatus::Done);
        assert_eq!(r.details, "finished");
    }

    #[tokio::test]
    async fn test_delivery_failure_goes_to_error_sink() {
        let sender = Arc::new(RecordingSender::failing());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = JobReporter::new(sender, "acct", "RestAPI").with_error_sink(tx);

        reporter.send_error("boom").await;

        let err = rx.try_recv().expect("delivery error should be forwarded");
        assert!(matches!(err, ReportError::Unavailable(_)));
    }

    #[test]
    fn test_http_sender_endpoint() {
        let sender = HttpReportSender::new(reqwest::Client::new(), "http://receiver:8080/");
        assert_eq!(sender.endpoint, "http://receiver:8080/k8s/sysreport");
    }
}
