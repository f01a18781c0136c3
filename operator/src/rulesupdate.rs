//! Periodic runtime rule refresh: creates an `OperatorCommand` asking node
//! agents to reload their rules.

use std::{collections::HashMap, sync::Arc, time::Duration};

use shared_types::{
    ObjectMeta, OperatorCommand, OperatorCommandSpec, OPERATOR_COMMAND_API_VERSION,
    OPERATOR_COMMAND_KIND, OPERATOR_COMMAND_TYPE_RUNTIME_UPDATE_RULES,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    config::RulesUpdateConfig,
    kube::{KubeError, OperatorCommandSink},
};

pub const UPDATE_RULES_COMMAND_VERSION: &str = "v1";
pub const APP_NAME_LABEL: &str = "kubescape.io/app-name";
pub const NODE_NAME_LABEL: &str = "kubescape.io/node-name";

#[derive(Debug, thiserror::Error)]
pub enum RulesUpdateError {
    #[error("error creating OperatorCommand: {0}")]
    Create(#[from] KubeError),
}

pub struct RulesUpdater {
    sink: Arc<dyn OperatorCommandSink>,
    interval: Duration,
    namespace: String,
}

impl RulesUpdater {
    pub fn new(sink: Arc<dyn OperatorCommandSink>, config: &RulesUpdateConfig) -> Self {
        Self {
            sink,
            interval: config.interval,
            namespace: config.namespace.clone(),
        }
    }

    pub fn build_command(&self) -> OperatorCommand {
        let guid = Uuid::new_v4().to_string();
        OperatorCommand {
            api_version: OPERATOR_COMMAND_API_VERSION.to_string(),
            kind: OPERATOR_COMMAND_KIND.to_string(),
            metadata: ObjectMeta {
                name: format!("update-rules-{}", &guid[..8]),
                namespace: self.namespace.clone(),
                labels: HashMap::from([
                    (APP_NAME_LABEL.to_string(), "node-agent".to_string()),
                    (NODE_NAME_LABEL.to_string(), "operator".to_string()),
                ]),
            },
            spec: OperatorCommandSpec {
                guid,
                command_type: OPERATOR_COMMAND_TYPE_RUNTIME_UPDATE_RULES.to_string(),
                command_version: UPDATE_RULES_COMMAND_VERSION.to_string(),
            },
        }
    }

    pub async fn send_update_rules_command(&self) -> Result<OperatorCommand, RulesUpdateError> {
        let command = self.build_command();
        self.sink.create_operator_command(&command).await?;
        Ok(command)
    }

    /// Send one command per interval until cancelled. A send already in
    /// flight completes before the loop observes cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "rules updater started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
            match self.send_update_rules_command().await {
                Ok(command) => info!(name = %command.metadata.name, "OperatorCommand created"),
                Err(e) => error!(error = %e, "failed to send rules update"),
            }
        }
        info!("rules updater stopped");
    }
}
