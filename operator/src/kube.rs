//! Minimal Kubernetes API access.
//!
//! Only the three calls the operator needs: patching the agent-compatible
//! label on a workload's config map, listing those labels at startup, and
//! creating `OperatorCommand` objects. Outside a cluster every call is a
//! logged no-op.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use shared_types::{OperatorCommand, Wlid, WlidError};
use tracing::{debug, info};

pub const AGENT_COMPATIBLE_LABEL: &str = "kubescape.io/agent-compatible";
pub const WLID_ANNOTATION: &str = "kubescape.io/wlid";

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const OPERATOR_COMMANDS_PLURAL: &str = "operatorcommands";

#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("invalid workload id: {0}")]
    Wlid(#[from] WlidError),
    #[error("kubernetes request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("kubernetes API returned {status} for {what}: {body}")]
    Api {
        status: u16,
        what: String,
        body: String,
    },
    #[error("in-cluster configuration unavailable: {0}")]
    Config(String),
    #[error("kubernetes access is disabled")]
    Disabled,
}

/// Records agent compatibility on workloads.
#[async_trait]
pub trait WorkloadLabeler: Send + Sync {
    async fn set_agent_compatible(&self, wlid: &str, compatible: bool) -> Result<(), KubeError>;

    /// `(wlid, compatible)` for every labelled workload.
    async fn list_agent_compatibility(&self) -> Result<Vec<(String, bool)>, KubeError>;
}

/// Creates administrative command objects.
#[async_trait]
pub trait OperatorCommandSink: Send + Sync {
    async fn create_operator_command(&self, command: &OperatorCommand) -> Result<(), KubeError>;
}

/// REST client using the pod's service account.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
}

impl KubeClient {
    pub fn in_cluster(namespace: &str) -> Result<Self, KubeError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeError::Config("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let token = std::fs::read_to_string(TOKEN_PATH)
            .map_err(|e| KubeError::Config(format!("reading {TOKEN_PATH}: {e}")))?;
        let ca = std::fs::read(CA_PATH)
            .map_err(|e| KubeError::Config(format!("reading {CA_PATH}: {e}")))?;
        let client = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            token: token.trim().to_string(),
            namespace: namespace.to_string(),
        })
    }

    async fn check(res: reqwest::Response, what: String) -> Result<reqwest::Response, KubeError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(KubeError::Api { status, what, body })
    }
}

#[async_trait]
impl WorkloadLabeler for KubeClient {
    async fn set_agent_compatible(&self, wlid: &str, compatible: bool) -> Result<(), KubeError> {
        let name = Wlid::parse(wlid)?.config_map_name();
        let url = format!(
            "{}/api/v1/namespaces/{}/configmaps/{}",
            self.base_url, self.namespace, name
        );
        let res = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(&compatible_label_patch(compatible))?)
            .send()
            .await?;
        Self::check(res, format!("configmap {name}")).await?;
        debug!(wlid, configmap = %name, compatible, "agent-compatible label updated");
        Ok(())
    }

    async fn list_agent_compatibility(&self) -> Result<Vec<(String, bool)>, KubeError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/configmaps",
            self.base_url, self.namespace
        );
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("labelSelector", AGENT_COMPATIBLE_LABEL)])
            .send()
            .await?;
        let list: ConfigMapList = Self::check(res, "configmap list".to_string())
            .await?
            .json()
            .await?;
        Ok(compatibility_from_items(list.items))
    }
}

#[async_trait]
impl OperatorCommandSink for KubeClient {
    async fn create_operator_command(&self, command: &OperatorCommand) -> Result<(), KubeError> {
        let url = format!(
            "{}/apis/{}/namespaces/{}/{}",
            self.base_url, command.api_version, command.metadata.namespace, OPERATOR_COMMANDS_PLURAL
        );
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(command)
            .send()
            .await?;
        Self::check(res, format!("operatorcommand {}", command.metadata.name)).await?;
        Ok(())
    }
}

/// Stand-in used when the operator runs outside a cluster.
pub struct DisabledKube;

#[async_trait]
impl WorkloadLabeler for DisabledKube {
    async fn set_agent_compatible(&self, wlid: &str, compatible: bool) -> Result<(), KubeError> {
        info!(wlid, compatible, "kubernetes disabled; skipping agent-compatible label");
        Ok(())
    }

    async fn list_agent_compatibility(&self) -> Result<Vec<(String, bool)>, KubeError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl OperatorCommandSink for DisabledKube {
    async fn create_operator_command(&self, command: &OperatorCommand) -> Result<(), KubeError> {
        info!(name = %command.metadata.name, "kubernetes disabled; not creating OperatorCommand");
        Err(KubeError::Disabled)
    }
}

fn compatible_label_patch(compatible: bool) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "labels": { AGENT_COMPATIBLE_LABEL: compatible.to_string() }
        }
    })
}

#[derive(Debug, Deserialize)]
struct ConfigMapList {
    #[serde(default)]
    items: Vec<ConfigMapItem>,
}

#[derive(Debug, Deserialize)]
struct ConfigMapItem {
    #[serde(default)]
    metadata: ConfigMapMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigMapMeta {
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

fn compatibility_from_items(items: Vec<ConfigMapItem>) -> Vec<(String, bool)> {
    items
        .into_iter()
        .filter_map(|item| {
            let meta = item.metadata;
            let wlid = meta.annotations.get(WLID_ANNOTATION)?;
            let compatible = match meta.labels.get(AGENT_COMPATIBLE_LABEL)?.as_str() {
                "true" => true,
                "false" => false,
                _ => return None,
            };
            Some((wlid.clone(), compatible))
        })
        .collect()
}
