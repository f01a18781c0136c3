//! Shared wire types for the cluster operator
//!
//! These types are used by:
//! - the notification pipeline (commands received from the control plane)
//! - the REST API (trigger and safe-mode endpoints)
//! - the safe-mode tracker and the rules update trigger
//!
//! Serializable with serde for JSON (and BSON) over WebSocket/HTTP

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands
// ============================================================================

/// Placeholder target used by commands addressed through designators
/// instead of a concrete workload identifier.
pub const DESIGNATORS_TOKEN: &str = "designators";

/// Name of a command routed to the worker pool.
///
/// Known names get their own variant; anything else is carried verbatim so
/// newer control planes can still reach executors that understand them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandName {
    Scan,
    Update,
    Restart,
    Remove,
    Incompatible,
    KubescapeScan,
    ScanRegistry,
    Other(String),
}

impl CommandName {
    pub fn as_str(&self) -> &str {
        match self {
            CommandName::Scan => "scan",
            CommandName::Update => "update",
            CommandName::Restart => "restart",
            CommandName::Remove => "remove",
            CommandName::Incompatible => "incompatible",
            CommandName::KubescapeScan => "kubescapeScan",
            CommandName::ScanRegistry => "scanRegistry",
            CommandName::Other(name) => name,
        }
    }

    /// A command without a name cannot be routed to any executor.
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl Default for CommandName {
    fn default() -> Self {
        CommandName::Other(String::new())
    }
}

impl From<String> for CommandName {
    fn from(value: String) -> Self {
        match value.as_str() {
            "scan" => CommandName::Scan,
            "update" => CommandName::Update,
            "restart" => CommandName::Restart,
            "remove" => CommandName::Remove,
            "incompatible" => CommandName::Incompatible,
            "kubescapeScan" => CommandName::KubescapeScan,
            "scanRegistry" => CommandName::ScanRegistry,
            _ => CommandName::Other(value),
        }
    }
}

impl From<CommandName> for String {
    fn from(value: CommandName) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lineage attached to every command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTracking {
    #[serde(rename = "parentID", default)]
    pub parent_id: String,
    #[serde(rename = "jobID", default)]
    pub job_id: String,
    #[serde(rename = "lastActionNumber", default)]
    pub last_action_number: u32,
}

/// A single operational command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "commandName", default)]
    pub name: CommandName,
    #[serde(rename = "responseID", default, skip_serializing_if = "String::is_empty")]
    pub response_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wlid: String,
    #[serde(rename = "wildWlid", default, skip_serializing_if = "String::is_empty")]
    pub wild_wlid: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "jobTracking", default)]
    pub job_tracking: JobTracking,
}

impl Command {
    /// Target identifier of the command: the workload id, falling back to
    /// the wildcard workload id.
    pub fn id(&self) -> &str {
        if !self.wlid.is_empty() {
            &self.wlid
        } else {
            &self.wild_wlid
        }
    }
}

/// Body of a trigger notification and of `POST /v1/triggerAction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub commands: Vec<Command>,
}

// ============================================================================
// Workload identifiers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WlidError {
    #[error("empty workload id")]
    Empty,
    #[error("workload id '{0}' contains whitespace")]
    Whitespace(String),
    #[error("workload id '{0}' is not of the form wlid://cluster-<c>/namespace-<ns>/<kind>-<name>")]
    Format(String),
}

/// Parsed workload identifier: `wlid://cluster-<c>/namespace-<ns>/<kind>-<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Wlid {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl Wlid {
    pub const PREFIX: &'static str = "wlid://";

    pub fn parse(raw: &str) -> Result<Self, WlidError> {
        if raw.is_empty() {
            return Err(WlidError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(WlidError::Whitespace(raw.to_string()));
        }
        let format_err = || WlidError::Format(raw.to_string());

        let body = raw.strip_prefix(Self::PREFIX).unwrap_or(raw);
        let parts: Vec<&str> = body.split('/').collect();
        let [cluster, namespace, workload] = parts.as_slice() else {
            return Err(format_err());
        };
        let cluster = cluster.strip_prefix("cluster-").ok_or_else(format_err)?;
        let namespace = namespace.strip_prefix("namespace-").ok_or_else(format_err)?;
        let (kind, name) = workload.split_once('-').ok_or_else(format_err)?;
        if [cluster, namespace, kind, name].iter().any(|s| s.is_empty()) {
            return Err(format_err());
        }

        Ok(Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    /// Name of the config map that carries the agent-compatible label for
    /// this workload. Kubernetes object names are capped at 63 characters.
    pub fn config_map_name(&self) -> String {
        let mut name = format!("ca-{}-{}-{}", self.namespace, self.kind, self.name).to_lowercase();
        let mut cut = name.len().min(63);
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
        name.trim_end_matches('-').to_string()
    }
}

impl fmt::Display for Wlid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}cluster-{}/namespace-{}/{}-{}",
            Self::PREFIX,
            self.cluster,
            self.namespace,
            self.kind,
            self.name
        )
    }
}

// ============================================================================
// Safe mode
// ============================================================================

/// Who produced a safe-mode report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReporterKind {
    /// The runtime agent inside the workload container.
    Agent,
    /// The admission webhook.
    Webhook,
    /// The init container; signals that a pod started.
    InitContainer,
    Other(String),
}

impl From<String> for ReporterKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            // "agnet" is still sent by older agents
            "agent" | "Agent" | "agnet" => ReporterKind::Agent,
            "webhook" | "Webhook" => ReporterKind::Webhook,
            "init-container" | "Init-container" => ReporterKind::InitContainer,
            _ => ReporterKind::Other(value),
        }
    }
}

impl From<ReporterKind> for String {
    fn from(value: ReporterKind) -> Self {
        match value {
            ReporterKind::Agent => "agent".to_string(),
            ReporterKind::Webhook => "webhook".to_string(),
            ReporterKind::InitContainer => "Init-container".to_string(),
            ReporterKind::Other(other) => other,
        }
    }
}

impl Default for ReporterKind {
    fn default() -> Self {
        ReporterKind::Other(String::new())
    }
}

impl fmt::Display for ReporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// Status report from a workload about its runtime agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeModeReport {
    #[serde(default)]
    pub reporter: ReporterKind,
    #[serde(default)]
    pub wlid: String,
    #[serde(rename = "instanceID", default)]
    pub instance_id: String,
    #[serde(rename = "statusCode", default)]
    pub status_code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "jobID", default)]
    pub job_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(rename = "podName", default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(rename = "containerName", default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
}

// ============================================================================
// Status events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Done,
    Failed,
}

/// Status event describing the progress of one job action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    #[serde(rename = "customerGUID")]
    pub customer_guid: String,
    pub reporter: String,
    pub target: String,
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub parent_action: String,
    #[serde(rename = "actionIDN")]
    pub action_number: u32,
    pub action_name: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Administrative commands
// ============================================================================

pub const OPERATOR_COMMAND_API_VERSION: &str = "kubescape.io/v1alpha1";
pub const OPERATOR_COMMAND_KIND: &str = "OperatorCommand";
pub const OPERATOR_COMMAND_TYPE_RUNTIME_UPDATE_RULES: &str = "RuntimeUpdateRules";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCommandSpec {
    pub guid: String,
    pub command_type: String,
    pub command_version: String,
}

/// Cluster custom resource consumed by node agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCommand {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: OperatorCommandSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_from_control_plane_json() {
        let raw = r#"{"commands":[{"commandName":"scan","responseID":"r1",
            "wlid":"wlid://cluster-x/namespace-y/deployment-z",
            "args":{"k":"v"},
            "jobTracking":{"parentID":"p","jobID":"j","lastActionNumber":4}}]}"#;
        let cmds: Commands = serde_json::from_str(raw).unwrap();
        assert_eq!(cmds.commands.len(), 1);
        let cmd = &cmds.commands[0];
        assert_eq!(cmd.name, CommandName::Scan);
        assert_eq!(cmd.response_id, "r1");
        assert_eq!(cmd.job_tracking.parent_id, "p");
        assert_eq!(cmd.job_tracking.job_id, "j");
        assert_eq!(cmd.job_tracking.last_action_number, 4);
        assert_eq!(cmd.args["k"], "v");
    }

    #[test]
    fn test_unknown_command_name_is_preserved() {
        let cmd: Command = serde_json::from_str(r#"{"commandName":"setSecurityPolicy"}"#).unwrap();
        assert_eq!(cmd.name, CommandName::Other("setSecurityPolicy".to_string()));
        let back = serde_json::to_value(&cmd).unwrap();
        assert_eq!(back["commandName"], "setSecurityPolicy");
    }

    #[test]
    fn test_missing_command_name_is_empty() {
        let cmd: Command = serde_json::from_str(r#"{"wlid":"x"}"#).unwrap();
        assert!(cmd.name.is_empty());
        assert_eq!(cmd.job_tracking, JobTracking::default());
    }

    #[test]
    fn test_command_id_falls_back_to_wild_wlid() {
        let cmd = Command {
            wild_wlid: "wlid://cluster-x/namespace-y".to_string(),
            ..Default::default()
        };
        assert_eq!(cmd.id(), "wlid://cluster-x/namespace-y");
    }

    #[test]
    fn test_wlid_parse_and_display() {
        let wlid = Wlid::parse("wlid://cluster-x/namespace-y/deployment-my-app").unwrap();
        assert_eq!(wlid.cluster, "x");
        assert_eq!(wlid.namespace, "y");
        assert_eq!(wlid.kind, "deployment");
        assert_eq!(wlid.name, "my-app");
        assert_eq!(wlid.to_string(), "wlid://cluster-x/namespace-y/deployment-my-app");
    }

    #[test]
    fn test_wlid_rejects_malformed() {
        assert_eq!(Wlid::parse(""), Err(WlidError::Empty));
        assert!(matches!(Wlid::parse("wlid://cluster-x/namespace-y"), Err(WlidError::Format(_))));
        assert!(matches!(Wlid::parse("wlid://cluster-x/ns-y/deployment-z"), Err(WlidError::Format(_))));
        assert!(matches!(Wlid::parse("wlid://cluster-x/namespace-y/deployment z"), Err(WlidError::Whitespace(_))));
    }

    #[test]
    fn test_config_map_name_is_bounded() {
        let wlid = Wlid::parse(&format!(
            "wlid://cluster-x/namespace-Prod/Deployment-{}",
            "a".repeat(80)
        ))
        .unwrap();
        let name = wlid.config_map_name();
        assert!(name.len() <= 63);
        assert!(name.starts_with("ca-prod-deployment-"));
    }

    #[test]
    fn test_config_map_name_cuts_on_char_boundary() {
        let wlid = Wlid::parse(&format!(
            "wlid://cluster-a/namespace-b/deployment-{}é",
            "a".repeat(46)
        ))
        .unwrap();
        let name = wlid.config_map_name();
        assert_eq!(name.len(), 62);
        assert!(name.ends_with('a'));
    }

    #[test]
    fn test_reporter_kind_aliases() {
        let r: SafeModeReport = serde_json::from_str(r#"{"reporter":"agnet"}"#).unwrap();
        assert_eq!(r.reporter, ReporterKind::Agent);
        let r: SafeModeReport = serde_json::from_str(r#"{"reporter":"Init-container"}"#).unwrap();
        assert_eq!(r.reporter, ReporterKind::InitContainer);
        let r: SafeModeReport = serde_json::from_str(r#"{"reporter":"webhook"}"#).unwrap();
        assert_eq!(r.reporter, ReporterKind::Webhook);
    }

    #[test]
    fn test_operator_command_serialization() {
        let cmd = OperatorCommand {
            api_version: OPERATOR_COMMAND_API_VERSION.to_string(),
            kind: OPERATOR_COMMAND_KIND.to_string(),
            metadata: ObjectMeta {
                name: "update-rules-1234abcd".to_string(),
                namespace: "kubescape".to_string(),
                labels: HashMap::new(),
            },
            spec: OperatorCommandSpec {
                guid: "g".to_string(),
                command_type: OPERATOR_COMMAND_TYPE_RUNTIME_UPDATE_RULES.to_string(),
                command_version: "v1".to_string(),
            },
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["apiVersion"], "kubescape.io/v1alpha1");
        assert_eq!(json["kind"], "OperatorCommand");
        assert_eq!(json["spec"]["commandType"], "RuntimeUpdateRules");
        assert_eq!(json["spec"]["commandVersion"], "v1");
    }
}
