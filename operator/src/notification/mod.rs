//! Control-plane notification channel.
//!
//! A [`supervisor::ConnectionSupervisor`] owns one websocket connection. It
//! keeps it alive with periodic pings, reconnects with a linear backoff, and
//! hands every decoded [`NotificationEnvelope`] to an [`EnvelopeHandler`].

pub mod decoder;
pub mod router;
pub mod supervisor;
pub mod transport;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

pub use router::{CommandRouter, RouteError, SafeModeForwarder};
pub use supervisor::{Backoff, ConnectionState, ConnectionSupervisor, SupervisorConfig};
pub use transport::{Transport, TransportError, WebsocketTransport};

pub const WEBSOCKET_PATH: &str = "/v1/waitfornotification";
/// Component name of the command connection.
pub const COMPONENT_TRIGGER: &str = "trigger";
/// Component name of the safe-mode connection.
pub const COMPONENT_SAFE_MODE: &str = "logger";

/// Body of a notification: structured JSON or opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Interpret the payload as `T`. Byte payloads are parsed as JSON text.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => T::deserialize(value),
            Payload::Bytes(bytes) => serde_json::from_slice(bytes),
        }
    }
}

/// Where an envelope should be routed, from its `dest` target key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Trigger,
    Other(String),
    Missing,
}

impl Destination {
    pub fn from_dest(dest: Option<&str>) -> Self {
        match dest {
            Some("trigger") | Some("kubescape") => Destination::Trigger,
            Some(other) => Destination::Other(other.to_string()),
            None => Destination::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEnvelope {
    pub target: HashMap<String, String>,
    pub notification: Payload,
}

impl NotificationEnvelope {
    pub fn destination(&self) -> Destination {
        Destination::from_dest(self.target.get("dest").map(String::as_str))
    }
}

/// Consumer of decoded envelopes.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle_envelope(&self, envelope: NotificationEnvelope) -> Result<(), RouteError>;
}

/// Build the notification server URL for `component`.
///
/// `host` may carry a `ws://` or `wss://` prefix; without one `ws` is used.
/// An empty host means the connection is disabled.
pub fn notification_server_url(
    host: &str,
    account_id: &str,
    cluster_name: &str,
    component: &str,
) -> Result<Option<Url>, url::ParseError> {
    let host = host.trim();
    if host.is_empty() {
        return Ok(None);
    }
    let (scheme, rest) = if let Some(rest) = host.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = host.strip_prefix("ws://") {
        ("ws", rest)
    } else {
        ("ws", host)
    };

    let mut url = Url::parse(&format!("{scheme}://{rest}"))?;
    url.set_path(WEBSOCKET_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair("customerGUID", account_id)
        .append_pair("clusterName", cluster_name)
        .append_pair("clusterComponent", component);
    Ok(Some(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Commands;

    #[test]
    fn test_url_defaults_to_ws() {
        let url = notification_server_url("gateway:8001", "acct", "prod", COMPONENT_TRIGGER)
            .unwrap()
            .unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), WEBSOCKET_PATH);
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["customerGUID"], "acct");
        assert_eq!(query["clusterName"], "prod");
        assert_eq!(query["clusterComponent"], "trigger");
    }

    #[test]
    fn test_url_keeps_wss_prefix() {
        let url = notification_server_url("wss://gw.example.com", "a", "c", COMPONENT_SAFE_MODE)
            .unwrap()
            .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("gw.example.com"));
    }

    #[test]
    fn test_empty_host_disables_connection() {
        assert!(notification_server_url("", "a", "c", COMPONENT_TRIGGER)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_destination_aliases() {
        assert_eq!(Destination::from_dest(Some("trigger")), Destination::Trigger);
        assert_eq!(Destination::from_dest(Some("kubescape")), Destination::Trigger);
        assert_eq!(
            Destination::from_dest(Some("vuln-scan")),
            Destination::Other("vuln-scan".to_string())
        );
        assert_eq!(Destination::from_dest(None), Destination::Missing);
    }

    #[test]
    fn test_bytes_payload_parses_as_json() {
        let payload = Payload::Bytes(br#"{"commands":[{"commandName":"scan"}]}"#.to_vec());
        let cmds: Commands = payload.parse().unwrap();
        assert_eq!(cmds.commands.len(), 1);
    }
}
