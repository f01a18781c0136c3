//! Envelope decoding. Messages arrive as either JSON or BSON; the first byte
//! picks which decoder is tried first and the other one is the fallback.

use std::{collections::HashMap, fmt};

use bson::Bson;
use serde::Deserialize;

use super::{NotificationEnvelope, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Bson,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Json => write!(f, "json"),
            Format::Bson => write!(f, "bson"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bson: {0}")]
    Bson(#[from] bson::de::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("message matched no known format ({})", join(.0))]
    Unrecognized(Vec<FormatError>),
}

fn join(errors: &[FormatError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Decoder order for a message starting with `first`.
pub fn decode_order(first: u8) -> [Format; 2] {
    match first {
        b'{' | b'[' | b'"' => [Format::Json, Format::Bson],
        _ => [Format::Bson, Format::Json],
    }
}

pub fn decode(bytes: &[u8]) -> Result<NotificationEnvelope, DecodeError> {
    let Some(&first) = bytes.first() else {
        return Err(DecodeError::Empty);
    };
    let mut failures = Vec::with_capacity(2);
    for format in decode_order(first) {
        let decoded = match format {
            Format::Json => decode_json(bytes),
            Format::Bson => decode_bson(bytes),
        };
        match decoded {
            Ok(envelope) => return Ok(envelope),
            Err(e) => failures.push(e),
        }
    }
    Err(DecodeError::Unrecognized(failures))
}

#[derive(Deserialize)]
struct JsonEnvelope {
    #[serde(default)]
    target: HashMap<String, String>,
    #[serde(default)]
    notification: serde_json::Value,
}

#[derive(Deserialize)]
struct BsonEnvelope {
    #[serde(default)]
    target: HashMap<String, String>,
    #[serde(default)]
    notification: Option<Bson>,
}

fn decode_json(bytes: &[u8]) -> Result<NotificationEnvelope, FormatError> {
    let env: JsonEnvelope = serde_json::from_slice(bytes)?;
    Ok(NotificationEnvelope {
        target: env.target,
        notification: Payload::Json(env.notification),
    })
}

fn decode_bson(bytes: &[u8]) -> Result<NotificationEnvelope, FormatError> {
    let env: BsonEnvelope = bson::from_slice(bytes)?;
    let notification = match env.notification {
        None | Some(Bson::Null) => Payload::Json(serde_json::Value::Null),
        Some(Bson::Binary(bin)) => Payload::Bytes(bin.bytes),
        Some(other) => Payload::Json(other.into_relaxed_extjson()),
    };
    Ok(NotificationEnvelope {
        target: env.target,
        notification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Destination;
    use bson::{doc, spec::BinarySubtype, Binary};
    use shared_types::{CommandName, Commands};

    #[test]
    fn test_decode_order_by_first_byte() {
        assert_eq!(decode_order(b'{'), [Format::Json, Format::Bson]);
        assert_eq!(decode_order(b'['), [Format::Json, Format::Bson]);
        assert_eq!(decode_order(b'"'), [Format::Json, Format::Bson]);
        assert_eq!(decode_order(0x45), [Format::Bson, Format::Json]);
    }

    #[test]
    fn test_decode_json_envelope() {
        let raw = br#"{"target":{"dest":"trigger"},"notification":{"commands":[{"commandName":"scan"}]}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.destination(), Destination::Trigger);
        let cmds: Commands = env.notification.parse().unwrap();
        assert_eq!(cmds.commands[0].name, CommandName::Scan);
    }

    #[test]
    fn test_decode_bson_envelope() {
        let document = doc! {
            "target": { "dest": "kubescape" },
            "notification": {
                "commands": [
                    { "commandName": "update", "jobTracking": { "jobID": "j", "lastActionNumber": 2 } }
                ]
            }
        };
        let bytes = bson::to_vec(&document).unwrap();

        let env = decode(&bytes).unwrap();
        assert_eq!(env.destination(), Destination::Trigger);
        let cmds: Commands = env.notification.parse().unwrap();
        assert_eq!(cmds.commands[0].name, CommandName::Update);
        assert_eq!(cmds.commands[0].job_tracking.last_action_number, 2);
    }

    #[test]
    fn test_bson_binary_notification_becomes_bytes() {
        let document = doc! {
            "target": { "dest": "trigger" },
            "notification": Binary { subtype: BinarySubtype::Generic, bytes: br#"{"commands":[]}"#.to_vec() },
        };
        let bytes = bson::to_vec(&document).unwrap();

        let env = decode(&bytes).unwrap();
        assert!(matches!(env.notification, Payload::Bytes(_)));
        let cmds: Commands = env.notification.parse().unwrap();
        assert!(cmds.commands.is_empty());
    }

    #[test]
    fn test_garbage_fails_both_formats() {
        let err = decode(b"{not json").unwrap_err();
        match err {
            DecodeError::Unrecognized(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(matches!(failures[0], FormatError::Json(_)));
                assert!(matches!(failures[1], FormatError::Bson(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_message() {
        assert!(matches!(decode(b""), Err(DecodeError::Empty)));
    }
}
