//! The normalized message envelope carried on every client<->broker and
//! gateway<->broker link, plus the handful of out-of-band shapes used at
//! the node edge (ws-node discovery requests, ws-node update frames).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Destination selector on gateway -> broker messages.
pub const DST_ALL: &str = "all";

/// The common wire envelope.
///
/// Mirrors the four message kinds used throughout the fabric: a node
/// appearing (`new`), a node disappearing (`out`), a node's resources being
/// cleared and re-discovered (`reset`), and a resource value changing
/// (`update`). Unknown `type` values are rejected at decode time rather than
/// silently carried through.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    New {
        uid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
    },
    Out {
        uid: String,
    },
    Reset {
        uid: String,
    },
    Update {
        uid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is missing a recognized 'type' field")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

impl Message {
    /// Builds the `new` notification emitted when a node first appears.
    pub fn new_node(uid: impl Into<String>, dst: impl Into<String>) -> Self {
        Message::New {
            uid: uid.into(),
            dst: Some(dst.into()),
            src: None,
        }
    }

    /// Builds the hello frame a dashboard client sends right after
    /// connecting, asking every gateway to replay its node cache. `uid` is
    /// conventionally empty; gateways only look at the message's `type` and
    /// the `src` the broker stamps on it.
    pub fn client_hello() -> Self {
        Message::New {
            uid: String::new(),
            dst: None,
            src: None,
        }
    }

    /// Builds the `out` notification emitted when a node expires or its
    /// owning gateway disconnects.
    pub fn out_node(uid: impl Into<String>) -> Self {
        Message::Out { uid: uid.into() }
    }

    /// Builds the `reset` notification emitted when a node's resources are
    /// cleared and re-discovered.
    pub fn reset_node(uid: impl Into<String>) -> Self {
        Message::Reset { uid: uid.into() }
    }

    /// Builds an `update` notification for a single resource value.
    pub fn update_node(
        uid: impl Into<String>,
        endpoint: impl Into<String>,
        data: impl Into<String>,
        dst: impl Into<String>,
    ) -> Self {
        Message::Update {
            uid: uid.into(),
            endpoint: Some(endpoint.into()),
            data: Some(data.into()),
            dst: Some(dst.into()),
            src: None,
        }
    }

    /// Builds the periodic gateway heartbeat, `{"type":"update","uid":"alive"}`.
    pub fn gateway_alive() -> Self {
        Message::Update {
            uid: "alive".to_string(),
            endpoint: None,
            data: None,
            dst: None,
            src: None,
        }
    }

    /// The node uid this message concerns.
    pub fn uid(&self) -> &str {
        match self {
            Message::New { uid, .. }
            | Message::Out { uid }
            | Message::Reset { uid }
            | Message::Update { uid, .. } => uid,
        }
    }

    /// The routing destination of a gateway -> broker message, if present.
    pub fn dst(&self) -> Option<&str> {
        match self {
            Message::New { dst, .. } => dst.as_deref(),
            Message::Update { dst, .. } => dst.as_deref(),
            Message::Out { .. } | Message::Reset { .. } => None,
        }
    }

    /// The client uid the broker stamped onto a client -> broker message.
    pub fn src(&self) -> Option<&str> {
        match self {
            Message::New { src, .. } => src.as_deref(),
            Message::Update { src, .. } => src.as_deref(),
            Message::Out { .. } | Message::Reset { .. } => None,
        }
    }

    /// Stamps the `src` field on a client -> broker message before it is
    /// forwarded to gateways. Meaningful on `New` (the client hello) and
    /// `Update` (a client-initiated resource write); `Out`/`Reset` never
    /// originate from clients in this fabric.
    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        match &mut self {
            Message::New { src: s, .. } | Message::Update { src: s, .. } => {
                *s = Some(src.into());
            }
            Message::Out { .. } | Message::Reset { .. } => {}
        }
        self
    }

    /// Serializes to the wire JSON representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Message always serializes")
    }

    /// Parses and validates a raw frame as a `Message`.
    ///
    /// Rejects anything that isn't valid JSON, anything missing a `type`
    /// field, and anything whose `type` isn't one of `new`/`update`/`out`/
    /// `reset`.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(raw)?;

        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(MessageError::MissingType);
        };

        match kind {
            "new" | "update" | "out" | "reset" => Ok(serde_json::from_value(value)?),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Request sent from a gateway to a ws-node asking it to (re)announce its
/// resources. The sole member of the "alternate shape" messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub request: String,
}

impl Default for DiscoverRequest {
    fn default() -> Self {
        Self {
            request: "discover".to_string(),
        }
    }
}

impl DiscoverRequest {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("DiscoverRequest always serializes")
    }
}

/// Frame sent from a gateway to a ws-node to set a resource value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSetFrame {
    pub endpoint: String,
    pub payload: String,
}

/// Frame sent from a ws-node to its gateway reporting resource updates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeUpdateFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_with_dst() {
        let raw = r#"{"type":"new","uid":"n1","dst":"all"}"#;
        let msg = Message::parse(raw).unwrap();
        assert_eq!(
            msg,
            Message::New {
                uid: "n1".into(),
                dst: Some("all".into()),
                src: None,
            }
        );
    }

    #[test]
    fn parses_update_without_dst() {
        let raw = r#"{"type":"update","uid":"n1","endpoint":"led","data":"1"}"#;
        let msg = Message::parse(raw).unwrap();
        assert_eq!(
            msg,
            Message::Update {
                uid: "n1".into(),
                endpoint: Some("led".into()),
                data: Some("1".into()),
                dst: None,
                src: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = r#"{"type":"ping","uid":"n1"}"#;
        assert!(matches!(Message::parse(raw), Err(MessageError::UnknownType(_))));
    }

    #[test]
    fn rejects_missing_type() {
        let raw = r#"{"uid":"n1"}"#;
        assert!(matches!(Message::parse(raw), Err(MessageError::MissingType)));
    }

    #[test]
    fn rejects_invalid_json() {
        let raw = "not json";
        assert!(matches!(Message::parse(raw), Err(MessageError::Json(_))));
    }

    #[test]
    fn with_src_skips_out_and_reset() {
        let msg = Message::out_node("n1").with_src("client-1");
        assert_eq!(msg, Message::Out { uid: "n1".into() });
        let msg = Message::reset_node("n1").with_src("client-1");
        assert_eq!(msg, Message::Reset { uid: "n1".into() });

        let msg = Message::Update {
            uid: "n1".into(),
            endpoint: Some("led".into()),
            data: Some("1".into()),
            dst: None,
            src: None,
        }
        .with_src("client-1");
        assert_eq!(msg.dst(), None);
        if let Message::Update { src, .. } = msg {
            assert_eq!(src.as_deref(), Some("client-1"));
        } else {
            panic!("expected update");
        }
    }

    #[test]
    fn client_hello_gets_src_stamped() {
        let msg = Message::client_hello().with_src("client-1");
        assert_eq!(msg.src(), Some("client-1"));
    }

    #[test]
    fn gateway_alive_round_trips() {
        let msg = Message::gateway_alive();
        assert_eq!(msg.to_json(), r#"{"type":"update","uid":"alive"}"#);
    }
}
