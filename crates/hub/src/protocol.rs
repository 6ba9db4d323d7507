//! Streaming wire protocol: JSON text frames tagged by `type`.

use dashlite_core::{ChangeEvent, ResourceKind};
use serde::{Deserialize, Serialize};

/// Frames accepted from clients. Anything else is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        resource_kind: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Unsubscribe {
        resource_kind: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Ping,
    Pong,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames sent to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event {
        #[serde(flatten)]
        event: ChangeEvent,
    },
    InitialBatch {
        resource_kind: ResourceKind,
        namespace: Option<String>,
        events: Vec<ChangeEvent>,
    },
    InitialStateComplete {
        resource_kind: ResourceKind,
        namespace: Option<String>,
        count: usize,
    },
    Subscribed {
        resource_kind: ResourceKind,
        namespace: Option<String>,
    },
    Unsubscribed {
        resource_kind: ResourceKind,
        namespace: Option<String>,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            let reason = e.to_string().replace('"', "'");
            format!(r#"{{"type":"error","message":"encode: {reason}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_frames() {
        let m = ClientMessage::parse(r#"{"type":"subscribe","resource_kind":"Pod","namespace":"ns"}"#).unwrap();
        assert_eq!(m, ClientMessage::Subscribe { resource_kind: "Pod".into(), namespace: Some("ns".into()) });
        let m = ClientMessage::parse(r#"{"type":"unsubscribe","resource_kind":"deployments"}"#).unwrap();
        assert_eq!(m, ClientMessage::Unsubscribe { resource_kind: "deployments".into(), namespace: None });
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn rejects_unknown_frames() {
        assert!(ClientMessage::parse(r#"{"type":"reload"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"resource_kind":"Pod"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn server_frames_are_tagged() {
        let v: serde_json::Value = serde_json::from_str(&ServerMessage::Ping.to_json()).unwrap();
        assert_eq!(v["type"], "ping");
        let done = ServerMessage::InitialStateComplete { resource_kind: ResourceKind::Pod, namespace: None, count: 3 };
        let v: serde_json::Value = serde_json::from_str(&done.to_json()).unwrap();
        assert_eq!(v["type"], "initial_state_complete");
        assert_eq!(v["count"], 3);
        assert!(v["namespace"].is_null());
    }
}
