//! Defines the WebSocket message protocol between the browser client and the API server.

use crate::models::CourseResponse;
use coursegen_core::ProgressEvent;
use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Asks for a fresh course snapshot, e.g. after missing events.
    Snapshot,
    Ping,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection; events follow from this point.
    Subscribed { course: CourseResponse },
    Snapshot { course: CourseResponse },
    Progress { event: ProgressEvent },
    Pong,
    /// Reports a fatal error to the client.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged_by_type() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "snapshot"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Snapshot);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "init"}"#).is_err());
    }

    #[test]
    fn progress_messages_nest_the_event() {
        let msg = ServerMessage::Progress {
            event: ProgressEvent::ModuleFailed {
                index: 2,
                reason: "timeout".into(),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "progress",
                "event": {"event": "module_failed", "index": 2, "reason": "timeout"}
            })
        );
    }
}
