//! Channel wire messages, carried as JSON frames.
//!
//! Requests flow from [`ChannelClient`](super::ChannelClient) to
//! [`ChannelServer`](super::ChannelServer), responses the other way. The
//! `type` tags of the two sets never overlap.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// Invoke `command` on `channel`.
    Call {
        /// Request id, unique per client.
        id: u64,
        /// Target channel name.
        channel: String,
        /// Command name.
        command: String,
        /// Argument (JSON `null` when absent).
        #[serde(default)]
        arg: Value,
    },
    /// Abandon the call `id`.
    Cancel {
        /// Id of the call.
        id: u64,
    },
    /// Subscribe to `event` on `channel`.
    Listen {
        /// Subscription id, unique per client.
        id: u64,
        /// Target channel name.
        channel: String,
        /// Event name.
        event: String,
        /// Argument (JSON `null` when absent).
        #[serde(default)]
        arg: Value,
    },
    /// End the subscription `id`.
    Unlisten {
        /// Id of the subscription.
        id: u64,
    },
}

impl Request {
    /// Id of the call or subscription this request refers to.
    pub fn id(&self) -> u64 {
        match self {
            Request::Call { id, .. }
            | Request::Cancel { id }
            | Request::Listen { id, .. }
            | Request::Unlisten { id } => *id,
        }
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    /// The server is ready to take requests.
    Initialize,
    /// Call `id` completed.
    Success {
        /// Id of the call.
        id: u64,
        /// Returned value.
        #[serde(default)]
        data: Value,
    },
    /// Call or subscription `id` failed.
    Error {
        /// Id of the call or subscription.
        id: u64,
        /// Error description.
        message: String,
    },
    /// Subscription `id` produced a value.
    Fire {
        /// Id of the subscription.
        id: u64,
        /// Event payload.
        #[serde(default)]
        data: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let call = Request::Call {
            id: 3,
            channel: "files".into(),
            command: "stat".into(),
            arg: json!({"path": "/tmp"}),
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"type": "call", "id": 3, "channel": "files", "command": "stat", "arg": {"path": "/tmp"}})
        );
        assert_eq!(
            serde_json::to_value(Request::Unlisten { id: 9 }).unwrap(),
            json!({"type": "unlisten", "id": 9})
        );
    }

    #[test]
    fn test_response_wire_shape() {
        assert_eq!(
            serde_json::to_value(Response::Initialize).unwrap(),
            json!({"type": "initialize"})
        );
        assert_eq!(
            serde_json::to_value(Response::Error {
                id: 1,
                message: "nope".into()
            })
            .unwrap(),
            json!({"type": "error", "id": 1, "message": "nope"})
        );
    }

    #[test]
    fn test_missing_arg_defaults_to_null() {
        let request: Request =
            serde_json::from_value(json!({"type": "call", "id": 1, "channel": "c", "command": "x"}))
                .unwrap();
        assert_eq!(
            request,
            Request::Call {
                id: 1,
                channel: "c".into(),
                command: "x".into(),
                arg: Value::Null
            }
        );
    }

    #[test]
    fn test_requests_do_not_parse_as_responses() {
        let wire = json!({"type": "cancel", "id": 1});
        assert!(serde_json::from_value::<Response>(wire.clone()).is_err());
        assert_eq!(serde_json::from_value::<Request>(wire).unwrap().id(), 1);
    }
}
