/**
 * Realtime Wire Protocol
 *
 * JSON frames over a websocket. Clients send `{type, ...}` frames; the
 * server answers with `{event, data?}` objects. Session-control messages
 * travel on the bus as `{action, data?}` and never reach clients
 * directly.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame received from the client, routed by its `type` field.
///
/// Frames beyond `auth` and `heartbeat` are passed through to application
/// handlers untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Auth { token: String },
    Heartbeat { last_active: Option<f64> },
    Other { frame_type: String, frame: Value },
}

impl ClientFrame {
    /// Decode one frame. `None` for anything that is not a JSON object
    /// with a string `type` field.
    pub fn parse(raw: &str) -> Option<ClientFrame> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let frame_type = value.get("type")?.as_str()?.to_string();
        match frame_type.as_str() {
            "auth" => {
                let token = value.get("token")?.as_str()?.to_string();
                Some(ClientFrame::Auth { token })
            }
            "heartbeat" => {
                let last_active = value
                    .get("data")
                    .and_then(|d| d.get("last_active"))
                    .and_then(Value::as_f64);
                Some(ClientFrame::Heartbeat { last_active })
            }
            _ => Some(ClientFrame::Other {
                frame_type,
                frame: value,
            }),
        }
    }
}

/// An event pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerEvent {
    pub fn named(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn please_token() -> Self {
        Self::named("please_token", None)
    }

    pub fn success_auth() -> Self {
        Self::named("success_auth", None)
    }

    pub fn refresh_recommended() -> Self {
        Self::named("refresh_recommended", None)
    }
}

/// Session-control message carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub action: SessionAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    /// Re-validate the connection's token against the store.
    CheckToken,
    /// The session was revoked; close with `SESSION_CLOSED`.
    SessionLogout,
}

/// Why a connection was closed. Carried verbatim in the close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    InvalidToken,
    AuthTimeout,
    HeartbeatTimeout,
    SessionClosed,
    AbnormalClose,
    InternalError,
}

impl CloseReason {
    /// Websocket close code: 1000 for a normal close, 1008 otherwise.
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            _ => 1008,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "NORMAL",
            CloseReason::InvalidToken => "INVALID_TOKEN",
            CloseReason::AuthTimeout => "AUTH_TIMEOUT",
            CloseReason::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            CloseReason::SessionClosed => "SESSION_CLOSED",
            CloseReason::AbnormalClose => "ABNORMAL_CLOSE",
            CloseReason::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Bus channel carrying user-visible events for `user_id`.
pub fn events_channel(user_id: i64) -> String {
    format!("events:{user_id}")
}

/// Bus channel carrying session-control events for every session of
/// `user_id`.
pub fn session_events_channel(user_id: i64) -> String {
    format!("session_events:{user_id}")
}

/// Bus channel carrying session-control events for one session.
pub fn session_channel(session_id: i64) -> String {
    format!("session:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_auth_frame() {
        let frame = ClientFrame::parse(r#"{"type":"auth","token":"LV abc.def"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Auth {
                token: "LV abc.def".to_string()
            }
        );
    }

    #[test]
    fn test_parse_heartbeat_with_and_without_data() {
        let bare = ClientFrame::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(bare, ClientFrame::Heartbeat { last_active: None });

        let stamped =
            ClientFrame::parse(r#"{"type":"heartbeat","data":{"last_active":1725494400.5}}"#)
                .unwrap();
        assert_eq!(
            stamped,
            ClientFrame::Heartbeat {
                last_active: Some(1725494400.5)
            }
        );
    }

    #[test]
    fn test_parse_unknown_frame_passes_through() {
        let frame = ClientFrame::parse(r#"{"type":"typing","context_id":7}"#).unwrap();
        match frame {
            ClientFrame::Other { frame_type, frame } => {
                assert_eq!(frame_type, "typing");
                assert_eq!(frame["context_id"], 7);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ClientFrame::parse("not json").is_none());
        assert!(ClientFrame::parse(r#"{"no_type":true}"#).is_none());
        assert!(ClientFrame::parse(r#"{"type":42}"#).is_none());
    }

    #[test]
    fn test_server_event_shape() {
        let plain = serde_json::to_value(ServerEvent::please_token()).unwrap();
        assert_eq!(plain, json!({"event": "please_token"}));

        let with_data =
            serde_json::to_value(ServerEvent::named("notification", Some(json!({"id": 1}))))
                .unwrap();
        assert_eq!(with_data, json!({"event": "notification", "data": {"id": 1}}));
    }

    #[test]
    fn test_session_event_round_trip() {
        let raw = r#"{"action":"check_token"}"#;
        let event: SessionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.action, SessionAction::CheckToken);
        assert_eq!(serde_json::to_string(&event).unwrap(), raw);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 1008);
        assert_eq!(CloseReason::SessionClosed.as_str(), "SESSION_CLOSED");
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(events_channel(5), "events:5");
        assert_eq!(session_events_channel(5), "session_events:5");
        assert_eq!(session_channel(9), "session:9");
    }
}
