use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, HubId};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Decode(String),

    #[error("envelope encode failed: {0}")]
    Encode(String),
}

/// One chat message as it travels over the bus and sits in history.
///
/// `id` is the producing connection; hubs skip the member with the same id so
/// a sender never gets its own message echoed back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: ConnectionId,
    pub server_id: HubId,
    pub username: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a raw inbound frame. `reply_to` is lifted from the payload when the
    /// payload is a JSON object carrying a string `reply_to` field.
    pub fn new(
        id: ConnectionId,
        server_id: HubId,
        username: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        let reply_to = reply_to_of(&payload);
        Self {
            id,
            server_id,
            username: username.into(),
            payload,
            reply_to,
            sent_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}

fn reply_to_of(payload: &str) -> Option<String> {
    if !payload.trim_start().starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("reply_to")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: &str) -> Envelope {
        Envelope::new(
            ConnectionId::from_raw("conn_1"),
            HubId::from_raw("hub_1"),
            "alice",
            payload,
        )
    }

    #[test]
    fn wire_field_names() {
        let json = envelope("hi").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], "conn_1");
        assert_eq!(value["server_id"], "hub_1");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["payload"], "hi");
        assert!(value.get("reply_to").is_none());
        assert!(value["sent_at"].is_string());
    }

    #[test]
    fn decode_returns_what_was_encoded() {
        let original = envelope("hello there");
        let decoded = Envelope::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn reply_to_lifted_from_json_payload() {
        let env = envelope(r#"{"text":"agreed","reply_to":"msg_42"}"#);
        assert_eq!(env.reply_to.as_deref(), Some("msg_42"));
        // payload is kept verbatim
        assert!(env.payload.contains("agreed"));
    }

    #[test]
    fn reply_to_ignored_for_plain_text_and_non_string() {
        assert!(envelope("reply_to: nope").reply_to.is_none());
        assert!(envelope(r#"{"reply_to": 7}"#).reply_to.is_none());
        assert!(envelope("{not json").reply_to.is_none());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(Envelope::decode(r#"{"id":"conn_1"}"#).is_err());
    }

    #[test]
    fn decode_tolerates_missing_reply_to() {
        let raw = r#"{"id":"c","server_id":"h","username":"u","payload":"p","sent_at":"2026-01-01T00:00:00Z"}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.payload, "p");
        assert!(env.reply_to.is_none());
    }
}
