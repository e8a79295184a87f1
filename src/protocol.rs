//! Control messages exchanged with the voice server.
//!
//! Inbound messages are discriminated by `type`. Their fields are read from a
//! nested `payload` object when one is present and from the top level
//! otherwise; the two shapes are never merged.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const ENVELOPE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// What the server heard the user say.
    Transcription { text: String },
    AssistantResponse { text: String },
    /// Emotion or animation state for the most recent assistant output.
    EmotionTrigger { trigger: String },
    Notification { category: Option<String>, data: Value },
    AgentSwitched { agent_id: String },
}

#[derive(Deserialize, Debug)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl Envelope {
    /// Fields of the message body: the nested payload object if present,
    /// otherwise the top level.
    fn body<T: DeserializeOwned>(self) -> Option<T> {
        let body = match self.payload {
            Some(payload @ Value::Object(_)) => payload,
            _ => Value::Object(self.rest),
        };
        serde_json::from_value(body).ok()
    }
}

#[derive(Deserialize)]
struct TextBody {
    text: String,
}

#[derive(Deserialize)]
struct TriggerBody {
    state: Option<String>,
    trigger: Option<String>,
}

#[derive(Deserialize)]
struct NotificationBody {
    #[serde(rename = "notificationType")]
    notification_type: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct AgentBody {
    agent_id: String,
}

/// Classify a control payload. Unknown types and messages missing their
/// required field yield `None`.
pub fn route(value: &Value) -> Option<ControlMessage> {
    let envelope: Envelope = match serde_json::from_value(value.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::debug!("Control message without type: {}", e);
            return None;
        }
    };

    let msg_type = envelope.msg_type.clone();
    let routed = match msg_type.as_str() {
        "transcription" => envelope
            .body::<TextBody>()
            .map(|b| ControlMessage::Transcription { text: b.text }),
        "llm_response" | "assistant_response" => envelope
            .body::<TextBody>()
            .map(|b| ControlMessage::AssistantResponse { text: b.text }),
        "rive_trigger" => envelope
            .body::<TriggerBody>()
            .and_then(|b| b.state.or(b.trigger))
            .map(|trigger| ControlMessage::EmotionTrigger { trigger }),
        "notification" => envelope
            .body::<NotificationBody>()
            .map(|b| ControlMessage::Notification {
                category: b.notification_type,
                data: b.data,
            }),
        "agent_switched" => envelope
            .body::<AgentBody>()
            .map(|b| ControlMessage::AgentSwitched { agent_id: b.agent_id }),
        _ => {
            log::debug!("Ignoring control message type '{}'", msg_type);
            return None;
        }
    };

    if routed.is_none() {
        log::debug!("Dropping '{}' message with missing fields", msg_type);
    }
    routed
}

pub(crate) fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Tell the server which game the user is playing.
pub fn game_context(game_id: &str) -> Value {
    json!({ "type": "game_context", "game_id": game_id })
}

/// User text wrapped in the standard `meta`/`payload` envelope.
pub fn text_envelope(user_message: &str, agent_id: &str) -> Value {
    json!({
        "type": "text",
        "meta": {
            "timestamp": unix_timestamp(),
            "request_id": Uuid::new_v4().to_string(),
            "version": ENVELOPE_VERSION,
        },
        "payload": {
            "user-message": user_message,
            "agent-id": agent_id,
        },
    })
}

/// User text without an envelope.
pub fn flat_text(user_message: &str, agent_id: &str) -> Value {
    json!({
        "type": "text",
        "user-message": user_message,
        "agent-id": agent_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_messages() {
        assert_eq!(
            route(&json!({"type": "transcription", "text": "hello"})),
            Some(ControlMessage::Transcription { text: "hello".into() })
        );
        assert_eq!(
            route(&json!({"type": "llm_response", "text": "hi"})),
            Some(ControlMessage::AssistantResponse { text: "hi".into() })
        );
        assert_eq!(
            route(&json!({"type": "assistant_response", "text": "hi"})),
            Some(ControlMessage::AssistantResponse { text: "hi".into() })
        );
        assert_eq!(
            route(&json!({"type": "agent_switched", "agent_id": "coach"})),
            Some(ControlMessage::AgentSwitched { agent_id: "coach".into() })
        );
    }

    #[test]
    fn enveloped_fields_come_from_payload() {
        let msg = json!({
            "type": "rive_trigger",
            "meta": {"version": "1.0"},
            "payload": {"state": "happy"},
        });
        assert_eq!(
            route(&msg),
            Some(ControlMessage::EmotionTrigger { trigger: "happy".into() })
        );

        let msg = json!({
            "type": "notification",
            "payload": {"notificationType": "score", "data": {"points": 3}},
        });
        assert_eq!(
            route(&msg),
            Some(ControlMessage::Notification {
                category: Some("score".into()),
                data: json!({"points": 3}),
            })
        );
    }

    #[test]
    fn envelope_is_not_merged_with_top_level() {
        // The top-level state must not leak in when a payload is present.
        let msg = json!({
            "type": "rive_trigger",
            "state": "angry",
            "payload": {"trigger": "wave"},
        });
        assert_eq!(
            route(&msg),
            Some(ControlMessage::EmotionTrigger { trigger: "wave".into() })
        );

        let msg = json!({"type": "rive_trigger", "state": "angry", "payload": {}});
        assert_eq!(route(&msg), None);
    }

    #[test]
    fn trigger_prefers_state() {
        let msg = json!({"type": "rive_trigger", "state": "sad", "trigger": "wave"});
        assert_eq!(
            route(&msg),
            Some(ControlMessage::EmotionTrigger { trigger: "sad".into() })
        );
    }

    #[test]
    fn notification_without_fields() {
        assert_eq!(
            route(&json!({"type": "notification"})),
            Some(ControlMessage::Notification {
                category: None,
                data: Value::Null,
            })
        );
    }

    #[test]
    fn unknown_and_incomplete_are_dropped() {
        assert_eq!(route(&json!({"type": "mystery", "text": "x"})), None);
        assert_eq!(route(&json!({"text": "no type"})), None);
        assert_eq!(route(&json!({"type": "transcription"})), None);
        assert_eq!(route(&json!([1, 2, 3])), None);
    }

    #[test]
    fn outbound_shapes() {
        assert_eq!(
            game_context("chess"),
            json!({"type": "game_context", "game_id": "chess"})
        );

        let env = text_envelope("hello", "default");
        assert_eq!(env["type"], "text");
        assert_eq!(env["meta"]["version"], "1.0");
        assert!(env["meta"]["timestamp"].as_f64().unwrap() > 0.0);
        assert!(Uuid::parse_str(env["meta"]["request_id"].as_str().unwrap()).is_ok());
        assert_eq!(env["payload"]["user-message"], "hello");
        assert_eq!(env["payload"]["agent-id"], "default");

        let flat = flat_text("hi", "default");
        assert_eq!(flat["user-message"], "hi");
        assert!(flat.get("payload").is_none());
    }
}
