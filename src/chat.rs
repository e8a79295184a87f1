//! Conversation transcript built from routed control messages.

use crate::protocol::{ControlMessage, unix_timestamp};
use serde::Serialize;
use uuid::Uuid;

const USER_LABEL: &str = "You said";
const ASSISTANT_LABEL: &str = "Ziggy";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    /// Unix time in seconds.
    pub timestamp: f64,
}

impl ChatMessage {
    fn new(role: Role, text: String, label: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text,
            label: label.map(str::to_string),
            emotion: None,
            timestamp: unix_timestamp(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Record a control message. Returns the entry that was added or
    /// changed, if any.
    pub fn apply(&mut self, msg: ControlMessage) -> Option<&ChatMessage> {
        match msg {
            ControlMessage::Transcription { text } => {
                Some(self.push(ChatMessage::new(Role::User, text, Some(USER_LABEL))))
            }
            ControlMessage::AssistantResponse { text } => Some(self.push(ChatMessage::new(
                Role::Assistant,
                text,
                Some(ASSISTANT_LABEL),
            ))),
            ControlMessage::EmotionTrigger { trigger } => self.attach_emotion(trigger),
            ControlMessage::Notification { category, data } => {
                let category = category.as_deref().unwrap_or("notification");
                Some(self.system(format!("{}: {}", category, data)))
            }
            ControlMessage::AgentSwitched { agent_id } => {
                Some(self.system(format!("Switched to: {}", agent_id)))
            }
        }
    }

    /// Set the emotion of the most recent assistant entry. No-op when the
    /// assistant has not spoken yet.
    pub fn attach_emotion(&mut self, emotion: String) -> Option<&ChatMessage> {
        let entry = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::Assistant)?;
        entry.emotion = Some(emotion);
        Some(&*entry)
    }

    pub fn system(&mut self, text: impl Into<String>) -> &ChatMessage {
        self.push(ChatMessage::new(Role::System, text.into(), None))
    }

    fn push(&mut self, msg: ChatMessage) -> &ChatMessage {
        self.messages.push(msg);
        &self.messages[self.messages.len() - 1]
    }
}
