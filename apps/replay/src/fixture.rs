use std::collections::HashMap;

use client_core::RequestKind;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, ParticipantRef, RecallScope},
    error::ApiError,
    protocol::{PushEvent, ServerAck},
};

/// A recorded session: seed data for the fake backend plus the steps to run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Fixture {
    pub viewer: ParticipantRef,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub histories: HashMap<ConversationId, Vec<Message>>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Step {
    Push(PushEvent),
    LoadHistory {
        conversation_id: ConversationId,
    },
    Select {
        conversation_id: ConversationId,
    },
    Send {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    Retry {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Edit {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },
    Recall {
        conversation_id: ConversationId,
        message_id: MessageId,
        scope: RecallScope,
    },
    Pin {
        conversation_id: ConversationId,
        message_id: MessageId,
        pinned: bool,
    },
    React {
        conversation_id: ConversationId,
        message_id: MessageId,
        icon: String,
    },
    /// Makes the next request of `request` kind succeed with `ack`.
    ScriptAck {
        request: RequestKind,
        ack: ServerAck,
    },
    /// Makes the next request of `request` kind fail with `error`.
    ScriptFailure {
        request: RequestKind,
        error: ApiError,
    },
}

impl Fixture {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Fixture viewer, or the participant named `user_id` when overridden.
    pub fn viewer_for(&self, user_id: Option<&str>) -> ParticipantRef {
        let Some(user_id) = user_id else {
            return self.viewer.clone();
        };
        self.conversations
            .iter()
            .flat_map(|c| c.participants.iter())
            .find(|p| p.user_id.as_str() == user_id)
            .cloned()
            .unwrap_or_else(|| ParticipantRef::new(user_id, user_id))
    }
}
