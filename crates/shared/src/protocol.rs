use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Conversation, ConversationId, Message, MessageId, MessageStatus, ParticipantRef,
        Reactions, RecallScope, UserId,
    },
    error::ApiError,
};

/// Kind of a locally initiated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Send,
    Edit,
    Recall,
    Pin,
    React,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    EditMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },
    RecallMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
        scope: RecallScope,
    },
    SetPinned {
        conversation_id: ConversationId,
        message_id: MessageId,
        pinned: bool,
    },
    React {
        conversation_id: ConversationId,
        message_id: MessageId,
        icon: String,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
}

impl ClientRequest {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::SendMessage {
                conversation_id, ..
            }
            | Self::EditMessage {
                conversation_id, ..
            }
            | Self::RecallMessage {
                conversation_id, ..
            }
            | Self::SetPinned {
                conversation_id, ..
            }
            | Self::React {
                conversation_id, ..
            }
            | Self::MarkRead { conversation_id } => conversation_id,
        }
    }

    pub fn mutation_kind(&self) -> Option<MutationKind> {
        match self {
            Self::SendMessage { .. } => Some(MutationKind::Send),
            Self::EditMessage { .. } => Some(MutationKind::Edit),
            Self::RecallMessage { .. } => Some(MutationKind::Recall),
            Self::SetPinned { .. } => Some(MutationKind::Pin),
            Self::React { .. } => Some(MutationKind::React),
            Self::MarkRead { .. } => None,
        }
    }
}

/// Successful server response to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerAck {
    Sent {
        id: MessageId,
        created_at: DateTime<Utc>,
    },
    Updated(Message),
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    MessageCreated {
        message: Message,
    },
    StatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
    },
    ReactionChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        #[serde(default)]
        reactions: Reactions,
    },
    Recalled {
        conversation_id: ConversationId,
        message_id: MessageId,
        scope: RecallScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Pinned {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Unpinned {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },
    MembersAdded {
        conversation_id: ConversationId,
        actor: ParticipantRef,
        added: Vec<ParticipantRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
    },
    MembersRemoved {
        conversation_id: ConversationId,
        actor: ParticipantRef,
        removed: Vec<ParticipantRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
    },
    Left {
        conversation_id: ConversationId,
        member: ParticipantRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
    },
    GroupInfoEdited {
        conversation_id: ConversationId,
        actor: ParticipantRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ConversationCreated {
        conversation: Conversation,
        created_by: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unread_count: Option<u32>,
    },
    /// Asynchronous rejection of an earlier request.
    MutationRejected {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        kind: MutationKind,
        error: ApiError,
    },
}

impl PushEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageCreated { message } => &message.conversation_id,
            Self::ConversationCreated { conversation, .. } => &conversation.id,
            Self::StatusChanged {
                conversation_id, ..
            }
            | Self::ReactionChanged {
                conversation_id, ..
            }
            | Self::Recalled {
                conversation_id, ..
            }
            | Self::Pinned {
                conversation_id, ..
            }
            | Self::Unpinned {
                conversation_id, ..
            }
            | Self::MessageEdited {
                conversation_id, ..
            }
            | Self::MembersAdded {
                conversation_id, ..
            }
            | Self::MembersRemoved {
                conversation_id, ..
            }
            | Self::Left {
                conversation_id, ..
            }
            | Self::GroupInfoEdited {
                conversation_id, ..
            }
            | Self::MessageDeleted {
                conversation_id, ..
            }
            | Self::MutationRejected {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageCreated { .. } => "message_created",
            Self::StatusChanged { .. } => "status_changed",
            Self::ReactionChanged { .. } => "reaction_changed",
            Self::Recalled { .. } => "recalled",
            Self::Pinned { .. } => "pinned",
            Self::Unpinned { .. } => "unpinned",
            Self::MessageEdited { .. } => "message_edited",
            Self::MembersAdded { .. } => "members_added",
            Self::MembersRemoved { .. } => "members_removed",
            Self::Left { .. } => "left",
            Self::GroupInfoEdited { .. } => "group_info_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ConversationCreated { .. } => "conversation_created",
            Self::MutationRejected { .. } => "mutation_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_events_use_type_and_payload_tags() {
        let event = PushEvent::Pinned {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "pinned");
        assert_eq!(json["payload"]["conversation_id"], "c1");
        assert_eq!(json["payload"]["message_id"], "m1");
    }

    #[test]
    fn parses_recall_scope_self_keyword() {
        let raw = r#"{"type":"recalled","payload":{"conversation_id":"c1","message_id":"m1","scope":"self"}}"#;
        let event: PushEvent = serde_json::from_str(raw).expect("parse");
        match event {
            PushEvent::Recalled {
                scope, placeholder, ..
            } => {
                assert_eq!(scope, RecallScope::SelfOnly);
                assert_eq!(placeholder, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn mark_read_is_not_a_mutation() {
        let request = ClientRequest::MarkRead {
            conversation_id: "c1".into(),
        };
        assert_eq!(request.mutation_kind(), None);
        assert_eq!(request.conversation_id().as_str(), "c1");
    }
}
