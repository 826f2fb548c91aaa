use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

const LOCAL_MESSAGE_PREFIX: &str = "local-";

impl MessageId {
    /// Temporary id for an optimistic send, replaced once the server confirms.
    pub fn local() -> Self {
        Self(format!("{LOCAL_MESSAGE_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRef {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ParticipantRef {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Media,
    Reply,
    SystemAddMembers,
    SystemRemoveMembers,
    SystemLeaveGroup,
    SystemEditGroupName,
    SystemFile,
    SystemReaction,
}

impl MessageKind {
    pub fn is_system(self) -> bool {
        matches!(
            self,
            Self::SystemAddMembers
                | Self::SystemRemoveMembers
                | Self::SystemLeaveGroup
                | Self::SystemEditGroupName
                | Self::SystemFile
                | Self::SystemReaction
        )
    }

    /// Membership changes: members added, members removed, member left.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::SystemAddMembers | Self::SystemRemoveMembers | Self::SystemLeaveGroup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Sent,
    Seen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallScope {
    #[serde(rename = "self")]
    SelfOnly,
    Everyone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReactionSummary {
    pub count: u32,
    #[serde(default)]
    pub reacted_by_me: bool,
    #[serde(default)]
    pub users: Vec<UserId>,
}

pub type Reactions = BTreeMap<String, ReactionSummary>;

/// Structured payload of a membership/group-info notice.
///
/// Sentences are rendered from this at read time, against the viewer and the
/// conversation's current participant directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub actor: ParticipantRef,
    #[serde(default)]
    pub targets: Vec<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: ParticipantRef,
    pub created_at: DateTime<Utc>,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub reactions: Reactions,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub recalled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_scope: Option<RecallScope>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<Notice>,
}

impl Message {
    pub fn text(
        id: MessageId,
        conversation_id: ConversationId,
        sender: ParticipantRef,
        created_at: DateTime<Utc>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender,
            created_at,
            kind: MessageKind::Text,
            content: content.into(),
            media_ref: None,
            reply_to: None,
            status: MessageStatus::Sent,
            reactions: Reactions::new(),
            pinned: false,
            recalled: false,
            recall_scope: None,
            edited: false,
            pending: false,
            failed: false,
            notice: None,
        }
    }

    pub fn system(
        id: MessageId,
        conversation_id: ConversationId,
        kind: MessageKind,
        notice: Notice,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut message = Self::text(
            id,
            conversation_id,
            notice.actor.clone(),
            created_at,
            String::new(),
        );
        message.kind = kind;
        message.notice = Some(notice);
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default)]
    pub participants: Vec<ParticipantRef>,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageId>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
}

impl Conversation {
    pub fn participant(&self, user_id: &UserId) -> Option<&ParticipantRef> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participant(user_id).is_some()
    }

    /// Adds the participant unless one with the same user id is present.
    pub fn add_participant(&mut self, participant: ParticipantRef) -> bool {
        if self.has_participant(&participant.user_id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    pub fn remove_participant(&mut self, user_id: &UserId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| &p.user_id != user_id);
        self.participants.len() != before
    }
}
