use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, Message, MessageId, MessageStatus, Reactions, RecallScope};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("message '{message_id}' was not found in conversation '{conversation_id}'")]
    NotFound {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

/// Result of feeding a message into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Merged,
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Partial update for an existing entry. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub status: Option<MessageStatus>,
    pub reactions: Option<Reactions>,
    pub pinned: Option<bool>,
    pub recalled: Option<bool>,
    pub recall_scope: Option<Option<RecallScope>>,
    pub edited: Option<bool>,
    pub pending: Option<bool>,
    pub failed: Option<bool>,
}

impl MessagePatch {
    fn apply_to(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(created_at) = self.created_at {
            message.created_at = created_at;
        }
        if let Some(status) = self.status {
            message.status = message.status.max(status);
        }
        if let Some(reactions) = self.reactions {
            message.reactions = reactions;
        }
        if let Some(pinned) = self.pinned {
            message.pinned = pinned;
        }
        if let Some(recalled) = self.recalled {
            message.recalled = recalled;
        }
        if let Some(recall_scope) = self.recall_scope {
            message.recall_scope = recall_scope;
        }
        if let Some(edited) = self.edited {
            message.edited = edited;
        }
        if let Some(pending) = self.pending {
            message.pending = pending;
        }
        if let Some(failed) = self.failed {
            message.failed = failed;
        }
    }
}

/// Per-conversation message sequences kept in `created_at` order.
///
/// Equal timestamps keep their insertion order, including across re-sorts.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    conversations: HashMap<ConversationId, Vec<Message>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.conversations
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<&Message> {
        self.messages(conversation_id)
            .iter()
            .find(|m| &m.id == message_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.get(conversation_id, message_id).is_some()
    }

    pub fn last(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.messages(conversation_id).last()
    }

    /// Pinned messages of a conversation, in log order.
    pub fn pinned(&self, conversation_id: &ConversationId) -> Vec<&Message> {
        self.messages(conversation_id)
            .iter()
            .filter(|m| m.pinned)
            .collect()
    }

    pub fn append_or_merge(&mut self, message: Message) -> MergeOutcome {
        let entries = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_default();

        match entries.iter().position(|m| m.id == message.id) {
            Some(idx) => {
                let previous_created_at = entries[idx].created_at;
                let changed = merge_into(&mut entries[idx], message);
                if entries[idx].created_at != previous_created_at {
                    resort(entries);
                }
                if changed {
                    MergeOutcome::Merged
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                let at = entries.partition_point(|m| m.created_at <= message.created_at);
                entries.insert(at, message);
                MergeOutcome::Inserted
            }
        }
    }

    /// Swaps a locally-keyed entry for its server-confirmed counterpart.
    ///
    /// The confirmed message takes over the local entry's slot. When the
    /// server id is already present (e.g. a history fetch raced the
    /// confirmation), the local entry is dropped and the incoming copy is
    /// merged onto the existing one instead.
    pub fn replace_local(
        &mut self,
        local_id: &MessageId,
        confirmed: Message,
    ) -> Result<MergeOutcome, LogError> {
        let conversation_id = confirmed.conversation_id.clone();
        let not_found = || LogError::NotFound {
            conversation_id: conversation_id.clone(),
            message_id: local_id.clone(),
        };
        let entries = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(not_found)?;
        let idx = entries
            .iter()
            .position(|m| &m.id == local_id)
            .ok_or_else(not_found)?;

        if entries.iter().any(|m| m.id == confirmed.id) {
            entries.remove(idx);
            self.append_or_merge(confirmed);
            return Ok(MergeOutcome::Merged);
        }

        let previous_created_at = entries[idx].created_at;
        entries[idx] = confirmed;
        if entries[idx].created_at != previous_created_at {
            resort(entries);
        }
        Ok(MergeOutcome::Merged)
    }

    /// Merges a partial update. Returns `true` when the entry changed.
    pub fn apply_patch(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> Result<bool, LogError> {
        let entries = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| LogError::NotFound {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
            })?;
        let message = entries
            .iter_mut()
            .find(|m| &m.id == message_id)
            .ok_or_else(|| LogError::NotFound {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
            })?;

        let before = message.clone();
        patch.apply_to(message);
        let changed = *message != before;
        if message.created_at != before.created_at {
            resort(entries);
        }
        Ok(changed)
    }

    pub fn remove(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Message, LogError> {
        let not_found = || LogError::NotFound {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        };
        let entries = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(not_found)?;
        let idx = entries
            .iter()
            .position(|m| &m.id == message_id)
            .ok_or_else(not_found)?;
        Ok(entries.remove(idx))
    }

    pub fn clear(&mut self, conversation_id: &ConversationId) {
        self.conversations.remove(conversation_id);
    }
}

/// Shallow merge of `incoming` onto `existing`; returns whether anything changed.
///
/// Status never regresses and a recalled entry stays recalled.
fn merge_into(existing: &mut Message, incoming: Message) -> bool {
    let before = existing.clone();
    *existing = incoming;
    existing.status = existing.status.max(before.status);
    if before.recalled && !existing.recalled {
        existing.recalled = true;
        existing.recall_scope = before.recall_scope;
        existing.content = before.content.clone();
        existing.reactions.clear();
    }
    *existing != before
}

fn resort(entries: &mut [Message]) {
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
