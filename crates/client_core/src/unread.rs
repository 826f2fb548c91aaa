use std::collections::HashSet;

use shared::domain::{Conversation, ConversationId, Message, MessageKind, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadUpdate {
    Keep,
    Increment,
    Set(u32),
}

/// Unread bookkeeping for newly arrived messages.
///
/// Rules, first match wins:
/// 1. selected conversation: keep;
/// 2. sent by the viewer: keep;
/// 3. membership notice: keep when it removes the viewer or records the
///    viewer leaving; the first add-members notice on a conversation with a
///    count of at most 1 sets the count to exactly 1; otherwise increment;
/// 4. anything else: increment.
#[derive(Debug, Clone, Default)]
pub struct UnreadCounter {
    add_members_seen: HashSet<ConversationId>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for a conversation that just appeared through a creation event.
    pub fn initial_count(created_by: &UserId, viewer: &UserId, explicit: Option<u32>) -> u32 {
        match explicit {
            Some(count) => count,
            None if created_by == viewer => 0,
            None => 1,
        }
    }

    pub fn decide(
        &self,
        conversation: &Conversation,
        message: &Message,
        viewer: &UserId,
        selected: bool,
    ) -> UnreadUpdate {
        if selected {
            return UnreadUpdate::Keep;
        }
        if &message.sender.user_id == viewer {
            return UnreadUpdate::Keep;
        }
        if message.kind.is_structural() {
            if addresses_viewer_as_departed(message, viewer) {
                return UnreadUpdate::Keep;
            }
            if message.kind == MessageKind::SystemAddMembers
                && !self.add_members_seen.contains(&conversation.id)
                && conversation.unread_count <= 1
            {
                return UnreadUpdate::Set(1);
            }
            return UnreadUpdate::Increment;
        }
        UnreadUpdate::Increment
    }

    /// Applies the policy for a message newly inserted into the log.
    pub fn on_message(
        &mut self,
        conversation: &mut Conversation,
        message: &Message,
        viewer: &UserId,
        selected: bool,
    ) -> bool {
        let update = self.decide(conversation, message, viewer, selected);
        if message.kind == MessageKind::SystemAddMembers {
            self.add_members_seen.insert(conversation.id.clone());
        }

        let before = conversation.unread_count;
        conversation.unread_count = match update {
            UnreadUpdate::Keep => before,
            UnreadUpdate::Increment => before.saturating_add(1),
            UnreadUpdate::Set(count) => count,
        };
        conversation.unread_count != before
    }

    pub fn reset(conversation: &mut Conversation) -> bool {
        let changed = conversation.unread_count != 0;
        conversation.unread_count = 0;
        changed
    }

    pub fn forget(&mut self, conversation_id: &ConversationId) {
        self.add_members_seen.remove(conversation_id);
    }
}

fn addresses_viewer_as_departed(message: &Message, viewer: &UserId) -> bool {
    let Some(notice) = &message.notice else {
        return false;
    };
    match message.kind {
        MessageKind::SystemRemoveMembers => notice.targets.iter().any(|t| &t.user_id == viewer),
        MessageKind::SystemLeaveGroup => &notice.actor.user_id == viewer,
        _ => false,
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
