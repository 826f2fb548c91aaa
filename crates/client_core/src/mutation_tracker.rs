use std::collections::HashMap;

use shared::{
    domain::{ConversationId, Message, MessageId, Reactions, RecallScope},
    protocol::MutationKind,
};

use crate::message_log::MessagePatch;

/// Independently versioned subset of a message's mutable fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldGroup {
    Content,
    Pinned,
    Reactions,
}

impl FieldGroup {
    pub fn touched_by(kind: MutationKind) -> &'static [FieldGroup] {
        match kind {
            MutationKind::Send | MutationKind::Edit => &[FieldGroup::Content],
            // Recall replaces content and clears reactions.
            MutationKind::Recall => &[FieldGroup::Content, FieldGroup::Reactions],
            MutationKind::Pin => &[FieldGroup::Pinned],
            MutationKind::React => &[FieldGroup::Reactions],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationHandle {
    id: u64,
    kind: MutationKind,
    conversation_id: ConversationId,
    message_id: MessageId,
}

impl MutationHandle {
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Target message; the temporary local id for a send.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSnapshot {
    pub content: String,
    pub recalled: bool,
    pub recall_scope: Option<RecallScope>,
    pub edited: bool,
}

/// Pre-mutation values of the field-groups a mutation touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub content: Option<ContentSnapshot>,
    pub pinned: Option<bool>,
    pub reactions: Option<Reactions>,
}

impl Snapshot {
    fn capture(message: &Message, groups: &[FieldGroup]) -> Self {
        let mut snapshot = Self::default();
        for group in groups {
            match group {
                FieldGroup::Content => {
                    snapshot.content = Some(ContentSnapshot {
                        content: message.content.clone(),
                        recalled: message.recalled,
                        recall_scope: message.recall_scope,
                        edited: message.edited,
                    })
                }
                FieldGroup::Pinned => snapshot.pinned = Some(message.pinned),
                FieldGroup::Reactions => snapshot.reactions = Some(message.reactions.clone()),
            }
        }
        snapshot
    }

    fn retain(mut self, groups: &[FieldGroup]) -> Self {
        if !groups.contains(&FieldGroup::Content) {
            self.content = None;
        }
        if !groups.contains(&FieldGroup::Pinned) {
            self.pinned = None;
        }
        if !groups.contains(&FieldGroup::Reactions) {
            self.reactions = None;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.pinned.is_none() && self.reactions.is_none()
    }

    pub fn into_patch(self) -> MessagePatch {
        let mut patch = MessagePatch {
            pinned: self.pinned,
            reactions: self.reactions,
            ..MessagePatch::default()
        };
        if let Some(content) = self.content {
            patch.content = Some(content.content);
            patch.recalled = Some(content.recalled);
            patch.recall_scope = Some(content.recall_scope);
            patch.edited = Some(content.edited);
        }
        patch
    }
}

/// Viewer reaction state a pending react moves `icon` to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionToggle {
    pub icon: String,
    pub reacted: bool,
}

#[derive(Debug, Clone)]
struct PendingMutation {
    handle: MutationHandle,
    snapshot: Snapshot,
    generations: Vec<(FieldGroup, u64)>,
    toggle: Option<ReactionToggle>,
}

type GroupKey = (ConversationId, MessageId, FieldGroup);

/// Pending local mutations, kept in begin order.
///
/// Every begun mutation bumps the generation of each field-group it touches on
/// its target message. A rollback only restores groups whose latest
/// generation is still its own.
#[derive(Debug, Clone, Default)]
pub struct MutationTracker {
    next_id: u64,
    pending: Vec<PendingMutation>,
    latest: HashMap<GroupKey, u64>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records a mutation against `target` as it was before the optimistic change.
    pub fn begin(&mut self, kind: MutationKind, target: &Message) -> MutationHandle {
        self.begin_with(kind, target, None)
    }

    /// Records a react mutation together with the state it moves towards.
    pub fn begin_react(&mut self, target: &Message, toggle: ReactionToggle) -> MutationHandle {
        self.begin_with(MutationKind::React, target, Some(toggle))
    }

    fn begin_with(
        &mut self,
        kind: MutationKind,
        target: &Message,
        toggle: Option<ReactionToggle>,
    ) -> MutationHandle {
        self.next_id += 1;
        let handle = MutationHandle {
            id: self.next_id,
            kind,
            conversation_id: target.conversation_id.clone(),
            message_id: target.id.clone(),
        };

        let groups = FieldGroup::touched_by(kind);
        let generations = groups
            .iter()
            .map(|group| {
                let key = (target.conversation_id.clone(), target.id.clone(), *group);
                let generation = self.latest.entry(key).or_insert(0);
                *generation += 1;
                (*group, *generation)
            })
            .collect();

        self.pending.push(PendingMutation {
            handle: handle.clone(),
            snapshot: Snapshot::capture(target, groups),
            generations,
            toggle,
        });
        handle
    }

    pub fn is_pending(&self, handle: &MutationHandle) -> bool {
        self.pending.iter().any(|p| p.handle.id == handle.id)
    }

    /// Clears the pending entry. Returns `false` if it was already resolved.
    pub fn commit(&mut self, handle: &MutationHandle) -> bool {
        self.take(handle).is_some()
    }

    /// Clears the pending entry and returns what may be restored.
    ///
    /// `None` means the handle was already resolved. The returned snapshot
    /// only covers field-groups with no newer generation.
    pub fn rollback(&mut self, handle: &MutationHandle) -> Option<Snapshot> {
        let pending = self.take(handle)?;
        let still_latest: Vec<FieldGroup> = pending
            .generations
            .iter()
            .filter(|(group, generation)| {
                let key = (
                    pending.handle.conversation_id.clone(),
                    pending.handle.message_id.clone(),
                    *group,
                );
                self.latest.get(&key) == Some(generation)
            })
            .map(|(group, _)| *group)
            .collect();
        Some(pending.snapshot.retain(&still_latest))
    }

    pub fn oldest_pending_send(&self, conversation_id: &ConversationId) -> Option<MutationHandle> {
        self.pending
            .iter()
            .find(|p| {
                p.handle.kind == MutationKind::Send && &p.handle.conversation_id == conversation_id
            })
            .map(|p| p.handle.clone())
    }

    pub fn oldest_pending(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        kind: MutationKind,
    ) -> Option<MutationHandle> {
        self.pending
            .iter()
            .find(|p| {
                p.handle.kind == kind
                    && &p.handle.conversation_id == conversation_id
                    && &p.handle.message_id == message_id
            })
            .map(|p| p.handle.clone())
    }

    pub fn toggle(&self, handle: &MutationHandle) -> Option<&ReactionToggle> {
        self.pending
            .iter()
            .find(|p| p.handle.id == handle.id)
            .and_then(|p| p.toggle.as_ref())
    }

    /// Pending react toggles on a message, oldest first.
    pub fn pending_toggles(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Vec<(MutationHandle, ReactionToggle)> {
        self.pending
            .iter()
            .filter(|p| {
                &p.handle.conversation_id == conversation_id && &p.handle.message_id == message_id
            })
            .filter_map(|p| p.toggle.clone().map(|toggle| (p.handle.clone(), toggle)))
            .collect()
    }

    /// Whether a react on the same icon was begun after `handle` and is still pending.
    pub fn has_newer_toggle(&self, handle: &MutationHandle) -> bool {
        let Some(icon) = self.toggle(handle).map(|t| t.icon.clone()) else {
            return false;
        };
        self.pending.iter().any(|p| {
            p.handle.id > handle.id
                && p.handle.conversation_id == handle.conversation_id
                && p.handle.message_id == handle.message_id
                && p.toggle.as_ref().is_some_and(|t| t.icon == icon)
        })
    }

    pub fn has_pending(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.pending.iter().any(|p| {
            &p.handle.conversation_id == conversation_id && &p.handle.message_id == message_id
        })
    }

    pub fn in_flight_groups(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Vec<FieldGroup> {
        let mut groups: Vec<FieldGroup> = self
            .pending
            .iter()
            .filter(|p| {
                &p.handle.conversation_id == conversation_id && &p.handle.message_id == message_id
            })
            .flat_map(|p| p.generations.iter().map(|(group, _)| *group))
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    pub fn generation(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        group: FieldGroup,
    ) -> Option<u64> {
        self.latest
            .get(&(conversation_id.clone(), message_id.clone(), group))
            .copied()
    }

    /// Drops all state for a message that no longer exists.
    pub fn forget_message(&mut self, conversation_id: &ConversationId, message_id: &MessageId) {
        self.pending.retain(|p| {
            !(&p.handle.conversation_id == conversation_id && &p.handle.message_id == message_id)
        });
        self.latest
            .retain(|(conv, msg, _), _| !(conv == conversation_id && msg == message_id));
    }

    pub fn forget_conversation(&mut self, conversation_id: &ConversationId) {
        self.pending
            .retain(|p| &p.handle.conversation_id != conversation_id);
        self.latest.retain(|(conv, _, _), _| conv != conversation_id);
    }

    fn take(&mut self, handle: &MutationHandle) -> Option<PendingMutation> {
        let idx = self.pending.iter().position(|p| p.handle.id == handle.id)?;
        Some(self.pending.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use shared::domain::{ParticipantRef, ReactionSummary};

    use super::*;

    fn message(id: &str) -> Message {
        Message::text(
            MessageId::from(id),
            ConversationId::from("c1"),
            ParticipantRef::new("u-me", "Me"),
            DateTime::from_timestamp(100, 0).expect("timestamp"),
            "original",
        )
    }

    #[test]
    fn generations_are_scoped_per_field_group() {
        let mut tracker = MutationTracker::new();
        let target = message("m1");
        let c1 = ConversationId::from("c1");
        let m1 = MessageId::from("m1");

        tracker.begin(MutationKind::Pin, &target);
        tracker.begin(MutationKind::Pin, &target);
        tracker.begin(MutationKind::Edit, &target);

        assert_eq!(tracker.generation(&c1, &m1, FieldGroup::Pinned), Some(2));
        assert_eq!(tracker.generation(&c1, &m1, FieldGroup::Content), Some(1));
        assert_eq!(tracker.generation(&c1, &m1, FieldGroup::Reactions), None);
    }

    #[test]
    fn rollback_is_skipped_when_newer_generation_exists() {
        let mut tracker = MutationTracker::new();
        let mut target = message("m1");

        let first = tracker.begin(MutationKind::Pin, &target);
        target.pinned = true;
        let second = tracker.begin(MutationKind::Pin, &target);

        let restore = tracker.rollback(&first).expect("first was pending");
        assert!(restore.is_empty());
        assert!(tracker.is_pending(&second));

        let restore = tracker.rollback(&second).expect("second was pending");
        assert_eq!(restore.pinned, Some(true));
    }

    #[test]
    fn recall_rollback_restores_untouched_groups_only() {
        let mut tracker = MutationTracker::new();
        let mut target = message("m1");
        target.reactions.insert(
            "👍".into(),
            ReactionSummary {
                count: 1,
                reacted_by_me: false,
                users: vec!["u-x".into()],
            },
        );

        let recall = tracker.begin(MutationKind::Recall, &target);
        tracker.begin(MutationKind::React, &target);

        let restore = tracker.rollback(&recall).expect("pending");
        assert!(restore.reactions.is_none());
        assert_eq!(
            restore.content.map(|c| c.content),
            Some("original".to_string())
        );
    }

    #[test]
    fn resolving_twice_is_a_noop() {
        let mut tracker = MutationTracker::new();
        let handle = tracker.begin(MutationKind::Edit, &message("m1"));

        assert!(tracker.commit(&handle));
        assert!(!tracker.commit(&handle));
        assert!(tracker.rollback(&handle).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn oldest_pending_send_is_fifo_per_conversation() {
        let mut tracker = MutationTracker::new();
        let first = tracker.begin(MutationKind::Send, &message("local-a"));
        let _second = tracker.begin(MutationKind::Send, &message("local-b"));

        let c1 = ConversationId::from("c1");
        assert_eq!(tracker.oldest_pending_send(&c1), Some(first.clone()));
        tracker.commit(&first);
        assert_eq!(
            tracker
                .oldest_pending_send(&c1)
                .map(|h| h.message_id().as_str().to_string()),
            Some("local-b".to_string())
        );
        assert_eq!(tracker.oldest_pending_send(&ConversationId::from("c2")), None);
    }

    #[test]
    fn newer_toggle_is_scoped_to_the_same_icon() {
        let mut tracker = MutationTracker::new();
        let target = message("m1");
        let toggle = |icon: &str, reacted| ReactionToggle {
            icon: icon.into(),
            reacted,
        };

        let heart_on = tracker.begin_react(&target, toggle("❤", true));
        let thumbs = tracker.begin_react(&target, toggle("👍", true));
        assert!(!tracker.has_newer_toggle(&heart_on));

        let heart_off = tracker.begin_react(&target, toggle("❤", false));
        assert!(tracker.has_newer_toggle(&heart_on));
        assert!(!tracker.has_newer_toggle(&heart_off));
        assert!(!tracker.has_newer_toggle(&thumbs));

        let pending = tracker.pending_toggles(&ConversationId::from("c1"), &MessageId::from("m1"));
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].0, heart_on);
        assert_eq!(tracker.toggle(&heart_off), Some(&toggle("❤", false)));
    }

    #[test]
    fn forget_message_drops_pending_and_generations() {
        let mut tracker = MutationTracker::new();
        let c1 = ConversationId::from("c1");
        let m1 = MessageId::from("m1");
        tracker.begin(MutationKind::React, &message("m1"));
        tracker.begin(MutationKind::Pin, &message("m2"));

        assert_eq!(tracker.in_flight_groups(&c1, &m1), vec![FieldGroup::Reactions]);
        tracker.forget_message(&c1, &m1);

        assert!(!tracker.has_pending(&c1, &m1));
        assert_eq!(tracker.generation(&c1, &m1, FieldGroup::Reactions), None);
        assert_eq!(tracker.len(), 1);
    }
}
