use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{
        Conversation, ConversationId, Message, MessageId, MessageKind, MessageStatus, Notice,
        ParticipantRef, ReactionSummary, Reactions, RecallScope, UserId,
    },
    error::ApiError,
    protocol::{ClientRequest, MutationKind, PushEvent, ServerAck},
};
use tracing::{debug, info, warn};

use crate::{
    conversation_store::ConversationStore,
    error::ChatError,
    message_log::{LogError, MergeOutcome, MessageLog, MessagePatch},
    mutation_tracker::{FieldGroup, MutationHandle, MutationTracker, ReactionToggle},
    notice,
    selection::SelectionContext,
    unread::UnreadCounter,
};

/// Change notification delivered to presentation subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Order, membership or summary fields of the conversation list changed.
    ConversationList,
    /// The message sequence or summary of one conversation changed.
    Conversation(ConversationId),
    /// A local mutation was rolled back; meant for a transient notification.
    MutationFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        kind: MutationKind,
        reason: String,
    },
}

/// Observable lifecycle of a message. Deleted messages are simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    OptimisticPending,
    Confirmed,
    Failed,
    Recalled,
}

impl MessageState {
    pub fn of(message: &Message) -> Self {
        if message.failed {
            Self::Failed
        } else if message.recalled {
            Self::Recalled
        } else if message.pending {
            Self::OptimisticPending
        } else {
            Self::Confirmed
        }
    }
}

/// What one reconciliation step changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub changes: Vec<StoreEvent>,
    /// The conversation list should be refetched (e.g. the viewer was added
    /// to a conversation that is not known locally yet).
    pub refresh_conversations: bool,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.refresh_conversations
    }

    fn push(&mut self, event: StoreEvent) {
        if !self.changes.contains(&event) {
            self.changes.push(event);
        }
    }

    fn conversation(&mut self, id: &ConversationId) {
        self.push(StoreEvent::Conversation(id.clone()));
    }

    fn list(&mut self) {
        self.push(StoreEvent::ConversationList);
    }
}

/// A local mutation that has been applied optimistically and must now be
/// sent with `request`.
#[derive(Debug, Clone)]
pub struct BegunMutation {
    pub handle: MutationHandle,
    pub request: ClientRequest,
    pub reconciled: Reconciled,
}

/// The single path through which all local state changes.
///
/// Event application never fails: events that reference unknown state are
/// logged and dropped. Every handler is idempotent under redelivery.
#[derive(Debug, Clone)]
pub struct Reconciler {
    viewer: ParticipantRef,
    recall_placeholder: String,
    log: MessageLog,
    tracker: MutationTracker,
    unread: UnreadCounter,
    conversations: ConversationStore,
    selection: SelectionContext,
}

impl Reconciler {
    pub fn new(viewer: ParticipantRef) -> Self {
        Self::with_recall_placeholder(viewer, notice::DEFAULT_RECALL_PLACEHOLDER)
    }

    pub fn with_recall_placeholder(viewer: ParticipantRef, placeholder: impl Into<String>) -> Self {
        Self {
            viewer,
            recall_placeholder: placeholder.into(),
            log: MessageLog::new(),
            tracker: MutationTracker::new(),
            unread: UnreadCounter::new(),
            conversations: ConversationStore::new(),
            selection: SelectionContext::default(),
        }
    }

    pub fn viewer(&self) -> &ParticipantRef {
        &self.viewer
    }

    pub fn conversations(&self) -> &[Conversation] {
        self.conversations.conversations()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.log.messages(conversation_id)
    }

    pub fn message(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<&Message> {
        self.log.get(conversation_id, message_id)
    }

    pub fn pinned(&self, conversation_id: &ConversationId) -> Vec<&Message> {
        self.log.pinned(conversation_id)
    }

    pub fn message_state(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<MessageState> {
        self.message(conversation_id, message_id).map(MessageState::of)
    }

    pub fn selected(&self) -> Option<&ConversationId> {
        self.selection.active()
    }

    pub fn pending_mutations(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_pending(&self, handle: &MutationHandle) -> bool {
        self.tracker.is_pending(handle)
    }

    /// Text to display for a message, with notices personalized for the viewer.
    pub fn display_text(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<String> {
        let message = self.message(conversation_id, message_id)?;
        let rendered = self
            .conversation(conversation_id)
            .and_then(|conv| notice::render_notice(message, &self.viewer.user_id, conv));
        Some(rendered.unwrap_or_else(|| message.content.clone()))
    }

    pub fn preview(&self, conversation_id: &ConversationId) -> Option<String> {
        let conversation = self.conversation(conversation_id)?;
        let last = conversation
            .last_message
            .as_ref()
            .and_then(|id| self.log.get(conversation_id, id))
            .or_else(|| self.log.last(conversation_id))?;
        Some(notice::preview_text(
            last,
            &self.viewer.user_id,
            conversation,
            &self.recall_placeholder,
        ))
    }

    // ---- fetch results -------------------------------------------------

    pub fn apply_conversations(&mut self, mut fetched: Vec<Conversation>) -> Reconciled {
        let mut out = Reconciled::default();
        let selected = self.selection.active().cloned();

        for conversation in &mut fetched {
            dedup_participants(&mut conversation.participants);
            if selected.as_ref() == Some(&conversation.id) {
                conversation.unread_count = 0;
            }
        }
        self.conversations.replace_all(fetched);

        if let Some(id) = selected {
            if !self.conversations.contains(&id) {
                self.selection.clear();
            }
        }
        for id in self.conversation_ids() {
            self.refresh_last_message(&id, &mut out);
        }
        info!(count = self.conversations.len(), "conversation list reconciled");
        out.list();
        out
    }

    pub fn apply_history(&mut self, conversation_id: &ConversationId, history: Vec<Message>) -> Reconciled {
        let mut out = Reconciled::default();
        for message in history {
            if &message.conversation_id != conversation_id {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    other = %message.conversation_id,
                    "dropping history entry for another conversation"
                );
                continue;
            }
            let message = self.sanitize_incoming(message);
            if self.log.append_or_merge(message).changed() {
                out.conversation(conversation_id);
            }
        }
        self.refresh_last_message(conversation_id, &mut out);
        out
    }

    // ---- push events ---------------------------------------------------

    pub fn apply_event(&mut self, event: PushEvent) -> Reconciled {
        let mut out = Reconciled::default();
        debug!(event = event.name(), conversation_id = %event.conversation_id(), "applying push event");

        match event {
            PushEvent::MessageCreated { message } => self.on_message_created(message, &mut out),
            PushEvent::StatusChanged {
                conversation_id,
                message_id,
                status,
            } => self.on_status_changed(&conversation_id, &message_id, status, &mut out),
            PushEvent::ReactionChanged {
                conversation_id,
                message_id,
                reactions,
            } => self.on_reaction_changed(&conversation_id, &message_id, reactions, &mut out),
            PushEvent::Recalled {
                conversation_id,
                message_id,
                scope,
                placeholder,
            } => self.on_recalled(&conversation_id, &message_id, scope, placeholder, &mut out),
            PushEvent::Pinned {
                conversation_id,
                message_id,
            } => self.on_pinned(&conversation_id, &message_id, true, &mut out),
            PushEvent::Unpinned {
                conversation_id,
                message_id,
            } => self.on_pinned(&conversation_id, &message_id, false, &mut out),
            PushEvent::MessageEdited {
                conversation_id,
                message_id,
                content,
            } => self.on_message_edited(&conversation_id, &message_id, content, &mut out),
            PushEvent::MembersAdded {
                conversation_id,
                actor,
                added,
                group_name,
                message_id,
                at,
            } => self.on_members_added(
                &conversation_id,
                actor,
                added,
                group_name,
                message_id,
                at,
                &mut out,
            ),
            PushEvent::MembersRemoved {
                conversation_id,
                actor,
                removed,
                group_name,
                message_id,
                at,
            } => self.on_members_removed(
                &conversation_id,
                actor,
                removed,
                group_name,
                message_id,
                at,
                &mut out,
            ),
            PushEvent::Left {
                conversation_id,
                member,
                group_name,
                message_id,
                at,
            } => self.on_left(&conversation_id, member, group_name, message_id, at, &mut out),
            PushEvent::GroupInfoEdited {
                conversation_id,
                actor,
                display_name,
                avatar_ref,
                message_id,
                at,
            } => self.on_group_info_edited(
                &conversation_id,
                actor,
                display_name,
                avatar_ref,
                message_id,
                at,
                &mut out,
            ),
            PushEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => self.on_message_deleted(&conversation_id, &message_id, &mut out),
            PushEvent::ConversationCreated {
                conversation,
                created_by,
                unread_count,
            } => self.on_conversation_created(conversation, created_by, unread_count, &mut out),
            PushEvent::MutationRejected {
                conversation_id,
                message_id,
                kind,
                error,
            } => self.on_mutation_rejected(&conversation_id, message_id, kind, error, &mut out),
        }
        out
    }

    fn on_message_created(&mut self, message: Message, out: &mut Reconciled) {
        let conversation_id = message.conversation_id.clone();
        let message = self.sanitize_incoming(message);

        if self.log.contains(&conversation_id, &message.id) {
            if self.log.append_or_merge(message).changed() {
                out.conversation(&conversation_id);
                self.refresh_last_message(&conversation_id, out);
            }
            return;
        }

        if message.sender.user_id == self.viewer.user_id {
            if let Some(handle) = self.tracker.oldest_pending_send(&conversation_id) {
                self.confirm_send(&handle, message, out);
                return;
            }
        }

        self.ingest_new(message, out);
    }

    /// Inserts a message not yet in the log and runs the unread policy.
    fn ingest_new(&mut self, message: Message, out: &mut Reconciled) {
        let conversation_id = message.conversation_id.clone();
        if self.log.append_or_merge(message.clone()) != MergeOutcome::Inserted {
            return;
        }
        out.conversation(&conversation_id);

        if !self.conversations.contains(&conversation_id) {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "message for unknown conversation; requesting list refresh"
            );
            out.refresh_conversations = true;
            return;
        }

        let viewer = self.viewer.user_id.clone();
        let selected = self.selection.is_selected(&conversation_id);
        let unread = &mut self.unread;
        if self.conversations.update(&conversation_id, |conv| {
            unread.on_message(conv, &message, &viewer, selected);
        }) == Some(true)
        {
            out.list();
        }
        self.refresh_last_message(&conversation_id, out);
    }

    /// Replaces the local entry of `handle` with its server copy.
    fn confirm_send(&mut self, handle: &MutationHandle, confirmed: Message, out: &mut Reconciled) {
        let conversation_id = handle.conversation_id().clone();
        let server_id = confirmed.id.clone();
        match self.log.replace_local(handle.message_id(), confirmed) {
            Ok(_) => {
                self.tracker.commit(handle);
                self.tracker.forget_message(&conversation_id, handle.message_id());
                self.sync_pending_flag(&conversation_id, &server_id);
                debug!(
                    conversation_id = %conversation_id,
                    local_id = %handle.message_id(),
                    message_id = %server_id,
                    "optimistic send confirmed"
                );
                out.conversation(&conversation_id);
                self.refresh_last_message(&conversation_id, out);
            }
            Err(err) => {
                warn!(%err, "pending send lost its local entry");
                self.tracker.commit(handle);
                self.tracker.forget_message(&conversation_id, handle.message_id());
            }
        }
    }

    fn on_status_changed(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
        out: &mut Reconciled,
    ) {
        let patch = MessagePatch {
            status: Some(status),
            ..MessagePatch::default()
        };
        self.patch_or_drop(conversation_id, message_id, patch, out);
    }

    fn on_reaction_changed(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        mut reactions: Reactions,
        out: &mut Reconciled,
    ) {
        let Some(existing) = self.log.get(conversation_id, message_id) else {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "reaction for unknown message dropped");
            return;
        };
        if existing.recalled {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "reaction on recalled message dropped");
            return;
        }

        normalize_reactions(&mut reactions, &self.viewer.user_id);
        let toggles = self.tracker.pending_toggles(conversation_id, message_id);
        if let Some((handle, _)) = toggles
            .iter()
            .find(|(_, toggle)| viewer_reacted(&reactions, &toggle.icon) == toggle.reacted)
        {
            self.tracker.commit(handle);
            debug!(conversation_id = %conversation_id, message_id = %message_id, "reaction confirmed by push");
        }
        // Unconfirmed toggles keep their optimistic state on top of the server's.
        for (handle, toggle) in &toggles {
            if self.tracker.is_pending(handle) {
                set_reaction(&mut reactions, &toggle.icon, &self.viewer.user_id, toggle.reacted);
            }
        }
        let patch = MessagePatch {
            reactions: Some(reactions),
            ..MessagePatch::default()
        };
        self.patch_or_drop(conversation_id, message_id, patch, out);
        self.sync_pending_flag_notify(conversation_id, message_id, out);
    }

    fn on_recalled(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        scope: RecallScope,
        placeholder: Option<String>,
        out: &mut Reconciled,
    ) {
        if !self.log.contains(conversation_id, message_id) {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "recall for unknown message dropped");
            return;
        }
        self.confirm_pending(conversation_id, message_id, MutationKind::Recall);
        let content = placeholder.unwrap_or_else(|| self.recall_placeholder.clone());
        self.patch_or_drop(conversation_id, message_id, recall_patch(content, scope), out);
        self.sync_pending_flag_notify(conversation_id, message_id, out);
    }

    fn on_pinned(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        pinned: bool,
        out: &mut Reconciled,
    ) {
        if !self.log.contains(conversation_id, message_id) {
            debug!(conversation_id = %conversation_id, message_id = %message_id, pinned, "pin change for unknown message dropped");
            return;
        }
        self.confirm_pending(conversation_id, message_id, MutationKind::Pin);
        let patch = MessagePatch {
            pinned: Some(pinned),
            ..MessagePatch::default()
        };
        self.patch_or_drop(conversation_id, message_id, patch, out);
        self.sync_pending_flag_notify(conversation_id, message_id, out);
    }

    fn on_message_edited(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: String,
        out: &mut Reconciled,
    ) {
        let Some(existing) = self.log.get(conversation_id, message_id) else {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "edit for unknown message dropped");
            return;
        };
        if existing.recalled {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "edit of recalled message dropped");
            return;
        }
        self.confirm_pending(conversation_id, message_id, MutationKind::Edit);
        let patch = MessagePatch {
            content: Some(content),
            edited: Some(true),
            ..MessagePatch::default()
        };
        self.patch_or_drop(conversation_id, message_id, patch, out);
        self.sync_pending_flag_notify(conversation_id, message_id, out);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_members_added(
        &mut self,
        conversation_id: &ConversationId,
        actor: ParticipantRef,
        added: Vec<ParticipantRef>,
        group_name: Option<String>,
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
        out: &mut Reconciled,
    ) {
        if !self.conversations.contains(conversation_id) {
            if added.iter().any(|p| p.user_id == self.viewer.user_id) {
                info!(conversation_id = %conversation_id, "viewer added to unknown conversation");
                out.refresh_conversations = true;
            } else {
                debug!(conversation_id = %conversation_id, "members added to unknown conversation dropped");
            }
            return;
        }

        let members = added.clone();
        if self.conversations.update(conversation_id, |conv| {
            for member in members {
                conv.add_participant(member);
            }
        }) == Some(true)
        {
            out.list();
            out.conversation(conversation_id);
        }

        if let Some(id) = message_id {
            let notice = Notice {
                actor,
                targets: added,
                group_name,
            };
            let message = Message::system(
                id,
                conversation_id.clone(),
                MessageKind::SystemAddMembers,
                notice,
                at,
            );
            self.ingest_new(message, out);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_members_removed(
        &mut self,
        conversation_id: &ConversationId,
        actor: ParticipantRef,
        removed: Vec<ParticipantRef>,
        group_name: Option<String>,
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
        out: &mut Reconciled,
    ) {
        if removed.iter().any(|p| p.user_id == self.viewer.user_id) {
            self.drop_conversation(conversation_id, out);
            return;
        }
        if !self.conversations.contains(conversation_id) {
            debug!(conversation_id = %conversation_id, "members removed from unknown conversation dropped");
            return;
        }

        let members: Vec<UserId> = removed.iter().map(|p| p.user_id.clone()).collect();
        if self.conversations.update(conversation_id, |conv| {
            for member in &members {
                conv.remove_participant(member);
            }
        }) == Some(true)
        {
            out.list();
            out.conversation(conversation_id);
        }

        if let Some(id) = message_id {
            let notice = Notice {
                actor,
                targets: removed,
                group_name,
            };
            let message = Message::system(
                id,
                conversation_id.clone(),
                MessageKind::SystemRemoveMembers,
                notice,
                at,
            );
            self.ingest_new(message, out);
        }
    }

    fn on_left(
        &mut self,
        conversation_id: &ConversationId,
        member: ParticipantRef,
        group_name: Option<String>,
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
        out: &mut Reconciled,
    ) {
        if member.user_id == self.viewer.user_id {
            self.drop_conversation(conversation_id, out);
            return;
        }
        if !self.conversations.contains(conversation_id) {
            debug!(conversation_id = %conversation_id, "leave from unknown conversation dropped");
            return;
        }

        if self.conversations.update(conversation_id, |conv| {
            conv.remove_participant(&member.user_id);
        }) == Some(true)
        {
            out.list();
            out.conversation(conversation_id);
        }

        if let Some(id) = message_id {
            let notice = Notice {
                actor: member,
                targets: Vec::new(),
                group_name,
            };
            let message = Message::system(
                id,
                conversation_id.clone(),
                MessageKind::SystemLeaveGroup,
                notice,
                at,
            );
            self.ingest_new(message, out);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_group_info_edited(
        &mut self,
        conversation_id: &ConversationId,
        actor: ParticipantRef,
        display_name: Option<String>,
        avatar_ref: Option<String>,
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
        out: &mut Reconciled,
    ) {
        let name = display_name.clone();
        let updated = self.conversations.update(conversation_id, |conv| {
            if let Some(name) = name {
                conv.display_name = name;
            }
            if avatar_ref.is_some() {
                conv.avatar_ref = avatar_ref;
            }
        });
        match updated {
            None => {
                debug!(conversation_id = %conversation_id, "group info for unknown conversation dropped");
                return;
            }
            Some(true) => {
                out.list();
                out.conversation(conversation_id);
            }
            Some(false) => {}
        }

        if let (Some(id), Some(name)) = (message_id, display_name) {
            let notice = Notice {
                actor,
                targets: Vec::new(),
                group_name: Some(name),
            };
            let message = Message::system(
                id,
                conversation_id.clone(),
                MessageKind::SystemEditGroupName,
                notice,
                at,
            );
            self.ingest_new(message, out);
        }
    }

    fn on_message_deleted(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        out: &mut Reconciled,
    ) {
        if let Err(err) = self.log.remove(conversation_id, message_id) {
            debug!(%err, "delete for unknown message dropped");
            return;
        }
        self.tracker.forget_message(conversation_id, message_id);
        out.conversation(conversation_id);

        let tail = self.log.last(conversation_id).map(|m| m.id.clone());
        let removed = message_id.clone();
        if self.conversations.update(conversation_id, |conv| {
            if conv.last_message.as_ref() == Some(&removed) {
                conv.last_message = tail;
            }
        }) == Some(true)
        {
            out.list();
        }
    }

    fn on_conversation_created(
        &mut self,
        mut conversation: Conversation,
        created_by: UserId,
        unread_count: Option<u32>,
        out: &mut Reconciled,
    ) {
        if self.conversations.contains(&conversation.id) {
            debug!(conversation_id = %conversation.id, "conversation already known");
            return;
        }
        dedup_participants(&mut conversation.participants);
        conversation.unread_count =
            UnreadCounter::initial_count(&created_by, &self.viewer.user_id, unread_count);
        conversation.created_by = Some(created_by);
        let id = conversation.id.clone();
        info!(conversation_id = %id, unread = conversation.unread_count, "conversation created");
        self.conversations.upsert(conversation);
        out.list();
        out.conversation(&id);
    }

    fn on_mutation_rejected(
        &mut self,
        conversation_id: &ConversationId,
        message_id: Option<MessageId>,
        kind: MutationKind,
        error: ApiError,
        out: &mut Reconciled,
    ) {
        let handle = match (kind, message_id) {
            (MutationKind::Send, Some(id)) => self
                .tracker
                .oldest_pending(conversation_id, &id, MutationKind::Send)
                .or_else(|| self.tracker.oldest_pending_send(conversation_id)),
            (MutationKind::Send, None) => self.tracker.oldest_pending_send(conversation_id),
            (kind, Some(id)) => self.tracker.oldest_pending(conversation_id, &id, kind),
            (kind, None) => {
                debug!(conversation_id = %conversation_id, ?kind, "rejection without target dropped");
                None
            }
        };
        let Some(handle) = handle else {
            debug!(conversation_id = %conversation_id, ?kind, "rejection without pending mutation dropped");
            return;
        };
        let reason = ChatError::from(error).to_string();
        let rolled_back = self.rollback(&handle, &reason);
        out.changes.extend(rolled_back.changes);
    }

    // ---- local mutations -----------------------------------------------

    pub fn begin_send(
        &mut self,
        conversation_id: &ConversationId,
        content: &str,
        reply_to: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<BegunMutation, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::validation("message content must not be empty"));
        }
        if !self.conversations.contains(conversation_id) {
            return Err(ChatError::not_found(format!("conversation '{conversation_id}'")));
        }
        if let Some(target) = &reply_to {
            if !self.log.contains(conversation_id, target) {
                return Err(ChatError::not_found(format!("reply target '{target}'")));
            }
        }

        let mut message = Message::text(
            MessageId::local(),
            conversation_id.clone(),
            self.viewer.clone(),
            now,
            content,
        );
        if reply_to.is_some() {
            message.kind = MessageKind::Reply;
        }
        message.reply_to = reply_to.clone();
        message.pending = true;

        let handle = self.tracker.begin(MutationKind::Send, &message);
        self.log.append_or_merge(message);

        let mut out = Reconciled::default();
        out.conversation(conversation_id);
        self.refresh_last_message(conversation_id, &mut out);

        Ok(BegunMutation {
            handle,
            request: ClientRequest::SendMessage {
                conversation_id: conversation_id.clone(),
                content: content.to_string(),
                reply_to,
            },
            reconciled: out,
        })
    }

    /// Starts a fresh attempt for a failed send, reusing its local entry.
    pub fn begin_retry(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<BegunMutation, ChatError> {
        let message = self
            .log
            .get(conversation_id, message_id)
            .ok_or_else(|| ChatError::not_found(format!("message '{message_id}'")))?;
        if !message.failed {
            return Err(ChatError::validation("only failed sends can be retried"));
        }
        let request = ClientRequest::SendMessage {
            conversation_id: conversation_id.clone(),
            content: message.content.clone(),
            reply_to: message.reply_to.clone(),
        };
        let handle = self.tracker.begin(MutationKind::Send, message);
        let patch = MessagePatch {
            failed: Some(false),
            pending: Some(true),
            ..MessagePatch::default()
        };
        let mut out = Reconciled::default();
        self.patch_or_drop(conversation_id, message_id, patch, &mut out);
        Ok(BegunMutation {
            handle,
            request,
            reconciled: out,
        })
    }

    pub fn begin_edit(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<BegunMutation, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::validation("edited content must not be empty"));
        }
        let message = self.mutable_target(conversation_id, message_id)?.clone();
        if message.recalled {
            return Err(ChatError::validation("recalled messages cannot be edited"));
        }
        let handle = self.tracker.begin(MutationKind::Edit, &message);
        let patch = MessagePatch {
            content: Some(content.to_string()),
            edited: Some(true),
            ..MessagePatch::default()
        };
        let out = self.apply_optimistic(conversation_id, message_id, patch);
        Ok(BegunMutation {
            handle,
            request: ClientRequest::EditMessage {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                content: content.to_string(),
            },
            reconciled: out,
        })
    }

    /// Returns `None` when the message is already recalled.
    pub fn begin_recall(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        scope: RecallScope,
    ) -> Result<Option<BegunMutation>, ChatError> {
        let message = self.mutable_target(conversation_id, message_id)?.clone();
        if message.recalled {
            return Ok(None);
        }
        let handle = self.tracker.begin(MutationKind::Recall, &message);
        let patch = recall_patch(self.recall_placeholder.clone(), scope);
        let out = self.apply_optimistic(conversation_id, message_id, patch);
        Ok(Some(BegunMutation {
            handle,
            request: ClientRequest::RecallMessage {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                scope,
            },
            reconciled: out,
        }))
    }

    /// Returns `None` when the message already has the requested pin state.
    pub fn begin_pin(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        pinned: bool,
    ) -> Result<Option<BegunMutation>, ChatError> {
        let message = self.mutable_target(conversation_id, message_id)?.clone();
        if message.pinned == pinned {
            return Ok(None);
        }
        if pinned && message.recalled {
            return Err(ChatError::validation("recalled messages cannot be pinned"));
        }
        let handle = self.tracker.begin(MutationKind::Pin, &message);
        let patch = MessagePatch {
            pinned: Some(pinned),
            ..MessagePatch::default()
        };
        let out = self.apply_optimistic(conversation_id, message_id, patch);
        Ok(Some(BegunMutation {
            handle,
            request: ClientRequest::SetPinned {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                pinned,
            },
            reconciled: out,
        }))
    }

    /// Toggles the viewer's reaction `icon` on a message.
    pub fn begin_react(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        icon: &str,
    ) -> Result<BegunMutation, ChatError> {
        let icon = icon.trim();
        if icon.is_empty() {
            return Err(ChatError::validation("reaction icon must not be empty"));
        }
        let message = self.mutable_target(conversation_id, message_id)?.clone();
        if message.recalled {
            return Err(ChatError::validation("recalled messages cannot be reacted to"));
        }
        let toggle = ReactionToggle {
            icon: icon.to_string(),
            reacted: !viewer_reacted(&message.reactions, icon),
        };
        let mut reactions = message.reactions.clone();
        set_reaction(&mut reactions, icon, &self.viewer.user_id, toggle.reacted);
        let handle = self.tracker.begin_react(&message, toggle);
        let patch = MessagePatch {
            reactions: Some(reactions),
            ..MessagePatch::default()
        };
        let out = self.apply_optimistic(conversation_id, message_id, patch);
        Ok(BegunMutation {
            handle,
            request: ClientRequest::React {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                icon: icon.to_string(),
            },
            reconciled: out,
        })
    }

    /// Applies a successful server response for `handle`.
    pub fn commit(&mut self, handle: &MutationHandle, ack: ServerAck) -> Reconciled {
        let mut out = Reconciled::default();
        if !self.tracker.is_pending(handle) {
            debug!(
                conversation_id = %handle.conversation_id(),
                message_id = %handle.message_id(),
                kind = ?handle.kind(),
                "ack for already resolved mutation ignored"
            );
            return out;
        }

        let conversation_id = handle.conversation_id().clone();
        let message_id = handle.message_id().clone();

        match (handle.kind(), ack) {
            (MutationKind::Send, ServerAck::Sent { id, created_at }) => {
                let Some(local) = self.log.get(&conversation_id, &message_id) else {
                    self.tracker.commit(handle);
                    return out;
                };
                let mut confirmed = local.clone();
                confirmed.id = id;
                confirmed.created_at = created_at;
                confirmed.pending = false;
                confirmed.failed = false;
                self.confirm_send(handle, confirmed, &mut out);
            }
            (MutationKind::Send, ServerAck::Updated(message)) => {
                let confirmed = self.sanitize_incoming(message);
                self.confirm_send(handle, confirmed, &mut out);
            }
            (MutationKind::Send, ServerAck::Accepted) => {
                // No server id yet; the MessageCreated push will correlate it.
                debug!(conversation_id = %conversation_id, local_id = %message_id, "send accepted without id");
            }
            (_, ServerAck::Updated(message)) => {
                self.tracker.commit(handle);
                if message.id == message_id && message.conversation_id == conversation_id {
                    let message = self.sanitize_incoming(message);
                    if self.log.append_or_merge(message).changed() {
                        out.conversation(&conversation_id);
                    }
                }
                self.sync_pending_flag_notify(&conversation_id, &message_id, &mut out);
            }
            (_, ServerAck::Sent { .. } | ServerAck::Accepted) => {
                self.tracker.commit(handle);
                self.sync_pending_flag_notify(&conversation_id, &message_id, &mut out);
            }
        }
        out
    }

    /// Reverts an optimistic mutation after a correlated failure.
    pub fn rollback(&mut self, handle: &MutationHandle, reason: &str) -> Reconciled {
        let mut out = Reconciled::default();
        let conversation_id = handle.conversation_id().clone();
        let message_id = handle.message_id().clone();
        let toggle = self.tracker.toggle(handle).cloned();
        let superseded = self.tracker.has_newer_toggle(handle);
        let Some(mut snapshot) = self.tracker.rollback(handle) else {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "rollback for resolved mutation ignored");
            return out;
        };
        warn!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            kind = ?handle.kind(),
            reason,
            "rolling back optimistic mutation"
        );

        let Some((recalled, mut reactions)) = self
            .log
            .get(&conversation_id, &message_id)
            .map(|m| (m.recalled, m.reactions.clone()))
        else {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "rollback target no longer exists");
            return out;
        };

        if handle.kind() == MutationKind::Send {
            let patch = MessagePatch {
                failed: Some(true),
                pending: Some(false),
                ..MessagePatch::default()
            };
            self.patch_or_drop(&conversation_id, &message_id, patch, &mut out);
        } else {
            if recalled && handle.kind() != MutationKind::Recall {
                debug!(conversation_id = %conversation_id, message_id = %message_id, "message recalled meanwhile; content and reactions stay");
                snapshot.content = None;
                snapshot.reactions = None;
            }
            if let Some(toggle) = toggle {
                // Undo only the viewer's toggle; other users' reactions stay.
                snapshot.reactions = None;
                if !recalled && !superseded {
                    set_reaction(&mut reactions, &toggle.icon, &self.viewer.user_id, !toggle.reacted);
                    snapshot.reactions = Some(reactions);
                }
            }
            if !snapshot.is_empty() {
                self.patch_or_drop(&conversation_id, &message_id, snapshot.into_patch(), &mut out);
            }
        }
        if handle.kind() != MutationKind::Send {
            self.sync_pending_flag_notify(&conversation_id, &message_id, &mut out);
        }

        out.conversation(&conversation_id);
        out.push(StoreEvent::MutationFailed {
            conversation_id,
            message_id,
            kind: handle.kind(),
            reason: reason.to_string(),
        });
        out
    }

    // ---- selection -----------------------------------------------------

    /// Selects a conversation and zeroes its unread count right away.
    pub fn select(&mut self, conversation_id: &ConversationId) -> Result<Reconciled, ChatError> {
        if !self.conversations.contains(conversation_id) {
            return Err(ChatError::not_found(format!("conversation '{conversation_id}'")));
        }
        let mut out = Reconciled::default();
        self.selection.select(conversation_id.clone());
        if self
            .conversations
            .update(conversation_id, |conv| {
                UnreadCounter::reset(conv);
            })
            == Some(true)
        {
            out.list();
            out.conversation(conversation_id);
        }
        Ok(out)
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    // ---- helpers -------------------------------------------------------

    fn conversation_ids(&self) -> Vec<ConversationId> {
        self.conversations
            .conversations()
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    /// A confirmed message that local mutations may target.
    fn mutable_target(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<&Message, ChatError> {
        let message = self
            .log
            .get(conversation_id, message_id)
            .ok_or_else(|| ChatError::not_found(format!("message '{message_id}'")))?;
        if message.id.is_local() {
            return Err(ChatError::validation("message is not confirmed yet"));
        }
        if message.kind.is_system() {
            return Err(ChatError::validation("system messages cannot be modified"));
        }
        Ok(message)
    }

    fn apply_optimistic(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        mut patch: MessagePatch,
    ) -> Reconciled {
        let mut out = Reconciled::default();
        patch.pending = Some(true);
        self.patch_or_drop(conversation_id, message_id, patch, &mut out);
        out
    }

    fn patch_or_drop(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
        out: &mut Reconciled,
    ) {
        match self.log.apply_patch(conversation_id, message_id, patch) {
            Ok(true) => {
                out.conversation(conversation_id);
                self.refresh_last_message(conversation_id, out);
            }
            Ok(false) => {}
            Err(LogError::NotFound { .. }) => {
                debug!(conversation_id = %conversation_id, message_id = %message_id, "patch target not found; dropped");
            }
        }
    }

    fn confirm_pending(&mut self, conversation_id: &ConversationId, message_id: &MessageId, kind: MutationKind) {
        if let Some(handle) = self.tracker.oldest_pending(conversation_id, message_id, kind) {
            self.tracker.commit(&handle);
            debug!(conversation_id = %conversation_id, message_id = %message_id, ?kind, "mutation confirmed by push");
        }
    }

    /// Keeps `Message::pending` equal to "has an unresolved mutation".
    fn sync_pending_flag(&mut self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        let pending = self.tracker.has_pending(conversation_id, message_id);
        let patch = MessagePatch {
            pending: Some(pending),
            ..MessagePatch::default()
        };
        self.log
            .apply_patch(conversation_id, message_id, patch)
            .unwrap_or(false)
    }

    fn sync_pending_flag_notify(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        out: &mut Reconciled,
    ) {
        if self.sync_pending_flag(conversation_id, message_id) {
            out.conversation(conversation_id);
        }
    }

    /// Normalizes a server-authored message before it touches the log.
    ///
    /// Field-groups with an in-flight local mutation keep their optimistic
    /// values until that mutation resolves.
    fn sanitize_incoming(&self, mut message: Message) -> Message {
        message.pending = false;
        message.failed = false;
        normalize_reactions(&mut message.reactions, &self.viewer.user_id);

        let Some(existing) = self.log.get(&message.conversation_id, &message.id) else {
            return message;
        };
        for group in self
            .tracker
            .in_flight_groups(&message.conversation_id, &message.id)
        {
            match group {
                FieldGroup::Content => {
                    message.content = existing.content.clone();
                    message.recalled = existing.recalled;
                    message.recall_scope = existing.recall_scope;
                    message.edited = existing.edited;
                }
                FieldGroup::Pinned => message.pinned = existing.pinned,
                FieldGroup::Reactions => message.reactions = existing.reactions.clone(),
            }
            message.pending = true;
        }
        message
    }

    /// Points `last_message` at the log tail and advances `modified_at`.
    fn refresh_last_message(&mut self, conversation_id: &ConversationId, out: &mut Reconciled) {
        let Some(tail) = self.log.last(conversation_id) else {
            return;
        };
        let tail_id = tail.id.clone();
        let tail_at = tail.created_at;
        if self.conversations.update(conversation_id, |conv| {
            conv.last_message = Some(tail_id);
            if tail_at > conv.modified_at {
                conv.modified_at = tail_at;
            }
        }) == Some(true)
        {
            out.list();
        }
    }

    fn drop_conversation(&mut self, conversation_id: &ConversationId, out: &mut Reconciled) {
        let removed = self.conversations.remove(conversation_id).is_some();
        self.log.clear(conversation_id);
        self.tracker.forget_conversation(conversation_id);
        self.unread.forget(conversation_id);
        let was_selected = self.selection.clear_if(conversation_id);
        info!(conversation_id = %conversation_id, removed, was_selected, "viewer left conversation");
        if removed {
            out.list();
            out.conversation(conversation_id);
        }
    }
}

fn recall_patch(content: String, scope: RecallScope) -> MessagePatch {
    MessagePatch {
        content: Some(content),
        reactions: Some(Reactions::new()),
        recalled: Some(true),
        recall_scope: Some(Some(scope)),
        ..MessagePatch::default()
    }
}

fn dedup_participants(participants: &mut Vec<ParticipantRef>) {
    let mut seen = Vec::with_capacity(participants.len());
    participants.retain(|p| {
        if seen.contains(&p.user_id) {
            false
        } else {
            seen.push(p.user_id.clone());
            true
        }
    });
}

/// Derives `reacted_by_me` from the user list when one is present and drops
/// empty entries.
fn normalize_reactions(reactions: &mut Reactions, viewer: &UserId) {
    reactions.retain(|_, summary| summary.count > 0);
    for summary in reactions.values_mut() {
        if !summary.users.is_empty() {
            summary.reacted_by_me = summary.users.contains(viewer);
        }
    }
}

fn viewer_reacted(reactions: &Reactions, icon: &str) -> bool {
    reactions.get(icon).is_some_and(|summary| summary.reacted_by_me)
}

/// Moves the viewer's reaction on `icon` to `reacted`, adjusting the count.
fn set_reaction(reactions: &mut Reactions, icon: &str, viewer: &UserId, reacted: bool) {
    if viewer_reacted(reactions, icon) == reacted {
        return;
    }
    let entry = reactions.entry(icon.to_string()).or_insert_with(ReactionSummary::default);
    if entry.reacted_by_me {
        entry.count = entry.count.saturating_sub(1);
        entry.reacted_by_me = false;
        entry.users.retain(|u| u != viewer);
    } else {
        entry.count += 1;
        entry.reacted_by_me = true;
        if !entry.users.contains(viewer) {
            entry.users.push(viewer.clone());
        }
    }
    if entry.count == 0 {
        reactions.remove(icon);
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
