use std::sync::Arc;

use chrono::Utc;
use futures::stream::BoxStream;
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, ParticipantRef, RecallScope},
    protocol::{ClientRequest, PushEvent, ServerAck},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

use crate::{
    config::SessionConfig,
    error::ChatError,
    reconciler::{BegunMutation, MessageState, Reconciled, Reconciler, StoreEvent},
    transport::ChatTransport,
};

/// Async front of the reconciler.
///
/// State changes only inside `inner`. Transport round trips never hold the
/// lock, so push events keep flowing while a mutation is outstanding.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    inner: Mutex<Reconciler>,
    events: broadcast::Sender<StoreEvent>,
    push_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        viewer: ParticipantRef,
        transport: Arc<dyn ChatTransport>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            transport,
            inner: Mutex::new(Reconciler::with_recall_placeholder(
                viewer,
                config.recall_placeholder,
            )),
            events,
            push_task: Mutex::new(None),
        })
    }

    /// Connects, starts applying push events and loads the conversation list.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChatError> {
        self.transport.connect().await?;
        // Subscribe before the initial fetch so nothing falls in between.
        let receiver = self.transport.subscribe();
        self.spawn_push_loop(receiver).await;
        self.load_conversations().await?;
        info!("chat session connected");
        Ok(())
    }

    async fn spawn_push_loop(self: &Arc<Self>, mut receiver: broadcast::Receiver<PushEvent>) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => session.handle_push(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push receiver lagged; refetching conversations");
                        if let Err(err) = session.load_conversations().await {
                            warn!(%err, "conversation refetch after lag failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("push channel closed");
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.push_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Stops applying push events.
    pub async fn disconnect(&self) {
        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }
    }

    pub async fn handle_push(&self, event: PushEvent) {
        let reconciled = { self.inner.lock().await.apply_event(event) };
        let refresh = reconciled.refresh_conversations;
        self.publish(reconciled);
        if refresh {
            if let Err(err) = self.load_conversations().await {
                warn!(%err, "conversation refresh failed");
            }
        }
    }

    pub async fn load_conversations(&self) -> Result<(), ChatError> {
        let fetched = self.transport.fetch_conversations().await?;
        info!(count = fetched.len(), "fetched conversations");
        let reconciled = { self.inner.lock().await.apply_conversations(fetched) };
        self.publish(reconciled);
        Ok(())
    }

    pub async fn load_history(&self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        let history = self.transport.fetch_messages(conversation_id).await?;
        let reconciled = {
            self.inner
                .lock()
                .await
                .apply_history(conversation_id, history)
        };
        self.publish(reconciled);
        Ok(())
    }

    /// Sends a message; returns its id after the round trip (the local id if
    /// the server has not assigned one yet).
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, ChatError> {
        let begun = {
            self.inner
                .lock()
                .await
                .begin_send(conversation_id, content, reply_to, Utc::now())?
        };
        let local_id = begun.handle.message_id().clone();
        let ack = self.round_trip(begun).await?;
        Ok(match ack {
            ServerAck::Sent { id, .. } => id,
            ServerAck::Updated(message) => message.id,
            ServerAck::Accepted => local_id,
        })
    }

    pub async fn retry_send(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ChatError> {
        let begun = { self.inner.lock().await.begin_retry(conversation_id, message_id)? };
        self.round_trip(begun).await.map(|_| ())
    }

    pub async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), ChatError> {
        let begun = {
            self.inner
                .lock()
                .await
                .begin_edit(conversation_id, message_id, content)?
        };
        self.round_trip(begun).await.map(|_| ())
    }

    pub async fn recall_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        scope: RecallScope,
    ) -> Result<(), ChatError> {
        let begun = {
            self.inner
                .lock()
                .await
                .begin_recall(conversation_id, message_id, scope)?
        };
        match begun {
            Some(begun) => self.round_trip(begun).await.map(|_| ()),
            None => Ok(()),
        }
    }

    pub async fn set_pinned(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        pinned: bool,
    ) -> Result<(), ChatError> {
        let begun = {
            self.inner
                .lock()
                .await
                .begin_pin(conversation_id, message_id, pinned)?
        };
        match begun {
            Some(begun) => self.round_trip(begun).await.map(|_| ()),
            None => Ok(()),
        }
    }

    pub async fn react(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        icon: &str,
    ) -> Result<(), ChatError> {
        let begun = {
            self.inner
                .lock()
                .await
                .begin_react(conversation_id, message_id, icon)?
        };
        self.round_trip(begun).await.map(|_| ())
    }

    /// Selects a conversation. Its unread count is zeroed before the
    /// `MarkRead` request goes out; a failing request is only logged.
    pub async fn select_conversation(&self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        let reconciled = { self.inner.lock().await.select(conversation_id)? };
        self.publish(reconciled);

        let request = ClientRequest::MarkRead {
            conversation_id: conversation_id.clone(),
        };
        if let Err(err) = self.transport.emit(request).await {
            warn!(conversation_id = %conversation_id, %err, "mark read failed");
        }
        Ok(())
    }

    pub async fn clear_selection(&self) {
        self.inner.lock().await.clear_selection();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Change notifications as a stream; lagged notifications are skipped.
    pub fn updates(&self) -> BoxStream<'static, StoreEvent> {
        Box::pin(BroadcastStream::new(self.events.subscribe()).filter_map(|item| item.ok()))
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations().to_vec()
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.inner.lock().await.conversation(conversation_id).cloned()
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner.lock().await.messages(conversation_id).to_vec()
    }

    pub async fn pinned(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .pinned(conversation_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn message_state(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<MessageState> {
        self.inner
            .lock()
            .await
            .message_state(conversation_id, message_id)
    }

    pub async fn display_text(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<String> {
        self.inner
            .lock()
            .await
            .display_text(conversation_id, message_id)
    }

    pub async fn preview(&self, conversation_id: &ConversationId) -> Option<String> {
        self.inner.lock().await.preview(conversation_id)
    }

    pub async fn selected(&self) -> Option<ConversationId> {
        self.inner.lock().await.selected().cloned()
    }

    /// Sends the request of an already applied optimistic mutation and
    /// resolves it with the outcome.
    async fn round_trip(&self, begun: BegunMutation) -> Result<ServerAck, ChatError> {
        let BegunMutation {
            handle,
            request,
            reconciled,
        } = begun;
        self.publish(reconciled);

        match self.transport.emit(request).await {
            Ok(ack) => {
                let reconciled = { self.inner.lock().await.commit(&handle, ack.clone()) };
                self.publish(reconciled);
                Ok(ack)
            }
            Err(err) => {
                let reconciled = {
                    self.inner
                        .lock()
                        .await
                        .rollback(&handle, &err.to_string())
                };
                self.publish(reconciled);
                Err(err)
            }
        }
    }

    fn publish(&self, reconciled: Reconciled) {
        for change in reconciled.changes {
            let _ = self.events.send(change);
        }
    }
}
