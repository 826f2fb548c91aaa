use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, MessageKind, ParticipantRef},
    protocol::{ClientRequest, PushEvent, ServerAck},
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::error::ChatError;

/// Connection to the chat backend.
///
/// Implementations own the wire format and the push channel; the session
/// only sees typed requests, acks and events.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<(), ChatError>;

    /// Push events delivered after this call.
    fn subscribe(&self) -> broadcast::Receiver<PushEvent>;

    /// Conversation summaries, in any order.
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError>;

    /// Message history of one conversation, in any order.
    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError>;

    async fn emit(&self, request: ClientRequest) -> Result<ServerAck, ChatError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    SendMessage,
    EditMessage,
    RecallMessage,
    SetPinned,
    React,
    MarkRead,
}

impl RequestKind {
    pub fn of(request: &ClientRequest) -> Self {
        match request {
            ClientRequest::SendMessage { .. } => Self::SendMessage,
            ClientRequest::EditMessage { .. } => Self::EditMessage,
            ClientRequest::RecallMessage { .. } => Self::RecallMessage,
            ClientRequest::SetPinned { .. } => Self::SetPinned,
            ClientRequest::React { .. } => Self::React,
            ClientRequest::MarkRead { .. } => Self::MarkRead,
        }
    }
}

/// Scripted reply for the next request of a kind.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ack(ServerAck),
    Fail(ChatError),
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    conversations: Vec<Conversation>,
    histories: HashMap<ConversationId, Vec<Message>>,
    scripted: HashMap<RequestKind, VecDeque<Scripted>>,
    fetch_failures: VecDeque<ChatError>,
    requests: Vec<ClientRequest>,
    next_id: u64,
}

/// Deterministic in-process backend.
///
/// Unscripted sends are acknowledged with `srv-<n>` ids; everything else is
/// `Accepted`. With echo enabled, every acknowledged send is also delivered
/// as a `MessageCreated` push, the way a real server fans it out.
pub struct MemoryTransport {
    viewer: ParticipantRef,
    events: broadcast::Sender<PushEvent>,
    echo_sends: bool,
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new(viewer: ParticipantRef, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            viewer,
            events,
            echo_sends: false,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_conversations(mut self, conversations: Vec<Conversation>) -> Self {
        self.state.get_mut().conversations = conversations;
        self
    }

    pub fn with_history(mut self, conversation_id: ConversationId, messages: Vec<Message>) -> Self {
        self.state.get_mut().histories.insert(conversation_id, messages);
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_sends = echo;
        self
    }

    /// Queues a reply for the next request of `kind`.
    pub async fn script(&self, kind: RequestKind, reply: Scripted) {
        self.state
            .lock()
            .await
            .scripted
            .entry(kind)
            .or_default()
            .push_back(reply);
    }

    pub async fn fail_next_fetch(&self, error: ChatError) {
        self.state.lock().await.fetch_failures.push_back(error);
    }

    pub async fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().await.conversations = conversations;
    }

    /// Delivers an event to every subscriber; returns how many received it.
    pub fn push(&self, event: PushEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub async fn requests(&self) -> Vec<ClientRequest> {
        self.state.lock().await.requests.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    fn default_ack(state: &mut MemoryState, request: &ClientRequest) -> ServerAck {
        match request {
            ClientRequest::SendMessage { .. } => {
                state.next_id += 1;
                ServerAck::Sent {
                    id: MessageId::new(format!("srv-{}", state.next_id)),
                    created_at: Utc::now(),
                }
            }
            _ => ServerAck::Accepted,
        }
    }

    fn echo_for(&self, request: &ClientRequest, id: &MessageId, created_at: DateTime<Utc>) -> Option<PushEvent> {
        let ClientRequest::SendMessage {
            conversation_id,
            content,
            reply_to,
        } = request
        else {
            return None;
        };
        let mut message = Message::text(
            id.clone(),
            conversation_id.clone(),
            self.viewer.clone(),
            created_at,
            content.clone(),
        );
        if reply_to.is_some() {
            message.kind = MessageKind::Reply;
            message.reply_to = reply_to.clone();
        }
        Some(PushEvent::MessageCreated { message })
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), ChatError> {
        self.state.lock().await.connected = true;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state.conversations.clone())
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .histories
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn emit(&self, request: ClientRequest) -> Result<ServerAck, ChatError> {
        let reply = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(ChatError::transport("not connected"));
            }
            state.requests.push(request.clone());
            let kind = RequestKind::of(&request);
            let scripted = state.scripted.get_mut(&kind).and_then(VecDeque::pop_front);
            match scripted {
                Some(reply) => reply,
                None => Scripted::Ack(Self::default_ack(&mut state, &request)),
            }
        };
        debug!(kind = ?RequestKind::of(&request), conversation_id = %request.conversation_id(), "memory transport request");

        match reply {
            Scripted::Ack(ack) => {
                if self.echo_sends {
                    if let ServerAck::Sent { id, created_at } = &ack {
                        if let Some(event) = self.echo_for(&request, id, *created_at) {
                            self.push(event);
                        }
                    }
                }
                Ok(ack)
            }
            Scripted::Fail(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> MemoryTransport {
        MemoryTransport::new(ParticipantRef::new("u-me", "Me"), 16)
    }

    fn send() -> ClientRequest {
        ClientRequest::SendMessage {
            conversation_id: ConversationId::from("c1"),
            content: "hi".into(),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn emit_requires_connection() {
        let transport = transport();
        let err = transport.emit(send()).await.expect_err("not connected");
        assert!(err.is_retryable());
        assert!(transport.requests().await.is_empty());
    }

    #[tokio::test]
    async fn scripted_replies_are_consumed_in_order() {
        let transport = transport();
        transport.connect().await.expect("connect");
        transport
            .script(
                RequestKind::SendMessage,
                Scripted::Fail(ChatError::transport("reset")),
            )
            .await;

        assert!(transport.emit(send()).await.is_err());
        let ack = transport.emit(send()).await.expect("default ack");
        assert!(matches!(ack, ServerAck::Sent { ref id, .. } if id.as_str() == "srv-1"));
        assert_eq!(transport.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn echo_delivers_message_created() {
        let transport = transport().with_echo(true);
        let mut events = transport.subscribe();
        transport.connect().await.expect("connect");

        transport.emit(send()).await.expect("ack");

        match events.recv().await.expect("echo") {
            PushEvent::MessageCreated { message } => {
                assert_eq!(message.id.as_str(), "srv-1");
                assert_eq!(message.sender.user_id.as_str(), "u-me");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
