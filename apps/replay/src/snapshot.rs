use std::fmt;

use client_core::{ChatSession, MessageState};
use serde::Serialize;
use shared::domain::{ConversationId, MessageId};

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub selected: Option<ConversationId>,
    pub conversations: Vec<ConversationView>,
}

#[derive(Debug, Serialize)]
pub struct ConversationView {
    pub id: ConversationId,
    pub display_name: String,
    pub unread_count: u32,
    pub preview: Option<String>,
    pub pinned: Vec<MessageId>,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: MessageId,
    pub sender: String,
    pub text: String,
    pub state: MessageState,
    pub pinned: bool,
    pub reactions: Vec<(String, u32)>,
}

impl Snapshot {
    pub async fn capture(session: &ChatSession) -> Self {
        let mut conversations = Vec::new();
        for conversation in session.conversations().await {
            let id = conversation.id.clone();
            let mut messages = Vec::new();
            for message in session.messages(&id).await {
                let text = session
                    .display_text(&id, &message.id)
                    .await
                    .unwrap_or_else(|| message.content.clone());
                messages.push(MessageView {
                    state: MessageState::of(&message),
                    sender: message.sender.display_name.clone(),
                    pinned: message.pinned,
                    reactions: message
                        .reactions
                        .iter()
                        .map(|(icon, summary)| (icon.clone(), summary.count))
                        .collect(),
                    id: message.id,
                    text,
                });
            }
            conversations.push(ConversationView {
                preview: session.preview(&id).await,
                pinned: session.pinned(&id).await.into_iter().map(|m| m.id).collect(),
                display_name: conversation.display_name,
                unread_count: conversation.unread_count,
                id,
                messages,
            });
        }
        Self {
            selected: session.selected().await,
            conversations,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for conversation in &self.conversations {
            let marker = if self.selected.as_ref() == Some(&conversation.id) {
                "*"
            } else {
                " "
            };
            writeln!(
                f,
                "{marker} {} [{}] unread={} | {}",
                conversation.display_name,
                conversation.id,
                conversation.unread_count,
                conversation.preview.as_deref().unwrap_or("")
            )?;
            for message in &conversation.messages {
                let pin = if message.pinned { " (pinned)" } else { "" };
                write!(
                    f,
                    "    {} {}: {} [{:?}]{pin}",
                    message.id, message.sender, message.text, message.state
                )?;
                for (icon, count) in &message.reactions {
                    write!(f, " {icon}x{count}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_selected_marker_and_reactions() {
        let snapshot = Snapshot {
            selected: Some("c1".into()),
            conversations: vec![ConversationView {
                id: "c1".into(),
                display_name: "Team".into(),
                unread_count: 0,
                preview: Some("hi".into()),
                pinned: vec!["m1".into()],
                messages: vec![MessageView {
                    id: "m1".into(),
                    sender: "Ann".into(),
                    text: "hi".into(),
                    state: MessageState::Confirmed,
                    pinned: true,
                    reactions: vec![("👍".into(), 2)],
                }],
            }],
        };

        let rendered = snapshot.to_string();
        assert!(rendered.starts_with("* Team [c1] unread=0 | hi\n"));
        assert!(rendered.contains("m1 Ann: hi [Confirmed] (pinned) 👍x2"));
    }
}
