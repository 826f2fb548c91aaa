//! Read-time rendering of system notices and conversation previews.
//!
//! Everything here is a pure function of the message, the viewer and the
//! conversation as it is *now*. Results are never stored, because the
//! participant directory keeps changing after a notice was created.

use shared::domain::{Conversation, Message, MessageKind, ParticipantRef, UserId};

pub const DEFAULT_RECALL_PLACEHOLDER: &str = "Message has been recalled";
const MEDIA_PREVIEW: &str = "[media]";

/// Personalized sentence for a notice message, or `None` for non-notices.
pub fn render_notice(message: &Message, viewer: &UserId, conversation: &Conversation) -> Option<String> {
    let notice = message.notice.as_ref()?;
    let group = notice
        .group_name
        .clone()
        .unwrap_or_else(|| conversation.display_name.clone());
    let actor_is_viewer = &notice.actor.user_id == viewer;
    let actor = display_name(&notice.actor, conversation);
    let targets = notice
        .targets
        .iter()
        .map(|t| display_name(t, conversation))
        .collect::<Vec<_>>()
        .join(", ");
    let viewer_targeted = notice.targets.iter().any(|t| &t.user_id == viewer);

    let sentence = match message.kind {
        MessageKind::SystemAddMembers if actor_is_viewer => format!("You added {targets} to {group}"),
        MessageKind::SystemAddMembers if viewer_targeted => {
            format!("You were added to {group} by {actor}")
        }
        MessageKind::SystemAddMembers => format!("{actor} added {targets} to {group}"),
        MessageKind::SystemRemoveMembers if actor_is_viewer => {
            format!("You removed {targets} from {group}")
        }
        MessageKind::SystemRemoveMembers if viewer_targeted => {
            format!("You were removed from {group} by {actor}")
        }
        MessageKind::SystemRemoveMembers => format!("{actor} removed {targets} from {group}"),
        MessageKind::SystemLeaveGroup if actor_is_viewer => format!("You left {group}"),
        MessageKind::SystemLeaveGroup => format!("{actor} left {group}"),
        MessageKind::SystemEditGroupName if actor_is_viewer => {
            format!("You renamed the group to {group}")
        }
        MessageKind::SystemEditGroupName => format!("{actor} renamed the group to {group}"),
        _ => return None,
    };
    Some(sentence)
}

/// One-line summary used by conversation lists.
pub fn preview_text(
    message: &Message,
    viewer: &UserId,
    conversation: &Conversation,
    recall_placeholder: &str,
) -> String {
    if message.recalled {
        return recall_placeholder.to_string();
    }
    if let Some(sentence) = render_notice(message, viewer, conversation) {
        return sentence;
    }
    if message.kind == MessageKind::Media && message.content.trim().is_empty() {
        return MEDIA_PREVIEW.to_string();
    }
    message.content.clone()
}

fn display_name(participant: &ParticipantRef, conversation: &Conversation) -> String {
    conversation
        .participant(&participant.user_id)
        .map(|p| p.display_name.clone())
        .unwrap_or_else(|| participant.display_name.clone())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use shared::domain::{ConversationId, ConversationKind, MessageId, Notice};

    use super::*;

    fn team() -> Conversation {
        Conversation {
            id: ConversationId::from("g1"),
            kind: ConversationKind::Group,
            participants: vec![
                ParticipantRef::new("u-ann", "Ann"),
                ParticipantRef::new("u-me", "Me"),
            ],
            display_name: "Team".into(),
            avatar_ref: None,
            last_message: None,
            modified_at: DateTime::from_timestamp(0, 0).expect("timestamp"),
            unread_count: 0,
            created_by: None,
        }
    }

    fn add_members(actor: &str, targets: &[(&str, &str)]) -> Message {
        Message::system(
            MessageId::from("n1"),
            ConversationId::from("g1"),
            MessageKind::SystemAddMembers,
            Notice {
                actor: ParticipantRef::new(actor, "stale actor name"),
                targets: targets
                    .iter()
                    .map(|(id, name)| ParticipantRef::new(*id, *name))
                    .collect(),
                group_name: Some("Team".into()),
            },
            DateTime::from_timestamp(5, 0).expect("timestamp"),
        )
    }

    #[test]
    fn renders_from_each_perspective() {
        let conv = team();
        let message = add_members("u-ann", &[("u-me", "Me"), ("u-bob", "Bob")]);

        assert_eq!(
            render_notice(&message, &"u-me".into(), &conv).as_deref(),
            Some("You were added to Team by Ann")
        );
        assert_eq!(
            render_notice(&message, &"u-ann".into(), &conv).as_deref(),
            Some("You added Me, Bob to Team")
        );
        assert_eq!(
            render_notice(&message, &"u-carl".into(), &conv).as_deref(),
            Some("Ann added Me, Bob to Team")
        );
    }

    #[test]
    fn uses_current_directory_names() {
        let mut conv = team();
        let message = add_members("u-ann", &[("u-bob", "Bob")]);
        conv.participants[0].display_name = "Annie".into();

        assert_eq!(
            render_notice(&message, &"u-me".into(), &conv).as_deref(),
            Some("Annie added Bob to Team")
        );
    }

    #[test]
    fn preview_prefers_recall_placeholder() {
        let conv = team();
        let mut message = Message::text(
            MessageId::from("m1"),
            ConversationId::from("g1"),
            ParticipantRef::new("u-ann", "Ann"),
            DateTime::from_timestamp(5, 0).expect("timestamp"),
            "secret",
        );
        assert_eq!(
            preview_text(&message, &"u-me".into(), &conv, DEFAULT_RECALL_PLACEHOLDER),
            "secret"
        );

        message.recalled = true;
        assert_eq!(
            preview_text(&message, &"u-me".into(), &conv, DEFAULT_RECALL_PLACEHOLDER),
            DEFAULT_RECALL_PLACEHOLDER
        );

        message.recalled = false;
        message.kind = MessageKind::Media;
        message.content.clear();
        assert_eq!(
            preview_text(&message, &"u-me".into(), &conv, DEFAULT_RECALL_PLACEHOLDER),
            "[media]"
        );
    }
}
