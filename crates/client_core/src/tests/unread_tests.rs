use chrono::{DateTime, Utc};
use shared::domain::{ConversationKind, MessageId, Notice, ParticipantRef};

use super::*;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("timestamp")
}

fn viewer() -> UserId {
    UserId::from("u-me")
}

fn conversation(unread: u32) -> Conversation {
    Conversation {
        id: ConversationId::from("g1"),
        kind: ConversationKind::Group,
        participants: vec![
            ParticipantRef::new("u-me", "Me"),
            ParticipantRef::new("u-ann", "Ann"),
        ],
        display_name: "Team".into(),
        avatar_ref: None,
        last_message: None,
        modified_at: at(0),
        unread_count: unread,
        created_by: None,
    }
}

fn text_from(sender: &str) -> Message {
    Message::text(
        MessageId::from("m1"),
        ConversationId::from("g1"),
        ParticipantRef::new(sender, sender),
        at(10),
        "hi",
    )
}

fn notice(kind: MessageKind, actor: &str, targets: &[&str]) -> Message {
    Message::system(
        MessageId::from("n1"),
        ConversationId::from("g1"),
        kind,
        Notice {
            actor: ParticipantRef::new(actor, actor),
            targets: targets
                .iter()
                .map(|t| ParticipantRef::new(*t, *t))
                .collect(),
            group_name: Some("Team".into()),
        },
        at(10),
    )
}

#[test]
fn selected_conversation_never_counts() {
    let counter = UnreadCounter::new();
    let update = counter.decide(&conversation(0), &text_from("u-ann"), &viewer(), true);
    assert_eq!(update, UnreadUpdate::Keep);
}

#[test]
fn own_messages_never_count() {
    let counter = UnreadCounter::new();
    let update = counter.decide(&conversation(3), &text_from("u-me"), &viewer(), false);
    assert_eq!(update, UnreadUpdate::Keep);
}

#[test]
fn regular_message_increments() {
    let mut counter = UnreadCounter::new();
    let mut conv = conversation(0);
    assert!(counter.on_message(&mut conv, &text_from("u-ann"), &viewer(), false));
    assert_eq!(conv.unread_count, 1);
}

#[test]
fn removal_of_viewer_does_not_count() {
    let counter = UnreadCounter::new();
    let message = notice(MessageKind::SystemRemoveMembers, "u-ann", &["u-me"]);
    assert_eq!(
        counter.decide(&conversation(2), &message, &viewer(), false),
        UnreadUpdate::Keep
    );
}

#[test]
fn removal_of_someone_else_increments() {
    let counter = UnreadCounter::new();
    let message = notice(MessageKind::SystemRemoveMembers, "u-ann", &["u-bob"]);
    assert_eq!(
        counter.decide(&conversation(2), &message, &viewer(), false),
        UnreadUpdate::Increment
    );
}

#[test]
fn first_add_members_with_low_count_sets_exactly_one() {
    let mut counter = UnreadCounter::new();
    let mut conv = conversation(1);
    let message = notice(MessageKind::SystemAddMembers, "u-ann", &["u-me"]);

    counter.on_message(&mut conv, &message, &viewer(), false);
    assert_eq!(conv.unread_count, 1);

    let mut second = notice(MessageKind::SystemAddMembers, "u-ann", &["u-bob"]);
    second.id = MessageId::from("n2");
    counter.on_message(&mut conv, &second, &viewer(), false);
    assert_eq!(conv.unread_count, 2);
}

#[test]
fn first_add_members_with_high_count_increments() {
    let counter = UnreadCounter::new();
    let message = notice(MessageKind::SystemAddMembers, "u-ann", &["u-bob"]);
    assert_eq!(
        counter.decide(&conversation(4), &message, &viewer(), false),
        UnreadUpdate::Increment
    );
}

#[test]
fn creation_count_for_creator_and_invitees() {
    let ann = UserId::from("u-ann");
    assert_eq!(UnreadCounter::initial_count(&viewer(), &viewer(), None), 0);
    assert_eq!(UnreadCounter::initial_count(&ann, &viewer(), None), 1);
    assert_eq!(UnreadCounter::initial_count(&ann, &viewer(), Some(5)), 5);
    assert_eq!(UnreadCounter::initial_count(&viewer(), &viewer(), Some(2)), 2);
}

#[test]
fn reset_reports_change() {
    let mut conv = conversation(3);
    assert!(UnreadCounter::reset(&mut conv));
    assert!(!UnreadCounter::reset(&mut conv));
    assert_eq!(conv.unread_count, 0);
}
