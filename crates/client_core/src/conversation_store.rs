use shared::domain::{Conversation, ConversationId};

/// Conversation summaries, always sorted by `modified_at` descending.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    entries: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.entries.iter().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    /// Inserts or replaces by id.
    pub fn upsert(&mut self, conversation: Conversation) {
        match self.entries.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.entries.push(conversation),
        }
        self.resort();
    }

    /// Replaces the whole collection with a fetch result (any order).
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.entries.clear();
        for conversation in conversations {
            match self.entries.iter_mut().find(|c| c.id == conversation.id) {
                Some(existing) => *existing = conversation,
                None => self.entries.push(conversation),
            }
        }
        self.resort();
    }

    /// Runs `f` on the entry and restores the ordering afterwards.
    ///
    /// Returns `None` when the conversation is unknown, otherwise whether the
    /// entry changed.
    pub fn update<F>(&mut self, id: &ConversationId, f: F) -> Option<bool>
    where
        F: FnOnce(&mut Conversation),
    {
        let entry = self.entries.iter_mut().find(|c| &c.id == id)?;
        let before = entry.clone();
        f(entry);
        let changed = *entry != before;
        if entry.modified_at != before.modified_at {
            self.resort();
        }
        Some(changed)
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        let idx = self.entries.iter().position(|c| &c.id == id)?;
        Some(self.entries.remove(idx))
    }

    fn resort(&mut self) {
        self.entries
            .sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use shared::domain::ConversationKind;

    use super::*;

    fn conv(id: &str, modified: i64) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            kind: ConversationKind::Direct,
            participants: Vec::new(),
            display_name: id.to_uppercase(),
            avatar_ref: None,
            last_message: None,
            modified_at: DateTime::from_timestamp(modified, 0).expect("timestamp"),
            unread_count: 0,
            created_by: None,
        }
    }

    fn order(store: &ConversationStore) -> Vec<&str> {
        store
            .conversations()
            .iter()
            .map(|c| c.id.as_str())
            .collect()
    }

    #[test]
    fn fetch_result_is_sorted_most_recent_first() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conv("a", 10), conv("b", 30), conv("c", 20)]);
        assert_eq!(order(&store), vec!["b", "c", "a"]);
    }

    #[test]
    fn update_resorts_when_modified_at_changes() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conv("a", 10), conv("b", 30)]);

        let changed = store.update(&"a".into(), |c| {
            c.modified_at = DateTime::from_timestamp(40, 0).expect("timestamp");
        });
        assert_eq!(changed, Some(true));
        assert_eq!(order(&store), vec!["a", "b"]);
        assert_eq!(store.update(&"zzz".into(), |_| {}), None);
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut store = ConversationStore::new();
        store.upsert(conv("a", 10));
        let mut renamed = conv("a", 10);
        renamed.display_name = "Renamed".into();
        store.upsert(renamed);

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&"a".into()).map(|c| c.display_name.as_str()),
            Some("Renamed")
        );
    }
}
