use shared::domain::ConversationId;

/// The conversation currently open in the presentation layer, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionContext {
    active: Option<ConversationId>,
}

impl SelectionContext {
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn is_selected(&self, id: &ConversationId) -> bool {
        self.active.as_ref() == Some(id)
    }

    pub fn select(&mut self, id: ConversationId) {
        self.active = Some(id);
    }

    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Clears the selection if `id` is the active conversation.
    pub fn clear_if(&mut self, id: &ConversationId) -> bool {
        if self.is_selected(id) {
            self.active = None;
            return true;
        }
        false
    }
}
