use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::prospect::ConversationId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFragment {
    pub conversation_id: ConversationId,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl MessageFragment {
    pub fn new(
        conversation_id: ConversationId,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self { conversation_id, text: text.into(), received_at }
    }
}

/// Fragments from one debounce cycle, in arrival order. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    conversation_id: ConversationId,
    fragments: Vec<MessageFragment>,
}

impl MessageBatch {
    /// Returns `None` for an empty fragment list; a batch always carries text.
    pub fn from_fragments(
        conversation_id: ConversationId,
        fragments: Vec<MessageFragment>,
    ) -> Option<Self> {
        if fragments.is_empty() {
            return None;
        }
        Some(Self { conversation_id, fragments })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn fragments(&self) -> &[MessageFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn text(&self) -> String {
        self.fragments.iter().map(|fragment| fragment.text.as_str()).collect::<Vec<_>>().join("\n")
    }

    pub fn first_received_at(&self) -> DateTime<Utc> {
        self.fragments[0].received_at
    }

    pub fn last_received_at(&self) -> DateTime<Utc> {
        self.fragments[self.fragments.len() - 1].received_at
    }
}
