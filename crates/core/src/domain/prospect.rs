use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Identifies one conversation thread; a prospect owns exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectStatus {
    New,
    Contacted,
    InConversation,
    MeetingScheduled,
    Converted,
    Archived,
}

impl ProspectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::InConversation => "in_conversation",
            Self::MeetingScheduled => "meeting_scheduled",
            Self::Converted => "converted",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "contacted" => Some(Self::Contacted),
            "in_conversation" => Some(Self::InConversation),
            "meeting_scheduled" => Some(Self::MeetingScheduled),
            "converted" => Some(Self::Converted),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Contacted => 1,
            Self::InConversation => 2,
            Self::MeetingScheduled => 3,
            Self::Converted => 4,
            Self::Archived => 5,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Converted | Self::Archived)
    }

    /// Whether unanswered outbound messages should be chased with a follow-up.
    pub fn accepts_follow_ups(&self) -> bool {
        matches!(self, Self::Contacted | Self::InConversation)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: ConversationId,
    pub display_name: String,
    pub recipient: String,
    pub status: ProspectStatus,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub meeting_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prospect {
    pub fn new(
        id: ConversationId,
        display_name: impl Into<String>,
        recipient: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            recipient: recipient.into(),
            status: ProspectStatus::New,
            last_inbound_at: None,
            last_outbound_at: None,
            meeting_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the prospect forward. Archival is allowed from any state;
    /// everything else only advances, and closed prospects stay closed.
    pub fn can_transition_to(&self, next: ProspectStatus) -> bool {
        if next == ProspectStatus::Archived {
            return self.status != ProspectStatus::Archived;
        }
        !self.status.is_closed() && next.rank() > self.status.rank()
    }

    pub fn transition_to(
        &mut self,
        next: ProspectStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidProspectTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Advances when the move is forward and silently keeps the current status
    /// otherwise. Returns whether the status changed.
    pub fn advance_to(&mut self, next: ProspectStatus, now: DateTime<Utc>) -> bool {
        self.transition_to(next, now).is_ok()
    }

    pub fn record_inbound(&mut self, at: DateTime<Utc>) -> bool {
        self.last_inbound_at = Some(at);
        self.updated_at = at;
        self.advance_to(ProspectStatus::InConversation, at)
    }

    pub fn record_outbound(&mut self, at: DateTime<Utc>) -> bool {
        self.last_outbound_at = Some(at);
        self.updated_at = at;
        self.advance_to(ProspectStatus::Contacted, at)
    }
}
