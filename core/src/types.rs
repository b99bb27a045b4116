//! Shared types for the conversation model
use crate::error::FetchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a message record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Created locally before the service acknowledged it
    LocalOptimistic,
    /// Our own message, acknowledged by the service
    Confirmed,
    /// Written by the peer (or loaded from history)
    Remote,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Service-assigned id; absent for optimistic entries
    pub id: Option<i64>,
    /// Handle of the optimistic entry this record started as
    pub local_id: Option<Uuid>,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    /// Optimistic send that did not reach the service
    pub failed: bool,
}

impl Message {
    /// Provisional entry for a send that has not been confirmed yet
    pub fn optimistic(
        local_id: Uuid,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            local_id: Some(local_id),
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
            timestamp,
            origin: Origin::LocalOptimistic,
            failed: false,
        }
    }

    /// The other participant, seen from `identity`
    pub fn peer_of<'a>(&'a self, identity: &str) -> &'a str {
        if self.sender == identity {
            &self.receiver
        } else {
            &self.sender
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == Origin::LocalOptimistic && !self.failed
    }
}

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The other participant
    pub peer: String,
    /// Preview text of the last message
    pub last_message_preview: String,
    /// Timestamp of the last message
    pub last_timestamp: DateTime<Utc>,
    /// Messages from the peer arrived while the conversation was not selected
    pub unread: bool,
}

/// Currently selected peer plus the history-fetch generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub selected_peer: Option<String>,
    pub fetch_generation: u64,
}

/// Push channel state, owned by the transport adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// First dial in progress
    Connecting,
    /// Link is live
    Open,
    /// Link is down; `Reconnecting` follows unless the adapter was closed
    Closed,
    /// Link dropped; a redial is scheduled or in progress
    Reconnecting,
}

/// Slice of session state touched by a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Messages { peer: String },
    Summaries,
    Presence,
    Selection,
    Connection(ConnectionState),
    /// A history fetch failed and was not applied
    FetchFailed { peer: String, error: FetchError },
}
