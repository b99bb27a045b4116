//! Wire shapes of the push channel and the history service
use crate::types::{ConversationSummary, Message, Origin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames the server pushes to us
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    /// Full snapshot of the online users
    #[serde(rename = "users_list")]
    UsersList { users: Vec<String> },

    /// A message was written to (or by) us
    #[serde(rename = "new_message", alias = "message")]
    NewMessage(WireMessage),
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames we push to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Keepalive
    Ping,
    /// Message send over the push channel
    Send { content: String, receiver: String },
}

impl OutboundFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboundFrame::Ping => serde_json::to_string(&serde_json::json!({ "type": "ping" })),
            OutboundFrame::Send { content, receiver } => serde_json::to_string(
                &serde_json::json!({ "content": content, "receiver": receiver }),
            ),
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Ping => "ping",
            OutboundFrame::Send { .. } => "send",
        }
    }
}

/// Message as the service encodes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(alias = "sender_name")]
    pub sender: String,
    #[serde(alias = "receiver_name")]
    pub receiver: String,
    pub content: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    /// Decode into the local model, seen from `identity`
    pub fn into_message(self, identity: &str) -> Message {
        let origin = if self.sender == identity {
            Origin::Confirmed
        } else {
            Origin::Remote
        };
        Message {
            id: self.id,
            local_id: None,
            sender: self.sender,
            receiver: self.receiver,
            content: self.content,
            timestamp: self.timestamp,
            origin,
            failed: false,
        }
    }
}

/// `GET /messages/{username}?with_user={peer}`
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<WireMessage>,
}

/// `GET /users/online`
#[derive(Debug, Clone, Deserialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<String>,
}

/// One entry of `GET /chats/{username}`
#[derive(Debug, Clone, Deserialize)]
pub struct WireSummary {
    pub user: String,
    pub last_message: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub unread: bool,
}

impl From<WireSummary> for ConversationSummary {
    fn from(s: WireSummary) -> Self {
        Self {
            peer: s.user,
            last_message_preview: s.last_message,
            last_timestamp: s.timestamp,
            unread: s.unread,
        }
    }
}

/// Body of `POST /messages/`
#[derive(Debug, Clone, Serialize)]
pub struct PostMessageBody<'a> {
    pub content: &'a str,
    pub receiver_name: &'a str,
}

/// The service emits naive ISO-8601 timestamps in UTC; accept RFC 3339 too.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp: {}", raw)))
    }
}
