use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity triple supplied by the ingestion transport for each sender.
///
/// `source_id` is the stable identifier; number and display name are
/// whatever the transport happened to know at the time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceContact {
    pub source_id: String,
    pub number: Option<String>,
    pub display_name: Option<String>,
}

/// Group context attached to a message, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: Option<String>,
}

/// A quoted earlier message, referenced by author and original timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub author: String,
    pub text: Option<String>,
    pub quoted_timestamp: i64,
}

/// An emoji reaction targeting an earlier message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub target_author: String,
    pub target_timestamp: i64,
}

/// One record produced by the message-ingestion transport.
///
/// The store treats this as opaque input and inspects only the fields it
/// needs for classification and foreign-key resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub sender: SourceContact,
    pub group: Option<GroupInfo>,
    pub timestamp: DateTime<Utc>,
    pub body: Option<String>,
    pub quote: Option<Quote>,
    pub reaction: Option<Reaction>,
    /// Delivery/read receipts carry no content and are not persisted.
    #[serde(default)]
    pub is_receipt: bool,
}

impl IncomingMessage {
    /// Plain text message in a group, the common case.
    pub fn text(
        sender: SourceContact,
        group: GroupInfo,
        timestamp: DateTime<Utc>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            group: Some(group),
            timestamp,
            body: Some(body.into()),
            quote: None,
            reaction: None,
            is_receipt: false,
        }
    }
}
