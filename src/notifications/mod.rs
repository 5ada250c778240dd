pub mod dispatcher;
pub mod templates;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::shared::models::NotificationRow;
use crate::tickets::StoreError;

pub use dispatcher::{DispatchSummary, NotificationDispatcher, NotificationSettings};

/// Type tag stored with each notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "mensagem")]
    Message,
}

impl NotificationKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Message => "mensagem",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "mensagem" => Ok(Self::Message),
            other => Err(StoreError::Corrupt(format!(
                "unknown notification kind {other:?}"
            ))),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub recipient_id: i64,
    pub ticket_id: Option<i64>,
    pub kind: NotificationKind,
    pub title: String,
    pub preview: String,
    pub link: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            recipient_id: row.recipient_id,
            ticket_id: row.ticket_id,
            kind: row.kind.parse()?,
            title: row.title,
            preview: row.preview,
            link: row.link,
            is_read: row.is_read,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub recipient_id: i64,
    pub ticket_id: Option<i64>,
    pub kind: NotificationKind,
    pub title: String,
    pub preview: String,
    pub link: String,
}

/// Unread notifications shown in the portal header.
#[derive(Debug, Clone, Serialize)]
pub struct Inbox {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in [NotificationKind::Status, NotificationKind::Message] {
            assert_eq!(kind.tag().parse::<NotificationKind>().unwrap(), kind);
        }
        assert!("chat".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_as_tag() {
        assert_eq!(
            serde_json::to_string(&NotificationKind::Message).unwrap(),
            "\"mensagem\""
        );
    }
}
