pub mod api;
pub mod intake;
pub mod matching;
pub mod memory_store;
pub mod pg_store;
pub mod reconcile;
pub mod remote;
pub mod service;
pub mod status;
pub mod store;
pub mod worklog_import;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::shared::models::{InteractionRow, TicketRow};

pub use status::{TicketStatus, UnrecognizedStatus};
pub use store::{
    Directory, InteractionStore, JobLockGuard, JobLocks, NotificationStore, PortalStore,
    StoreError, TicketStore,
};

/// Ticket priority, 1 being the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("priority must be between 1 and 5, got {0}")]
pub struct InvalidPriority(pub i64);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(5);

    pub fn new(value: i64) -> Result<Self, InvalidPriority> {
        if (1..=5).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(InvalidPriority(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(i64::from(value))
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub owner_id: i64,
    pub external_id: Option<String>,
    pub summary: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: Option<Priority>,
    pub environment_id: Option<i64>,
    pub area_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn is_linked(&self) -> bool {
        self.external_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Reference shown to people: the remote id once linked, the local id before.
    pub fn reference(&self) -> String {
        match self.external_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.id.to_string(),
        }
    }
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TicketStatus>()
            .map_err(|e| StoreError::Corrupt(format!("ticket {}: {e}", row.id)))?;
        let priority = row
            .priority
            .map(|p| Priority::new(i64::from(p)))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("ticket {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            owner_id: row.owner_id,
            external_id: row.external_id.filter(|id| !id.is_empty()),
            summary: row.summary,
            description: row.description,
            status,
            priority,
            environment_id: row.environment_id,
            area_id: row.area_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub owner_id: i64,
    pub summary: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub environment_id: Option<i64>,
    pub area_id: Option<i64>,
}

/// Field changes requested for one ticket. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketUpdate {
    pub external_id: Option<String>,
    pub status: Option<TicketStatus>,
}

impl TicketUpdate {
    pub fn is_empty(&self) -> bool {
        self.external_id.is_none() && self.status.is_none()
    }
}

/// Status change detected while committing an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub from: TicketStatus,
    pub to: TicketStatus,
}

/// Result of applying a [`TicketUpdate`] against the last persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub ticket: Ticket,
    /// The external id was absent before and is set now.
    pub linked: bool,
    pub transition: Option<StatusTransition>,
}

impl UpdateOutcome {
    pub fn changed(&self) -> bool {
        self.linked || self.transition.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: i64,
    pub ticket_id: i64,
    pub author_id: i64,
    pub body: String,
    pub attachment_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<InteractionRow> for Interaction {
    fn from(row: InteractionRow) -> Self {
        Self {
            id: row.id,
            ticket_id: row.ticket_id,
            author_id: row.author_id,
            body: row.body,
            attachment_name: row.attachment_name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewInteraction {
    pub ticket_id: i64,
    pub author_id: i64,
    pub body: String,
    pub attachment_name: Option<String>,
    /// Back-dates the interaction; `None` stamps it with the current time.
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, external_id: Option<&str>) -> TicketRow {
        TicketRow {
            id: 7,
            owner_id: 1,
            external_id: external_id.map(str::to_string),
            summary: "printer jam".to_string(),
            description: String::new(),
            status: status.to_string(),
            priority: Some(2),
            environment_id: None,
            area_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(6).is_err());
        assert_eq!(Priority::new(1), Ok(Priority::HIGHEST));
        assert_eq!(Priority::new(5), Ok(Priority::LOWEST));
    }

    #[test]
    fn test_row_conversion() {
        let ticket = Ticket::try_from(row("INPROG", Some("100"))).unwrap();
        assert_eq!(ticket.status, TicketStatus::InProgress);
        assert_eq!(ticket.priority, Some(Priority(2)));
        assert!(ticket.is_linked());
        assert_eq!(ticket.reference(), "100");
    }

    #[test]
    fn test_empty_external_id_reads_as_unlinked() {
        let ticket = Ticket::try_from(row("NEW", Some(""))).unwrap();
        assert!(!ticket.is_linked());
        assert_eq!(ticket.reference(), "7");
    }

    #[test]
    fn test_corrupt_status_is_reported() {
        let err = Ticket::try_from(row("??", None)).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
