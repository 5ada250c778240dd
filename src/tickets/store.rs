use crate::core::shared::models::{Area, Environment, User};
use crate::notifications::{NewNotification, Notification};

use chrono::Utc;
use log::error;
use std::sync::Arc;

use super::{
    Interaction, NewInteraction, NewTicket, StatusTransition, Ticket, TicketUpdate, UpdateOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("{0} not found")]
    NotFound(String),
    /// A linked ticket was asked to take a different external id.
    #[error("ticket {ticket_id} is already linked to {current}, refusing {requested}")]
    ExternalIdConflict {
        ticket_id: i64,
        current: String,
        requested: String,
    },
    #[error("stored data is invalid: {0}")]
    Corrupt(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => Self::NotFound("record".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        Self::Connection(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait TicketStore: Send + Sync {
    fn create_ticket(&self, ticket: NewTicket) -> StoreResult<Ticket>;

    fn ticket(&self, id: i64) -> StoreResult<Option<Ticket>>;

    /// Tickets whose status is outside the terminal set.
    fn open_tickets(&self) -> StoreResult<Vec<Ticket>>;

    /// Tickets carrying an external id, regardless of status.
    fn linked_tickets(&self) -> StoreResult<Vec<Ticket>>;

    /// Applies `update` against the last persisted row inside one
    /// transaction. Fields equal to the stored value are not written; when
    /// nothing differs the row is left untouched and `updated_at` keeps its
    /// value. A status difference is reported as a transition.
    fn apply_update(&self, ticket_id: i64, update: &TicketUpdate) -> StoreResult<UpdateOutcome>;

    fn environment(&self, id: i64) -> StoreResult<Option<Environment>>;

    fn environment_by_name(&self, owner_id: i64, name: &str) -> StoreResult<Option<Environment>>;

    fn area(&self, id: i64) -> StoreResult<Option<Area>>;

    fn area_by_name(&self, owner_id: i64, name: &str) -> StoreResult<Option<Area>>;
}

pub trait InteractionStore: Send + Sync {
    fn add_interaction(&self, interaction: NewInteraction) -> StoreResult<Interaction>;

    /// Interactions of one ticket, oldest first.
    fn interactions(&self, ticket_id: i64) -> StoreResult<Vec<Interaction>>;

    fn interaction_exists(&self, ticket_id: i64, body: &str) -> StoreResult<bool>;
}

pub trait NotificationStore: Send + Sync {
    /// Inserts all rows in one statement and returns how many were written.
    fn insert_notifications(&self, notifications: &[NewNotification]) -> StoreResult<usize>;

    /// Unread notifications of `recipient_id`, newest first.
    fn unread_notifications(&self, recipient_id: i64, limit: usize)
        -> StoreResult<Vec<Notification>>;

    /// Marks one notification read. Returns false when it does not exist or
    /// belongs to someone else.
    fn mark_read(&self, notification_id: i64, recipient_id: i64) -> StoreResult<bool>;
}

pub trait Directory: Send + Sync {
    fn user(&self, id: i64) -> StoreResult<Option<User>>;

    /// Staff accounts plus members of `consultant_group`, each listed once.
    fn support_team(&self, consultant_group: &str) -> StoreResult<Vec<User>>;

    /// Fetches the account used to author imported records, creating an
    /// inactive staff account on first use.
    fn system_user(&self, email: &str) -> StoreResult<User>;
}

/// Advisory locks keyed by job name, held for the length of one run.
pub trait JobLocks: Send + Sync {
    fn try_lock_job(&self, job_name: &str) -> StoreResult<bool>;

    fn unlock_job(&self, job_name: &str) -> StoreResult<()>;
}

pub trait PortalStore:
    TicketStore + InteractionStore + NotificationStore + Directory + JobLocks
{
}

impl<T> PortalStore for T where
    T: TicketStore + InteractionStore + NotificationStore + Directory + JobLocks
{
}

/// A taken job lock, released on drop. Runs aborted mid-flight release too.
pub struct JobLockGuard {
    store: Arc<dyn PortalStore>,
    job_name: &'static str,
}

impl JobLockGuard {
    /// `Ok(None)` when another run holds the lock.
    pub fn acquire(store: Arc<dyn PortalStore>, job_name: &'static str) -> StoreResult<Option<Self>> {
        if store.try_lock_job(job_name)? {
            Ok(Some(Self { store, job_name }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock_job(self.job_name) {
            error!("failed to release job lock {}: {e}", self.job_name);
        }
    }
}

/// Compares `update` with the persisted ticket and returns the row to store
/// plus what changed. Shared by both store implementations.
pub(crate) fn compute_update(
    current: Ticket,
    update: &TicketUpdate,
) -> StoreResult<(Ticket, UpdateOutcome)> {
    let mut next = current.clone();
    let mut linked = false;
    let mut transition = None;

    if let Some(requested) = update.external_id.as_deref().filter(|id| !id.is_empty()) {
        match current.external_id.as_deref() {
            Some(existing) if existing == requested => {}
            Some(existing) => {
                return Err(StoreError::ExternalIdConflict {
                    ticket_id: current.id,
                    current: existing.to_string(),
                    requested: requested.to_string(),
                });
            }
            None => {
                next.external_id = Some(requested.to_string());
                linked = true;
            }
        }
    }

    if let Some(status) = update.status {
        if status != current.status {
            next.status = status;
            transition = Some(StatusTransition {
                from: current.status,
                to: status,
            });
        }
    }

    if linked || transition.is_some() {
        next.updated_at = Utc::now();
    }

    let outcome = UpdateOutcome {
        ticket: next.clone(),
        linked,
        transition,
    };
    Ok((next, outcome))
}
