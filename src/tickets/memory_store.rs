use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::core::shared::models::{Area, Environment, User};
use crate::notifications::{NewNotification, Notification};

use super::store::{
    compute_update, Directory, InteractionStore, JobLocks, NotificationStore, StoreError,
    StoreResult, TicketStore,
};
use super::{
    Interaction, NewInteraction, NewTicket, Ticket, TicketStatus, TicketUpdate, UpdateOutcome,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    users: BTreeMap<i64, User>,
    environments: BTreeMap<i64, Environment>,
    areas: BTreeMap<i64, Area>,
    tickets: BTreeMap<i64, Ticket>,
    interactions: Vec<Interaction>,
    notifications: Vec<Notification>,
    locks: HashSet<String>,
    failing_tickets: HashSet<i64>,
    failing_notifications: bool,
    writes: usize,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Connection("memory store lock poisoned".to_string()))
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an account; `groups` are group names the user belongs to.
    pub fn add_user(&self, username: &str, email: &str, is_staff: bool, groups: &[&str]) -> User {
        let mut inner = self.guard();
        let id = inner.next_id();
        let user = User {
            id,
            username: username.to_string(),
            email: email.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            is_staff,
            is_active: true,
            location: None,
            person_id: None,
            groups: groups.iter().map(|g| g.to_string()).collect(),
        };
        inner.users.insert(id, user.clone());
        user
    }

    pub fn put_user(&self, user: User) {
        let mut inner = self.guard();
        inner.next_id = inner.next_id.max(user.id);
        inner.users.insert(user.id, user);
    }

    pub fn add_environment(&self, owner_id: i64, name: &str, asset_number: &str) -> Environment {
        let mut inner = self.guard();
        let id = inner.next_id();
        let env = Environment {
            id,
            owner_id,
            name: name.to_string(),
            asset_number: asset_number.to_string(),
        };
        inner.environments.insert(id, env.clone());
        env
    }

    pub fn add_area(&self, owner_id: i64, name: &str) -> Area {
        let mut inner = self.guard();
        let id = inner.next_id();
        let area = Area {
            id,
            owner_id,
            name: name.to_string(),
        };
        inner.areas.insert(id, area.clone());
        area
    }

    /// Seeds a ticket with an explicit link and status.
    pub fn seed_ticket(
        &self,
        owner_id: i64,
        summary: &str,
        external_id: Option<&str>,
        status: TicketStatus,
    ) -> Ticket {
        let mut inner = self.guard();
        let id = inner.next_id();
        let now = Utc::now();
        let ticket = Ticket {
            id,
            owner_id,
            external_id: external_id.map(str::to_string),
            summary: summary.to_string(),
            description: String::new(),
            status,
            priority: None,
            environment_id: None,
            area_id: None,
            created_at: now,
            updated_at: now,
        };
        inner.tickets.insert(id, ticket.clone());
        ticket
    }

    /// Makes every later update of `ticket_id` fail with a database error.
    pub fn fail_writes_for(&self, ticket_id: i64) {
        self.guard().failing_tickets.insert(ticket_id);
    }

    /// Makes `insert_notifications` fail until switched off again.
    pub fn fail_notification_writes(&self, failing: bool) {
        self.guard().failing_notifications = failing;
    }

    /// Number of ticket rows actually rewritten by `apply_update`.
    pub fn ticket_writes(&self) -> usize {
        self.guard().writes
    }

    pub fn all_notifications(&self) -> Vec<Notification> {
        self.guard().notifications.clone()
    }

    pub fn is_job_locked(&self, job_name: &str) -> bool {
        self.guard().locks.contains(job_name)
    }
}

impl TicketStore for MemoryStore {
    fn create_ticket(&self, ticket: NewTicket) -> StoreResult<Ticket> {
        let mut inner = self.lock()?;
        if !inner.users.contains_key(&ticket.owner_id) {
            return Err(StoreError::NotFound(format!("user {}", ticket.owner_id)));
        }
        let id = inner.next_id();
        let now = Utc::now();
        let ticket = Ticket {
            id,
            owner_id: ticket.owner_id,
            external_id: None,
            summary: ticket.summary,
            description: ticket.description,
            status: TicketStatus::New,
            priority: ticket.priority,
            environment_id: ticket.environment_id,
            area_id: ticket.area_id,
            created_at: now,
            updated_at: now,
        };
        inner.tickets.insert(id, ticket.clone());
        Ok(ticket)
    }

    fn ticket(&self, id: i64) -> StoreResult<Option<Ticket>> {
        Ok(self.lock()?.tickets.get(&id).cloned())
    }

    fn open_tickets(&self) -> StoreResult<Vec<Ticket>> {
        Ok(self
            .lock()?
            .tickets
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    fn linked_tickets(&self) -> StoreResult<Vec<Ticket>> {
        Ok(self
            .lock()?
            .tickets
            .values()
            .filter(|t| t.is_linked())
            .cloned()
            .collect())
    }

    fn apply_update(&self, ticket_id: i64, update: &TicketUpdate) -> StoreResult<UpdateOutcome> {
        let mut inner = self.lock()?;
        if inner.failing_tickets.contains(&ticket_id) {
            return Err(StoreError::Database(format!(
                "simulated write failure for ticket {ticket_id}"
            )));
        }
        let current = inner
            .tickets
            .get(&ticket_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))?;

        let (next, outcome) = compute_update(current, update)?;
        if outcome.changed() {
            inner.tickets.insert(ticket_id, next);
            inner.writes += 1;
        }
        Ok(outcome)
    }

    fn environment(&self, id: i64) -> StoreResult<Option<Environment>> {
        Ok(self.lock()?.environments.get(&id).cloned())
    }

    fn environment_by_name(&self, owner_id: i64, name: &str) -> StoreResult<Option<Environment>> {
        Ok(self
            .lock()?
            .environments
            .values()
            .find(|e| e.owner_id == owner_id && e.name == name)
            .cloned())
    }

    fn area(&self, id: i64) -> StoreResult<Option<Area>> {
        Ok(self.lock()?.areas.get(&id).cloned())
    }

    fn area_by_name(&self, owner_id: i64, name: &str) -> StoreResult<Option<Area>> {
        Ok(self
            .lock()?
            .areas
            .values()
            .find(|a| a.owner_id == owner_id && a.name == name)
            .cloned())
    }
}

impl InteractionStore for MemoryStore {
    fn add_interaction(&self, interaction: NewInteraction) -> StoreResult<Interaction> {
        let mut inner = self.lock()?;
        if !inner.tickets.contains_key(&interaction.ticket_id) {
            return Err(StoreError::NotFound(format!(
                "ticket {}",
                interaction.ticket_id
            )));
        }
        let id = inner.next_id();
        let stored = Interaction {
            id,
            ticket_id: interaction.ticket_id,
            author_id: interaction.author_id,
            body: interaction.body,
            attachment_name: interaction.attachment_name,
            created_at: interaction.created_at.unwrap_or_else(Utc::now),
        };
        inner.interactions.push(stored.clone());
        Ok(stored)
    }

    fn interactions(&self, ticket_id: i64) -> StoreResult<Vec<Interaction>> {
        let mut list: Vec<Interaction> = self
            .lock()?
            .interactions
            .iter()
            .filter(|i| i.ticket_id == ticket_id)
            .cloned()
            .collect();
        list.sort_by_key(|i| (i.created_at, i.id));
        Ok(list)
    }

    fn interaction_exists(&self, ticket_id: i64, body: &str) -> StoreResult<bool> {
        Ok(self
            .lock()?
            .interactions
            .iter()
            .any(|i| i.ticket_id == ticket_id && i.body == body))
    }
}

impl NotificationStore for MemoryStore {
    fn insert_notifications(&self, notifications: &[NewNotification]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        if inner.failing_notifications {
            return Err(StoreError::Database("notification insert refused".to_string()));
        }
        let now = Utc::now();
        for n in notifications {
            let id = inner.next_id();
            inner.notifications.push(Notification {
                id,
                recipient_id: n.recipient_id,
                ticket_id: n.ticket_id,
                kind: n.kind,
                title: n.title.clone(),
                preview: n.preview.clone(),
                link: n.link.clone(),
                is_read: false,
                created_at: now,
            });
        }
        Ok(notifications.len())
    }

    fn unread_notifications(
        &self,
        recipient_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        let mut unread: Vec<Notification> = self
            .lock()?
            .notifications
            .iter()
            .filter(|n| n.recipient_id == recipient_id && !n.is_read)
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        unread.truncate(limit);
        Ok(unread)
    }

    fn mark_read(&self, notification_id: i64, recipient_id: i64) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.recipient_id == recipient_id)
        {
            Some(n) => {
                n.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Directory for MemoryStore {
    fn user(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    fn support_team(&self, consultant_group: &str) -> StoreResult<Vec<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .filter(|u| u.is_staff || u.in_group(consultant_group))
            .cloned()
            .collect())
    }

    fn system_user(&self, email: &str) -> StoreResult<User> {
        let mut inner = self.lock()?;
        if let Some(user) = inner.users.values().find(|u| u.email == email) {
            return Ok(user.clone());
        }
        let id = inner.next_id();
        let user = User {
            id,
            username: email.to_string(),
            email: email.to_string(),
            first_name: "Remote".to_string(),
            last_name: "System".to_string(),
            is_staff: true,
            is_active: false,
            location: None,
            person_id: None,
            groups: Vec::new(),
        };
        inner.users.insert(id, user.clone());
        Ok(user)
    }
}

impl JobLocks for MemoryStore {
    fn try_lock_job(&self, job_name: &str) -> StoreResult<bool> {
        Ok(self.lock()?.locks.insert(job_name.to_string()))
    }

    fn unlock_job(&self, job_name: &str) -> StoreResult<()> {
        self.lock()?.locks.remove(job_name);
        Ok(())
    }
}
