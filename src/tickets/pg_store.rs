use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::sql_types::{Bool, Text};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::shared::models::{
    areas, environments, notifications, ticket_interactions, tickets, user_groups, users, Area,
    AreaRow, Environment, EnvironmentRow, InteractionRow, NewInteractionRow, NewNotificationRow,
    NewTicketRow, NewUserRow, NotificationRow, TicketRow, User, UserRow,
};
use crate::core::shared::utils::DbPool;
use crate::notifications::{NewNotification, Notification};

use super::store::{
    compute_update, Directory, InteractionStore, JobLocks, NotificationStore, StoreError,
    StoreResult, TicketStore,
};
use super::{
    Interaction, NewInteraction, NewTicket, Ticket, TicketStatus, TicketUpdate, UpdateOutcome,
};

type PgPooled = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(QueryableByName)]
struct LockRow {
    #[diesel(sql_type = Bool)]
    acquired: bool,
}

/// Diesel-backed store over the shared connection pool.
pub struct PgStore {
    pool: DbPool,
    // Advisory locks are session scoped, so the connection that took a lock
    // is parked here until the lock is released.
    held_locks: Mutex<HashMap<String, PgPooled>>,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    fn conn(&self) -> StoreResult<PgPooled> {
        Ok(self.pool.get()?)
    }

    fn terminal_codes() -> Vec<&'static str> {
        TicketStatus::TERMINAL.iter().map(|s| s.code()).collect()
    }

    fn groups_of(conn: &mut PgConnection, user_id: i64) -> StoreResult<Vec<String>> {
        Ok(user_groups::table
            .filter(user_groups::user_id.eq(user_id))
            .select(user_groups::group_name)
            .order(user_groups::group_name.asc())
            .load(conn)?)
    }

    fn rows_to_tickets(rows: Vec<TicketRow>) -> StoreResult<Vec<Ticket>> {
        rows.into_iter().map(Ticket::try_from).collect()
    }
}

impl TicketStore for PgStore {
    fn create_ticket(&self, ticket: NewTicket) -> StoreResult<Ticket> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let row: TicketRow = diesel::insert_into(tickets::table)
            .values(&NewTicketRow {
                owner_id: ticket.owner_id,
                summary: &ticket.summary,
                description: &ticket.description,
                status: TicketStatus::New.code(),
                priority: ticket.priority.map(|p| i16::from(p.value())),
                environment_id: ticket.environment_id,
                area_id: ticket.area_id,
                created_at: now,
                updated_at: now,
            })
            .returning(TicketRow::as_returning())
            .get_result(&mut conn)?;
        Ticket::try_from(row)
    }

    fn ticket(&self, id: i64) -> StoreResult<Option<Ticket>> {
        let mut conn = self.conn()?;
        tickets::table
            .find(id)
            .select(TicketRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Ticket::try_from)
            .transpose()
    }

    fn open_tickets(&self) -> StoreResult<Vec<Ticket>> {
        let mut conn = self.conn()?;
        let rows = tickets::table
            .filter(tickets::status.ne_all(Self::terminal_codes()))
            .order(tickets::id.asc())
            .select(TicketRow::as_select())
            .load(&mut conn)?;
        Self::rows_to_tickets(rows)
    }

    fn linked_tickets(&self) -> StoreResult<Vec<Ticket>> {
        let mut conn = self.conn()?;
        let rows = tickets::table
            .filter(tickets::external_id.is_not_null())
            .filter(tickets::external_id.ne(""))
            .order(tickets::id.asc())
            .select(TicketRow::as_select())
            .load(&mut conn)?;
        Self::rows_to_tickets(rows)
    }

    fn apply_update(&self, ticket_id: i64, update: &TicketUpdate) -> StoreResult<UpdateOutcome> {
        let mut conn = self.conn()?;
        conn.transaction::<UpdateOutcome, StoreError, _>(|conn| {
            let current: TicketRow = tickets::table
                .find(ticket_id)
                .select(TicketRow::as_select())
                .for_update()
                .first(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))?;

            let (next, outcome) = compute_update(Ticket::try_from(current)?, update)?;
            if !outcome.changed() {
                debug!("ticket_id={ticket_id} unchanged, skipping write");
                return Ok(outcome);
            }

            diesel::update(tickets::table.find(ticket_id))
                .set((
                    tickets::external_id.eq(next.external_id.as_deref()),
                    tickets::status.eq(next.status.code()),
                    tickets::updated_at.eq(next.updated_at),
                ))
                .execute(conn)?;
            Ok(outcome)
        })
    }

    fn environment(&self, id: i64) -> StoreResult<Option<Environment>> {
        let mut conn = self.conn()?;
        Ok(environments::table
            .find(id)
            .select(EnvironmentRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Environment::from))
    }

    fn environment_by_name(&self, owner_id: i64, name: &str) -> StoreResult<Option<Environment>> {
        let mut conn = self.conn()?;
        Ok(environments::table
            .filter(environments::owner_id.eq(owner_id))
            .filter(environments::name.eq(name))
            .select(EnvironmentRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Environment::from))
    }

    fn area(&self, id: i64) -> StoreResult<Option<Area>> {
        let mut conn = self.conn()?;
        Ok(areas::table
            .find(id)
            .select(AreaRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Area::from))
    }

    fn area_by_name(&self, owner_id: i64, name: &str) -> StoreResult<Option<Area>> {
        let mut conn = self.conn()?;
        Ok(areas::table
            .filter(areas::owner_id.eq(owner_id))
            .filter(areas::name.eq(name))
            .select(AreaRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Area::from))
    }
}

impl InteractionStore for PgStore {
    fn add_interaction(&self, interaction: NewInteraction) -> StoreResult<Interaction> {
        let mut conn = self.conn()?;
        let row: InteractionRow = diesel::insert_into(ticket_interactions::table)
            .values(&NewInteractionRow {
                ticket_id: interaction.ticket_id,
                author_id: interaction.author_id,
                body: &interaction.body,
                attachment_name: interaction.attachment_name.as_deref(),
                created_at: interaction.created_at.unwrap_or_else(Utc::now),
            })
            .returning(InteractionRow::as_returning())
            .get_result(&mut conn)?;
        Ok(row.into())
    }

    fn interactions(&self, ticket_id: i64) -> StoreResult<Vec<Interaction>> {
        let mut conn = self.conn()?;
        let rows: Vec<InteractionRow> = ticket_interactions::table
            .filter(ticket_interactions::ticket_id.eq(ticket_id))
            .order((
                ticket_interactions::created_at.asc(),
                ticket_interactions::id.asc(),
            ))
            .select(InteractionRow::as_select())
            .load(&mut conn)?;
        Ok(rows.into_iter().map(Interaction::from).collect())
    }

    fn interaction_exists(&self, ticket_id: i64, body: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        Ok(diesel::select(diesel::dsl::exists(
            ticket_interactions::table
                .filter(ticket_interactions::ticket_id.eq(ticket_id))
                .filter(ticket_interactions::body.eq(body)),
        ))
        .get_result(&mut conn)?)
    }
}

impl NotificationStore for PgStore {
    fn insert_notifications(&self, batch: &[NewNotification]) -> StoreResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let now = Utc::now();
        let rows: Vec<NewNotificationRow<'_>> = batch
            .iter()
            .map(|n| NewNotificationRow {
                recipient_id: n.recipient_id,
                ticket_id: n.ticket_id,
                kind: n.kind.tag(),
                title: &n.title,
                preview: &n.preview,
                link: &n.link,
                is_read: false,
                created_at: now,
            })
            .collect();
        Ok(diesel::insert_into(notifications::table)
            .values(&rows)
            .execute(&mut conn)?)
    }

    fn unread_notifications(
        &self,
        recipient_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        let mut conn = self.conn()?;
        let rows: Vec<NotificationRow> = notifications::table
            .filter(notifications::recipient_id.eq(recipient_id))
            .filter(notifications::is_read.eq(false))
            .order((notifications::created_at.desc(), notifications::id.desc()))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .select(NotificationRow::as_select())
            .load(&mut conn)?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    fn mark_read(&self, notification_id: i64, recipient_id: i64) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            notifications::table
                .filter(notifications::id.eq(notification_id))
                .filter(notifications::recipient_id.eq(recipient_id)),
        )
        .set(notifications::is_read.eq(true))
        .execute(&mut conn)?;
        Ok(updated > 0)
    }
}

impl Directory for PgStore {
    fn user(&self, id: i64) -> StoreResult<Option<User>> {
        let mut conn = self.conn()?;
        let Some(row) = users::table
            .find(id)
            .select(UserRow::as_select())
            .first(&mut conn)
            .optional()?
        else {
            return Ok(None);
        };
        let groups = Self::groups_of(&mut conn, row.id)?;
        Ok(Some(row.into_user(groups)))
    }

    fn support_team(&self, consultant_group: &str) -> StoreResult<Vec<User>> {
        let mut conn = self.conn()?;
        let consultants = user_groups::table
            .filter(user_groups::group_name.eq(consultant_group))
            .select(user_groups::user_id);
        // A staff member who is also a consultant matches both branches; the
        // OR keeps each row once.
        let rows: Vec<UserRow> = users::table
            .filter(users::is_staff.eq(true).or(users::id.eq_any(consultants)))
            .order(users::id.asc())
            .select(UserRow::as_select())
            .load(&mut conn)?;

        let mut team = Vec::with_capacity(rows.len());
        for row in rows {
            let groups = Self::groups_of(&mut conn, row.id)?;
            team.push(row.into_user(groups));
        }
        Ok(team)
    }

    fn system_user(&self, email: &str) -> StoreResult<User> {
        let mut conn = self.conn()?;
        conn.transaction::<User, StoreError, _>(|conn| {
            if let Some(row) = users::table
                .filter(users::email.eq(email))
                .select(UserRow::as_select())
                .first(conn)
                .optional()?
            {
                let groups = Self::groups_of(conn, row.id)?;
                return Ok(row.into_user(groups));
            }
            let row: UserRow = diesel::insert_into(users::table)
                .values(&NewUserRow {
                    username: email,
                    email,
                    first_name: "Remote",
                    last_name: "System",
                    is_staff: true,
                    is_active: false,
                })
                .returning(UserRow::as_returning())
                .get_result(conn)?;
            Ok(row.into_user(Vec::new()))
        })
    }
}

impl JobLocks for PgStore {
    fn try_lock_job(&self, job_name: &str) -> StoreResult<bool> {
        let mut held = self
            .held_locks
            .lock()
            .map_err(|_| StoreError::Connection("job lock registry poisoned".to_string()))?;
        if held.contains_key(job_name) {
            return Ok(false);
        }
        let mut conn = self.conn()?;
        let row: LockRow = diesel::sql_query("SELECT pg_try_advisory_lock(hashtext($1)) AS acquired")
            .bind::<Text, _>(job_name)
            .get_result(&mut conn)?;
        if row.acquired {
            held.insert(job_name.to_string(), conn);
        }
        Ok(row.acquired)
    }

    fn unlock_job(&self, job_name: &str) -> StoreResult<()> {
        let conn = self
            .held_locks
            .lock()
            .map_err(|_| StoreError::Connection("job lock registry poisoned".to_string()))?
            .remove(job_name);
        let Some(mut conn) = conn else {
            warn!("unlock requested for job {job_name} that holds no lock");
            return Ok(());
        };
        let row: LockRow = diesel::sql_query("SELECT pg_advisory_unlock(hashtext($1)) AS acquired")
            .bind::<Text, _>(job_name)
            .get_result(&mut conn)?;
        if !row.acquired {
            warn!("advisory lock for job {job_name} was already released");
        }
        Ok(())
    }
}
