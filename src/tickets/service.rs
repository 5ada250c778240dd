use log::{info, warn};
use std::sync::Arc;

use super::remote::{RemoteTicketing, WorklogChannel};
use super::{
    Interaction, NewInteraction, PortalStore, StoreError, Ticket, TicketStatus, TicketUpdate,
    UpdateOutcome,
};
use crate::core::shared::models::User;
use crate::email::EmailAttachment;
use crate::notifications::{DispatchSummary, Inbox, NotificationDispatcher};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("not allowed: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PostedInteraction {
    pub interaction: Interaction,
    pub dispatch: DispatchSummary,
    /// `None` when the ticket is not linked yet.
    pub remote_submitted: Option<bool>,
}

/// Operations the portal performs on behalf of a signed-in user.
pub struct TicketService {
    store: Arc<dyn PortalStore>,
    remote: Arc<dyn RemoteTicketing>,
    dispatcher: Arc<NotificationDispatcher>,
    inbox_limit: usize,
}

impl TicketService {
    pub fn new(
        store: Arc<dyn PortalStore>,
        remote: Arc<dyn RemoteTicketing>,
        dispatcher: Arc<NotificationDispatcher>,
        inbox_limit: usize,
    ) -> Self {
        Self {
            store,
            remote,
            dispatcher,
            inbox_limit,
        }
    }

    pub fn user(&self, user_id: i64) -> Result<User, ServiceError> {
        self.store
            .user(user_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))
    }

    fn visible_ticket(&self, actor: &User, ticket_id: i64) -> Result<Ticket, ServiceError> {
        let ticket = self
            .store
            .ticket(ticket_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("ticket {ticket_id}")))?;
        if ticket.owner_id != actor.id && !self.dispatcher.is_support_member(actor) {
            return Err(ServiceError::Forbidden(format!(
                "user {} cannot access ticket {ticket_id}",
                actor.id
            )));
        }
        Ok(ticket)
    }

    pub fn ticket(&self, actor: &User, ticket_id: i64) -> Result<Ticket, ServiceError> {
        self.visible_ticket(actor, ticket_id)
    }

    pub fn interactions(&self, actor: &User, ticket_id: i64) -> Result<Vec<Interaction>, ServiceError> {
        self.visible_ticket(actor, ticket_id)?;
        Ok(self.store.interactions(ticket_id)?)
    }

    /// Support-team status change. Goes through the same compare-before-commit
    /// update as reconciliation, so an unchanged status notifies nobody.
    pub fn change_status(
        &self,
        actor: &User,
        ticket_id: i64,
        status: TicketStatus,
    ) -> Result<UpdateOutcome, ServiceError> {
        if !self.dispatcher.is_support_member(actor) {
            return Err(ServiceError::Forbidden(
                "only the support team can change a ticket status".to_string(),
            ));
        }
        let outcome = self.store.apply_update(
            ticket_id,
            &TicketUpdate {
                external_id: None,
                status: Some(status),
            },
        )?;
        if let Some(transition) = outcome.transition {
            info!(
                "ticket_id={ticket_id} status {} -> {} by user {}",
                transition.from, transition.to, actor.id
            );
            self.dispatcher.status_changed(&outcome.ticket, &transition);
        }
        Ok(outcome)
    }

    /// Stores a chat message, notifies the other side and, for linked
    /// tickets, mirrors it as a remote worklog on a best-effort basis.
    pub async fn post_interaction(
        &self,
        author: &User,
        ticket_id: i64,
        body: String,
        attachment: Option<EmailAttachment>,
    ) -> Result<PostedInteraction, ServiceError> {
        let ticket = self.visible_ticket(author, ticket_id)?;
        let body = body.trim().to_string();
        if body.is_empty() && attachment.is_none() {
            return Err(ServiceError::Invalid("message is empty".to_string()));
        }

        let interaction = self.store.add_interaction(NewInteraction {
            ticket_id,
            author_id: author.id,
            body,
            attachment_name: attachment.as_ref().map(|a| a.file_name.clone()),
            created_at: None,
        })?;

        let dispatch =
            self.dispatcher
                .interaction_created(&ticket, &interaction, author, attachment.as_ref());

        let remote_submitted = match ticket.external_id.as_deref() {
            Some(external_id) if !interaction.body.is_empty() => {
                let channel =
                    WorklogChannel::for_author(self.dispatcher.is_support_member(author));
                let sent = self
                    .remote
                    .submit_interaction(external_id, &author.full_name(), channel, &interaction.body)
                    .await;
                if !sent {
                    warn!("ticket_id={ticket_id} message kept locally, worklog not mirrored");
                }
                Some(sent)
            }
            _ => None,
        };

        Ok(PostedInteraction {
            interaction,
            dispatch,
            remote_submitted,
        })
    }

    /// Unread notifications, newest first, with the total unread count.
    pub fn inbox(&self, user: &User) -> Result<Inbox, ServiceError> {
        let mut notifications = self.store.unread_notifications(user.id, usize::MAX)?;
        let unread_count = notifications.len();
        notifications.truncate(self.inbox_limit);
        Ok(Inbox {
            notifications,
            unread_count,
        })
    }

    pub fn mark_read(&self, user: &User, notification_id: i64) -> Result<(), ServiceError> {
        if self.store.mark_read(notification_id, user.id)? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("notification {notification_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{EmailQueue, RecordingMailer};
    use crate::notifications::{NotificationKind, NotificationSettings};
    use crate::tickets::memory_store::MemoryStore;
    use crate::tickets::remote::{RemoteError, RemoteTicketRecord, RemoteWorklog};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRemote {
        submitted: Mutex<Vec<(String, String, WorklogChannel)>>,
    }

    #[async_trait]
    impl RemoteTicketing for RecordingRemote {
        async fn fetch_all(&self) -> Result<Vec<RemoteTicketRecord>, RemoteError> {
            Ok(Vec::new())
        }

        async fn fetch_worklogs(&self, _: &str) -> Result<Vec<RemoteWorklog>, RemoteError> {
            Ok(Vec::new())
        }

        async fn submit_interaction(
            &self,
            external_id: &str,
            author_label: &str,
            channel: WorklogChannel,
            _: &str,
        ) -> bool {
            self.submitted.lock().unwrap().push((
                external_id.to_string(),
                author_label.to_string(),
                channel,
            ));
            true
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        remote: Arc<RecordingRemote>,
        mailer: Arc<RecordingMailer>,
        service: TicketService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(RecordingRemote::default());
        let mailer = Arc::new(RecordingMailer::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            Arc::new(EmailQueue::inline(mailer.clone())),
            NotificationSettings {
                portal_base_url: "https://portal.example".to_string(),
                support_mailbox: "support@example.com".to_string(),
                from_address: "portal@example.com".to_string(),
                consultant_group: "Consultants".to_string(),
                preview_chars: 60,
            },
        ));
        let service = TicketService::new(store.clone(), remote.clone(), dispatcher, 5);
        Fixture {
            store,
            remote,
            mailer,
            service,
        }
    }

    #[test]
    fn test_change_status_requires_support_member() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        let err = f
            .service
            .change_status(&owner, ticket.id, TicketStatus::Closed)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[test]
    fn test_change_status_dispatches_only_on_change() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let staff = f.store.add_user("staff", "staff@example.com", true, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::InProgress);

        let outcome = f
            .service
            .change_status(&staff, ticket.id, TicketStatus::Resolved)
            .unwrap();
        assert!(outcome.transition.is_some());
        let again = f
            .service
            .change_status(&staff, ticket.id, TicketStatus::Resolved)
            .unwrap();
        assert!(again.transition.is_none());

        let notifications = f.store.all_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::Status);
        assert_eq!(f.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_customer_message_on_linked_ticket_is_mirrored() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        f.store.add_user("staff", "staff@example.com", true, &[]);
        let ticket = f
            .store
            .seed_ticket(owner.id, "printer jam", Some("100"), TicketStatus::InProgress);

        let posted = f
            .service
            .post_interaction(&owner, ticket.id, "still broken".to_string(), None)
            .await
            .unwrap();
        assert_eq!(posted.remote_submitted, Some(true));
        assert_eq!(posted.dispatch.notifications, 1);
        let submitted = f.remote.submitted.lock().unwrap().clone();
        assert_eq!(
            submitted,
            vec![("100".to_string(), "client".to_string(), WorklogChannel::CustomerNote)]
        );
    }

    #[tokio::test]
    async fn test_unlinked_ticket_is_not_mirrored() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        let posted = f
            .service
            .post_interaction(&owner, ticket.id, "hello".to_string(), None)
            .await
            .unwrap();
        assert_eq!(posted.remote_submitted, None);
        assert!(f.remote.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strangers_cannot_post() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let stranger = f.store.add_user("other", "other@example.com", false, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        let err = f
            .service
            .post_interaction(&stranger, ticket.id, "hello".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[test]
    fn test_inbox_limits_but_counts_all_unread() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let staff = f.store.add_user("staff", "staff@example.com", true, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        let statuses = [
            TicketStatus::Queued,
            TicketStatus::InProgress,
            TicketStatus::Pending,
            TicketStatus::InProgress,
            TicketStatus::Resolved,
            TicketStatus::Closed,
        ];
        for status in statuses {
            f.service.change_status(&staff, ticket.id, status).unwrap();
        }

        let inbox = f.service.inbox(&owner).unwrap();
        assert_eq!(inbox.unread_count, 6);
        assert_eq!(inbox.notifications.len(), 5);
        let newest = inbox.notifications[0].id;
        assert!(inbox.notifications.iter().all(|n| n.id <= newest));

        f.service.mark_read(&owner, newest).unwrap();
        assert_eq!(f.service.inbox(&owner).unwrap().unread_count, 5);
        assert!(matches!(
            f.service.mark_read(&staff, inbox.notifications[1].id),
            Err(ServiceError::NotFound(_))
        ));
    }
}
