//! Fan-out of portal notifications and emails.

use log::{debug, error, warn};
use std::collections::HashSet;
use std::sync::Arc;

use super::templates;
use super::{NewNotification, NotificationKind};
use crate::core::config::AppConfig;
use crate::core::shared::models::User;
use crate::core::shared::utils::truncate_chars;
use crate::email::{EmailAttachment, EmailQueue, OutboundEmail};
use crate::tickets::{Interaction, PortalStore, StatusTransition, Ticket};

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub portal_base_url: String,
    pub support_mailbox: String,
    pub from_address: String,
    pub consultant_group: String,
    pub preview_chars: usize,
}

impl NotificationSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            portal_base_url: config.server.base_url.clone(),
            support_mailbox: config.email.support_mailbox.clone(),
            from_address: config.email.from_address.clone(),
            consultant_group: config.support.consultant_group.clone(),
            preview_chars: config.support.preview_chars,
        }
    }
}

/// What one dispatch call actually delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub notifications: usize,
    pub emails: usize,
}

pub struct NotificationDispatcher {
    store: Arc<dyn PortalStore>,
    email: Arc<EmailQueue>,
    settings: NotificationSettings,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn PortalStore>,
        email: Arc<EmailQueue>,
        settings: NotificationSettings,
    ) -> Self {
        Self {
            store,
            email,
            settings,
        }
    }

    pub fn settings(&self) -> &NotificationSettings {
        &self.settings
    }

    /// Staff accounts and members of the consultant group.
    pub fn is_support_member(&self, user: &User) -> bool {
        user.is_staff || user.in_group(&self.settings.consultant_group)
    }

    /// Tells the ticket owner about a committed status change.
    pub fn status_changed(&self, ticket: &Ticket, transition: &StatusTransition) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        if transition.from == transition.to {
            return summary;
        }

        let owner = match self.store.user(ticket.owner_id) {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                warn!(
                    "ticket_id={} has no owner account {}, status notification skipped",
                    ticket.id, ticket.owner_id
                );
                return summary;
            }
            Err(e) => {
                error!("ticket_id={} owner lookup failed: {e}", ticket.id);
                return summary;
            }
        };

        let link = templates::ticket_link(&self.settings.portal_base_url, ticket.id, false);
        summary.notifications = self.insert(&[NewNotification {
            recipient_id: owner.id,
            ticket_id: Some(ticket.id),
            kind: NotificationKind::Status,
            title: templates::status_title(ticket),
            preview: templates::status_preview(transition),
            link: link.clone(),
        }]);

        if owner.email.trim().is_empty() {
            debug!("owner {} has no email, status email skipped", owner.id);
        } else {
            summary.emails += self.send(OutboundEmail {
                subject: templates::status_subject(ticket, transition),
                html_body: templates::status_email_html(&owner, ticket, transition, &link),
                from: self.settings.from_address.clone(),
                to: vec![owner.email.clone()],
                reply_to: None,
                attachment: None,
            });
        }
        summary
    }

    /// Tells the other side of the conversation about a new interaction.
    ///
    /// A support-team author notifies the owner. Any other author notifies
    /// every support-team member in the portal and writes one email to the
    /// shared support mailbox.
    pub fn interaction_created(
        &self,
        ticket: &Ticket,
        interaction: &Interaction,
        author: &User,
        attachment: Option<&EmailAttachment>,
    ) -> DispatchSummary {
        let preview = truncate_chars(&interaction.body, self.settings.preview_chars);
        if self.is_support_member(author) {
            self.notify_owner(ticket, interaction, author, preview, attachment)
        } else {
            self.notify_support(ticket, interaction, author, preview, attachment)
        }
    }

    fn notify_owner(
        &self,
        ticket: &Ticket,
        interaction: &Interaction,
        author: &User,
        preview: String,
        attachment: Option<&EmailAttachment>,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let owner = match self.store.user(ticket.owner_id) {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                warn!("ticket_id={} owner {} not found", ticket.id, ticket.owner_id);
                return summary;
            }
            Err(e) => {
                error!("ticket_id={} owner lookup failed: {e}", ticket.id);
                return summary;
            }
        };
        if owner.id == author.id {
            return summary;
        }

        let link = templates::ticket_link(&self.settings.portal_base_url, ticket.id, false);
        summary.notifications = self.insert(&[NewNotification {
            recipient_id: owner.id,
            ticket_id: Some(ticket.id),
            kind: NotificationKind::Message,
            title: templates::message_title(ticket),
            preview,
            link: link.clone(),
        }]);
        if !owner.email.trim().is_empty() {
            summary.emails += self.send(OutboundEmail {
                subject: templates::message_subject_for_owner(ticket),
                html_body: templates::message_email_html(ticket, author, &interaction.body, &link),
                from: self.settings.from_address.clone(),
                to: vec![owner.email.clone()],
                reply_to: None,
                attachment: attachment.cloned(),
            });
        }
        summary
    }

    fn notify_support(
        &self,
        ticket: &Ticket,
        interaction: &Interaction,
        author: &User,
        preview: String,
        attachment: Option<&EmailAttachment>,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let link = templates::ticket_link(&self.settings.portal_base_url, ticket.id, true);

        match self.store.support_team(&self.settings.consultant_group) {
            Ok(team) => {
                let mut seen = HashSet::new();
                let batch: Vec<NewNotification> = team
                    .into_iter()
                    .filter(|member| member.id != author.id && seen.insert(member.id))
                    .map(|member| NewNotification {
                        recipient_id: member.id,
                        ticket_id: Some(ticket.id),
                        kind: NotificationKind::Message,
                        title: templates::message_title(ticket),
                        preview: preview.clone(),
                        link: link.clone(),
                    })
                    .collect();
                summary.notifications = self.insert(&batch);
            }
            Err(e) => error!("ticket_id={} support team lookup failed: {e}", ticket.id),
        }

        let reply_to = Some(author.email.clone()).filter(|email| !email.trim().is_empty());
        summary.emails += self.send(OutboundEmail {
            subject: templates::message_subject_for_support(ticket, author),
            html_body: templates::message_email_html(ticket, author, &interaction.body, &link),
            from: self.settings.from_address.clone(),
            to: vec![self.settings.support_mailbox.clone()],
            reply_to,
            attachment: attachment.cloned(),
        });
        summary
    }

    fn insert(&self, batch: &[NewNotification]) -> usize {
        if batch.is_empty() {
            return 0;
        }
        match self.store.insert_notifications(batch) {
            Ok(written) => written,
            Err(e) => {
                error!("failed to store {} notifications: {e}", batch.len());
                0
            }
        }
    }

    fn send(&self, email: OutboundEmail) -> usize {
        let subject = email.subject.clone();
        match self.email.submit(email) {
            Ok(()) => 1,
            Err(e) => {
                error!("email '{subject}' not sent: {e}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::RecordingMailer;
    use crate::tickets::memory_store::MemoryStore;
    use crate::tickets::TicketStatus;
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        mailer: Arc<RecordingMailer>,
        dispatcher: NotificationDispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            Arc::new(EmailQueue::inline(mailer.clone())),
            NotificationSettings {
                portal_base_url: "https://portal.example".to_string(),
                support_mailbox: "support@example.com".to_string(),
                from_address: "portal@example.com".to_string(),
                consultant_group: "Consultants".to_string(),
                preview_chars: 60,
            },
        );
        Fixture {
            store,
            mailer,
            dispatcher,
        }
    }

    fn interaction(ticket: &Ticket, author: &User, body: &str) -> Interaction {
        Interaction {
            id: 99,
            ticket_id: ticket.id,
            author_id: author.id,
            body: body.to_string(),
            attachment_name: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_change_notifies_owner_once() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let ticket = f
            .store
            .seed_ticket(owner.id, "printer jam", Some("100"), TicketStatus::Resolved);
        let transition = StatusTransition {
            from: TicketStatus::InProgress,
            to: TicketStatus::Resolved,
        };

        let summary = f.dispatcher.status_changed(&ticket, &transition);
        assert_eq!(summary, DispatchSummary { notifications: 1, emails: 1 });

        let notifications = f.store.all_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::Status);
        assert_eq!(notifications[0].recipient_id, owner.id);
        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["client@example.com".to_string()]);
    }

    #[test]
    fn test_customer_message_fans_out_to_support() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let staff = f.store.add_user("staff", "staff@example.com", true, &[]);
        let both = f
            .store
            .add_user("lead", "lead@example.com", true, &["Consultants"]);
        let consultant = f
            .store
            .add_user("consultant", "c@example.com", false, &["Consultants"]);
        f.store.add_user("other", "other@example.com", false, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);

        let summary = f.dispatcher.interaction_created(
            &ticket,
            &interaction(&ticket, &owner, "any news?"),
            &owner,
            None,
        );
        assert_eq!(summary, DispatchSummary { notifications: 3, emails: 1 });

        let mut recipients: Vec<i64> = f
            .store
            .all_notifications()
            .iter()
            .map(|n| n.recipient_id)
            .collect();
        recipients.sort_unstable();
        assert_eq!(recipients, vec![staff.id, both.id, consultant.id]);
        assert!(f
            .store
            .all_notifications()
            .iter()
            .all(|n| n.kind == NotificationKind::Message && n.link.ends_with("?origin=queue")));

        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["support@example.com".to_string()]);
        assert_eq!(sent[0].reply_to.as_deref(), Some("client@example.com"));
    }

    #[test]
    fn test_support_reply_notifies_owner() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        let consultant = f
            .store
            .add_user("consultant", "c@example.com", false, &["Consultants"]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        let body = "x".repeat(80);

        let summary = f.dispatcher.interaction_created(
            &ticket,
            &interaction(&ticket, &consultant, &body),
            &consultant,
            None,
        );
        assert_eq!(summary, DispatchSummary { notifications: 1, emails: 1 });
        let notifications = f.store.all_notifications();
        assert_eq!(notifications[0].recipient_id, owner.id);
        assert_eq!(notifications[0].preview, format!("{}...", "x".repeat(60)));
        assert!(!notifications[0].link.contains("origin=queue"));
    }

    #[test]
    fn test_failures_are_swallowed() {
        let f = fixture();
        let owner = f.store.add_user("client", "client@example.com", false, &[]);
        f.store.add_user("staff", "staff@example.com", true, &[]);
        let ticket = f.store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        f.store.fail_notification_writes(true);
        f.mailer.fail_sends(true);

        let summary = f.dispatcher.interaction_created(
            &ticket,
            &interaction(&ticket, &owner, "hello"),
            &owner,
            None,
        );
        assert_eq!(summary, DispatchSummary::default());
    }
}
