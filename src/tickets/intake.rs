//! Ticket submission from the portal.

use log::{error, info};
use std::sync::Arc;

use super::{NewTicket, PortalStore, Priority, StoreError, Ticket};
use crate::core::shared::models::User;
use crate::core::shared::utils::html_escape;
use crate::email::{EmailAttachment, EmailError, Mailer, OutboundEmail};

pub const SUMMARY_MAX_CHARS: usize = 100;

pub const GENERIC_FAILURE_MESSAGE: &str =
    "We could not submit your ticket right now. Please try again in a few minutes.";

#[derive(Debug, Clone, Default)]
pub struct TicketSubmission {
    pub summary: String,
    pub description: String,
    /// Environment name, one of the submitter's environments.
    pub environment: String,
    pub priority: i64,
    pub area: Option<String>,
    pub attachment: Option<EmailAttachment>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("summary is {0} characters, the limit is {SUMMARY_MAX_CHARS}")]
    SummaryTooLong(usize),
    #[error(transparent)]
    InvalidPriority(#[from] super::InvalidPriority),
    #[error("unknown environment {0:?}")]
    UnknownEnvironment(String),
    #[error("unknown area {0:?}")]
    UnknownArea(String),
    #[error("listener email failed: {0}")]
    Email(#[from] EmailError),
    #[error("ticket could not be stored: {0}")]
    Store(#[from] StoreError),
}

impl IntakeError {
    /// Text shown to the submitter. Infrastructure failures get the generic
    /// retry prompt.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingField(_) => "Please fill in all required fields.".to_string(),
            Self::SummaryTooLong(_) => {
                format!("The summary must be at most {SUMMARY_MAX_CHARS} characters.")
            }
            Self::InvalidPriority(_) => "Priority must be between 1 and 5.".to_string(),
            Self::UnknownEnvironment(_) => {
                "The selected environment is invalid. Please try again.".to_string()
            }
            Self::UnknownArea(_) => "The selected area is invalid. Please try again.".to_string(),
            Self::Email(_) | Self::Store(_) => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::Email(_) | Self::Store(_))
    }
}

/// Values carried by the listener tag block.
#[derive(Debug, Clone)]
pub struct ListenerFields<'a> {
    pub summary: &'a str,
    pub description: &'a str,
    pub asset_number: &'a str,
    pub priority: Priority,
    pub area: Option<&'a str>,
    pub location: Option<&'a str>,
    pub affected_person: Option<&'a str>,
    pub site_id: &'a str,
}

fn tag_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_tag(body: &mut String, tag: &str, value: &str) {
    body.push_str(tag);
    body.push('=');
    body.push_str(&tag_value(value));
    body.push_str("<br>;<br>");
}

/// HTML body understood by the remote email listener.
pub fn listener_body(fields: &ListenerFields<'_>) -> String {
    let description = html_escape(fields.description.trim()).replace('\n', "<br>");
    let mut body = format!("Problem description: {description}<br><br>");
    body.push_str("#MAXIMO_EMAIL_BEGIN<br>");
    push_tag(&mut body, "SR#DESCRIPTION", fields.summary);
    push_tag(&mut body, "SR#ASSETNUM", fields.asset_number);
    push_tag(&mut body, "SR#REPORTEDPRIORITY", &fields.priority.to_string());
    for (tag, value) in [
        ("SR#ITC_AREA", fields.area),
        ("SR#LOCATION", fields.location),
        ("SR#AFFECTEDPERSONID", fields.affected_person),
    ] {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            push_tag(&mut body, tag, value);
        }
    }
    push_tag(&mut body, "SR#SITEID", fields.site_id);
    body.push_str(
        "LSNRACTION=CREATE<br>;<br>\
         LSNRAPPLIESTO=SR<br>;<br>\
         SR#CLASS=SR<br>;<br>\
         SR#TICKETID=&AUTOKEY&<br>;<br>\
         #MAXIMO_EMAIL_END<br><br>",
    );
    body
}

pub struct TicketIntake {
    store: Arc<dyn PortalStore>,
    mailer: Arc<dyn Mailer>,
    support_mailbox: String,
    from_address: String,
    site_id: String,
}

impl TicketIntake {
    pub fn new(
        store: Arc<dyn PortalStore>,
        mailer: Arc<dyn Mailer>,
        support_mailbox: impl Into<String>,
        from_address: impl Into<String>,
        site_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            support_mailbox: support_mailbox.into(),
            from_address: from_address.into(),
            site_id: site_id.into(),
        }
    }

    /// Validates the submission, emails the listener and stores the ticket.
    /// Blocking: SMTP delivery happens on the calling thread.
    pub fn submit(&self, submitter: &User, submission: TicketSubmission) -> Result<Ticket, IntakeError> {
        let summary = submission.summary.trim();
        let description = submission.description.trim();
        let environment_name = submission.environment.trim();
        if summary.is_empty() {
            return Err(IntakeError::MissingField("summary"));
        }
        let summary_chars = summary.chars().count();
        if summary_chars > SUMMARY_MAX_CHARS {
            return Err(IntakeError::SummaryTooLong(summary_chars));
        }
        if description.is_empty() {
            return Err(IntakeError::MissingField("description"));
        }
        if environment_name.is_empty() {
            return Err(IntakeError::MissingField("environment"));
        }
        let priority = Priority::new(submission.priority)?;

        let environment = self
            .store
            .environment_by_name(submitter.id, environment_name)?
            .ok_or_else(|| IntakeError::UnknownEnvironment(environment_name.to_string()))?;
        let area = match submission.area.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(name) => Some(
                self.store
                    .area_by_name(submitter.id, name)?
                    .ok_or_else(|| IntakeError::UnknownArea(name.to_string()))?,
            ),
            None => None,
        };

        let html_body = listener_body(&ListenerFields {
            summary,
            description,
            asset_number: &environment.asset_number,
            priority,
            area: area.as_ref().map(|a| a.name.as_str()),
            location: submitter.location.as_deref(),
            affected_person: submitter.person_id.as_deref(),
            site_id: &self.site_id,
        });
        let reply_to = Some(submitter.email.clone()).filter(|e| !e.trim().is_empty());
        self.mailer.send(&OutboundEmail {
            subject: summary.to_string(),
            html_body,
            from: self.from_address.clone(),
            to: vec![self.support_mailbox.clone()],
            reply_to,
            attachment: submission.attachment,
        })?;

        let ticket = self
            .store
            .create_ticket(NewTicket {
                owner_id: submitter.id,
                summary: summary.to_string(),
                description: description.to_string(),
                priority: Some(priority),
                environment_id: Some(environment.id),
                area_id: area.map(|a| a.id),
            })
            .map_err(|e| {
                error!("listener email sent but ticket '{summary}' was not stored: {e}");
                e
            })?;
        info!("ticket_id={} submitted by user {}", ticket.id, submitter.id);
        Ok(ticket)
    }
}
