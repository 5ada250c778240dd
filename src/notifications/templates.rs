use crate::core::shared::models::User;
use crate::core::shared::utils::html_escape;
use crate::tickets::{StatusTransition, Ticket};

/// Query marker that sends support staff back to the queue view.
pub const QUEUE_ORIGIN: &str = "origin=queue";

pub fn ticket_link(base_url: &str, ticket_id: i64, for_support: bool) -> String {
    let base = base_url.trim_end_matches('/');
    if for_support {
        format!("{base}/tickets/{ticket_id}?{QUEUE_ORIGIN}")
    } else {
        format!("{base}/tickets/{ticket_id}")
    }
}

pub fn status_title(ticket: &Ticket) -> String {
    format!("Ticket #{} updated", ticket.reference())
}

pub fn status_preview(transition: &StatusTransition) -> String {
    format!("Status changed to {}", transition.to.label())
}

pub fn status_subject(ticket: &Ticket, transition: &StatusTransition) -> String {
    format!(
        "[Update] Ticket #{} status changed to {}",
        ticket.reference(),
        transition.to.label()
    )
}

pub fn status_email_html(
    owner: &User,
    ticket: &Ticket,
    transition: &StatusTransition,
    link: &str,
) -> String {
    format!(
        r#"Hello, {name}.<br><br>
The status of your ticket has been updated.<br><br>
<strong>Ticket:</strong> #{reference}<br>
<strong>Subject:</strong> {summary}<br>
<br>
<div style="border: 1px solid #ccc; padding: 15px; background-color: #f4f4f4;">
    <p><strong>Previous status:</strong> <span style="color: #666;">{from}</span></p>
    <p><strong>New status:</strong> <span style="color: #0f62fe; font-weight: bold;">{to}</span></p>
</div>
<br>
<a href="{link}">Open the ticket in the portal</a> for more details."#,
        name = html_escape(owner.display_name()),
        reference = html_escape(&ticket.reference()),
        summary = html_escape(&ticket.summary),
        from = transition.from.label(),
        to = transition.to.label(),
        link = html_escape(link),
    )
}

pub fn message_title(ticket: &Ticket) -> String {
    format!("New message on ticket #{}", ticket.reference())
}

pub fn message_subject_for_owner(ticket: &Ticket) -> String {
    format!("[Reply] Ticket #{}: {}", ticket.reference(), ticket.summary)
}

pub fn message_subject_for_support(ticket: &Ticket, author: &User) -> String {
    format!(
        "[New message] Ticket #{} from {}",
        ticket.reference(),
        author.full_name()
    )
}

pub fn message_email_html(ticket: &Ticket, author: &User, body: &str, link: &str) -> String {
    let body = html_escape(body).replace('\n', "<br>");
    format!(
        r#"<strong>{author}</strong> wrote on ticket #{reference} ({summary}):<br><br>
<div style="border-left: 3px solid #0f62fe; padding-left: 12px;">{body}</div>
<br>
<a href="{link}">Reply in the portal</a>"#,
        author = html_escape(&author.full_name()),
        reference = html_escape(&ticket.reference()),
        summary = html_escape(&ticket.summary),
        link = html_escape(link),
    )
}
