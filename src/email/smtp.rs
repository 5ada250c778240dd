use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::debug;
use std::fmt;

use super::{EmailError, Mailer, OutboundEmail};
use crate::core::config::EmailConfig;

pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer").finish_non_exhaustive()
    }
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self, EmailError> {
        let transport = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => SmtpTransport::relay(&config.smtp_server)
                .map_err(|e| EmailError::Transport(format!("SMTP relay error: {e}")))?
                .port(config.smtp_port)
                .credentials(Credentials::new(user.clone(), pass.clone()))
                .build(),
            _ => SmtpTransport::builder_dangerous(&config.smtp_server)
                .port(config.smtp_port)
                .build(),
        };
        Ok(Self { transport })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, EmailError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| EmailError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn build_message(email: &OutboundEmail) -> Result<Message, EmailError> {
    let mut builder = Message::builder()
        .from(mailbox(&email.from)?)
        .subject(email.subject.clone());
    for to in &email.to {
        builder = builder.to(mailbox(to)?);
    }
    if let Some(reply_to) = &email.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }

    let html = SinglePart::builder()
        .header(ContentType::TEXT_HTML)
        .body(email.html_body.clone());

    let message = match &email.attachment {
        Some(attachment) => {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                EmailError::Build(format!("attachment content type {:?}: {e}", attachment.content_type))
            })?;
            builder.multipart(
                MultiPart::mixed().singlepart(html).singlepart(
                    Attachment::new(attachment.file_name.clone())
                        .body(attachment.bytes.clone(), content_type),
                ),
            )
        }
        None => builder.singlepart(html),
    };
    message.map_err(|e| EmailError::Build(e.to_string()))
}

impl Mailer for SmtpMailer {
    fn send(&self, email: &OutboundEmail) -> Result<(), EmailError> {
        let message = build_message(email)?;
        self.transport
            .send(&message)
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        debug!("email '{}' sent to {}", email.subject, email.to.join(", "));
        Ok(())
    }
}
