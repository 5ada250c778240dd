pub mod queue;
#[cfg(feature = "mail")]
pub mod smtp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub use queue::EmailQueue;
#[cfg(feature = "mail")]
pub use smtp::SmtpMailer;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to build email: {0}")]
    Build(String),
    #[error("failed to send email: {0}")]
    Transport(String),
    #[error("email queue is closed")]
    QueueClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub subject: String,
    pub html_body: String,
    pub from: String,
    pub to: Vec<String>,
    pub reply_to: Option<String>,
    pub attachment: Option<EmailAttachment>,
}

/// Delivers one email synchronously.
pub trait Mailer: Send + Sync {
    fn send(&self, email: &OutboundEmail) -> Result<(), EmailError>;
}

/// Keeps every email it is handed. Used by tests and local runs without SMTP.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `send` fail with a transport error.
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, email: &OutboundEmail) -> Result<(), EmailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmailError::Transport("relay refused the message".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| EmailError::Transport("recorder poisoned".to_string()))?
            .push(email.clone());
        Ok(())
    }
}
