use log::{error, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EmailError, Mailer, OutboundEmail};

enum Mode {
    Inline(Arc<dyn Mailer>),
    Background {
        sender: Mutex<Option<mpsc::UnboundedSender<OutboundEmail>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Hands emails to a [`Mailer`] either on the caller's thread or through a
/// background worker. Background delivery has no retry and no guarantee:
/// failures are logged and dropped.
pub struct EmailQueue {
    mode: Mode,
}

impl EmailQueue {
    /// Sends on the caller's thread; `submit` reports delivery errors.
    pub fn inline(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mode: Mode::Inline(mailer),
        }
    }

    /// Starts a worker on the current tokio runtime that sends each queued
    /// email from a blocking task.
    pub fn spawn(mailer: Arc<dyn Mailer>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<OutboundEmail>();
        let worker = tokio::spawn(async move {
            while let Some(email) = receiver.recv().await {
                let mailer = Arc::clone(&mailer);
                let subject = email.subject.clone();
                match tokio::task::spawn_blocking(move || mailer.send(&email)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("background email '{subject}' failed: {e}"),
                    Err(e) => error!("background email '{subject}' task panicked: {e}"),
                }
            }
        });
        Self {
            mode: Mode::Background {
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
            },
        }
    }

    pub fn submit(&self, email: OutboundEmail) -> Result<(), EmailError> {
        match &self.mode {
            Mode::Inline(mailer) => mailer.send(&email),
            Mode::Background { sender, .. } => {
                let guard = sender.lock().map_err(|_| EmailError::QueueClosed)?;
                guard
                    .as_ref()
                    .ok_or(EmailError::QueueClosed)?
                    .send(email)
                    .map_err(|_| EmailError::QueueClosed)
            }
        }
    }

    /// Stops accepting emails and waits until the worker has drained what
    /// was already queued.
    pub async fn shutdown(&self) {
        let Mode::Background { sender, worker } = &self.mode else {
            return;
        };
        if let Ok(mut sender) = sender.lock() {
            sender.take();
        }
        let handle = worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("email worker ended abnormally: {e}");
            }
        }
    }
}
