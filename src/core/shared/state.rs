use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::email::{EmailQueue, Mailer};
use crate::notifications::{NotificationDispatcher, NotificationSettings};
use crate::tickets::intake::TicketIntake;
use crate::tickets::reconcile::ReconciliationJob;
use crate::tickets::remote::RemoteTicketing;
use crate::tickets::service::TicketService;
use crate::tickets::worklog_import::WorklogImporter;
use crate::tickets::PortalStore;

/// Shared handles wired once at startup and cloned into handlers and jobs.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn PortalStore>,
    pub remote: Arc<dyn RemoteTicketing>,
    pub email: Arc<EmailQueue>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub tickets: Arc<TicketService>,
    pub intake: Arc<TicketIntake>,
}

impl AppState {
    /// `mailer` is used directly by intake, which must know whether the
    /// listener email went out; everything else goes through `email`.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn PortalStore>,
        remote: Arc<dyn RemoteTicketing>,
        mailer: Arc<dyn Mailer>,
        email: Arc<EmailQueue>,
    ) -> Self {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&email),
            NotificationSettings::from_config(&config),
        ));
        let tickets = Arc::new(TicketService::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&dispatcher),
            config.support.inbox_limit,
        ));
        let intake = Arc::new(TicketIntake::new(
            Arc::clone(&store),
            mailer,
            config.email.support_mailbox.clone(),
            config.email.from_address.clone(),
            config.remote.site_id.clone(),
        ));
        Self {
            config,
            store,
            remote,
            email,
            dispatcher,
            tickets,
            intake,
        }
    }

    pub fn reconciliation_job(&self) -> ReconciliationJob {
        ReconciliationJob::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            Arc::clone(&self.dispatcher),
        )
    }

    pub fn worklog_importer(&self) -> WorklogImporter {
        WorklogImporter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            self.config.remote.system_user_email.clone(),
        )
    }
}
