//! Periodic reconciliation of local tickets with the remote backend.

use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::matching::{CandidateSet, MatchKind};
use super::remote::{RemoteTicketRecord, RemoteTicketing};
use super::{JobLockGuard, PortalStore, StatusTransition, TicketStatus, TicketUpdate};
use crate::notifications::NotificationDispatcher;

pub const JOB_NAME: &str = "remote_reconciliation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RunPhase {
    #[default]
    Start,
    Fetched,
    Matched,
    Persisted,
    Reported,
    Aborted,
}

/// One ticket row that was actually rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketChange {
    pub ticket_id: i64,
    pub external_id: String,
    pub newly_linked: bool,
    pub transition: Option<StatusTransition>,
}

impl fmt::Display for TicketChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket {} <- {}", self.ticket_id, self.external_id)?;
        if self.newly_linked {
            f.write_str(" linked")?;
        }
        if let Some(transition) = &self.transition {
            write!(f, " {} -> {}", transition.from, transition.to)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub phase: RunPhase,
    pub local_candidates: usize,
    pub fetched: usize,
    /// Remote records without an id.
    pub skipped: usize,
    pub matched: usize,
    pub newly_linked: usize,
    pub status_changed: usize,
    pub unrecognized_statuses: usize,
    pub write_failures: usize,
    pub notifications: usize,
    pub emails: usize,
    pub changes: Vec<TicketChange>,
    pub abort_reason: Option<String>,
}

impl ReconciliationReport {
    pub fn aborted(&self) -> bool {
        self.phase == RunPhase::Aborted
    }

    fn abort(&mut self, reason: String) {
        error!("reconciliation aborted: {reason}");
        self.phase = RunPhase::Aborted;
        self.abort_reason = Some(reason);
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.abort_reason {
            return write!(f, "reconciliation aborted: {reason}");
        }
        write!(
            f,
            "reconciliation finished: fetched={} skipped={} matched={} newly_linked={} \
             status_changed={} unrecognized_statuses={} write_failures={}",
            self.fetched,
            self.skipped,
            self.matched,
            self.newly_linked,
            self.status_changed,
            self.unrecognized_statuses,
            self.write_failures
        )
    }
}

struct PlannedUpdate {
    ticket_id: i64,
    external_id: String,
    kind: MatchKind,
    update: TicketUpdate,
}

pub struct ReconciliationJob {
    store: Arc<dyn PortalStore>,
    remote: Arc<dyn RemoteTicketing>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn PortalStore>,
        remote: Arc<dyn RemoteTicketing>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            remote,
            dispatcher,
        }
    }

    pub async fn run(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        let _lock = match JobLockGuard::acquire(Arc::clone(&self.store), JOB_NAME) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                report.abort("another run holds the job lock".to_string());
                return report;
            }
            Err(e) => {
                report.abort(format!("could not take the job lock: {e}"));
                return report;
            }
        };

        self.run_locked(&mut report).await;
        report
    }

    async fn run_locked(&self, report: &mut ReconciliationReport) {
        let tickets = match self.store.open_tickets() {
            Ok(tickets) => tickets,
            Err(e) => {
                report.abort(format!("could not load local tickets: {e}"));
                return;
            }
        };
        let mut candidates = CandidateSet::from_tickets(&tickets);
        report.local_candidates = candidates.linked_count() + candidates.unlinked_count();
        info!(
            "reconciliation start: linked={} unlinked={}",
            candidates.linked_count(),
            candidates.unlinked_count()
        );

        let records = match self.remote.fetch_all().await {
            Ok(records) => records,
            Err(e) => {
                report.abort(e.to_string());
                return;
            }
        };
        report.fetched = records.len();
        report.phase = RunPhase::Fetched;

        let plan = self.plan(&records, &mut candidates, report);
        report.matched = plan.len();
        report.phase = RunPhase::Matched;

        for planned in plan {
            self.persist(planned, report);
        }
        report.phase = RunPhase::Persisted;

        info!("{report}");
        report.phase = RunPhase::Reported;
    }

    fn plan(
        &self,
        records: &[RemoteTicketRecord],
        candidates: &mut CandidateSet,
        report: &mut ReconciliationReport,
    ) -> Vec<PlannedUpdate> {
        let mut plan = Vec::new();
        for record in records {
            let external_id = record.external_id.trim();
            if external_id.is_empty() {
                report.skipped += 1;
                continue;
            }

            let links = candidates.match_record(record);
            if links.is_empty() {
                continue;
            }

            let status = parse_remote_status(external_id, &record.status);
            if status.is_none() && !record.status.trim().is_empty() {
                report.unrecognized_statuses += 1;
            }

            for link in links {
                plan.push(PlannedUpdate {
                    ticket_id: link.ticket_id,
                    external_id: external_id.to_string(),
                    kind: link.kind,
                    update: TicketUpdate {
                        external_id: (link.kind != MatchKind::Strong)
                            .then(|| external_id.to_string()),
                        status,
                    },
                });
            }
        }
        plan
    }

    fn persist(&self, planned: PlannedUpdate, report: &mut ReconciliationReport) {
        let PlannedUpdate {
            ticket_id,
            external_id,
            kind,
            update,
        } = planned;

        let outcome = match self.store.apply_update(ticket_id, &update) {
            Ok(outcome) => outcome,
            Err(e) => {
                report.write_failures += 1;
                error!("ticket_id={ticket_id} external_id={external_id} write failed: {e}");
                return;
            }
        };
        if !outcome.changed() {
            return;
        }

        if outcome.linked {
            report.newly_linked += 1;
            info!("ticket_id={ticket_id} linked to external_id={external_id} ({kind:?})");
        }
        if let Some(transition) = outcome.transition {
            report.status_changed += 1;
            info!(
                "ticket_id={ticket_id} external_id={external_id} status {} -> {}",
                transition.from, transition.to
            );
            let sent = self.dispatcher.status_changed(&outcome.ticket, &transition);
            report.notifications += sent.notifications;
            report.emails += sent.emails;
        }
        report.changes.push(TicketChange {
            ticket_id,
            external_id,
            newly_linked: outcome.linked,
            transition: outcome.transition,
        });
    }
}

fn parse_remote_status(external_id: &str, raw: &str) -> Option<TicketStatus> {
    let code = raw.trim();
    if code.is_empty() {
        return None;
    }
    match code.parse::<TicketStatus>() {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("external_id={external_id} {e}, status left unchanged");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{EmailQueue, RecordingMailer};
    use crate::notifications::NotificationSettings;
    use crate::tickets::memory_store::MemoryStore;
    use crate::tickets::remote::{RemoteError, RemoteWorklog, WorklogChannel};
    use crate::tickets::{JobLocks, TicketStore};
    use async_trait::async_trait;

    struct StaticRemote {
        records: Option<Vec<RemoteTicketRecord>>,
    }

    #[async_trait]
    impl RemoteTicketing for StaticRemote {
        async fn fetch_all(&self) -> Result<Vec<RemoteTicketRecord>, RemoteError> {
            self.records
                .clone()
                .ok_or_else(|| RemoteError::Unavailable("connection refused".to_string()))
        }

        async fn fetch_worklogs(&self, _: &str) -> Result<Vec<RemoteWorklog>, RemoteError> {
            Ok(Vec::new())
        }

        async fn submit_interaction(&self, _: &str, _: &str, _: WorklogChannel, _: &str) -> bool {
            true
        }
    }

    struct HangingRemote;

    #[async_trait]
    impl RemoteTicketing for HangingRemote {
        async fn fetch_all(&self) -> Result<Vec<RemoteTicketRecord>, RemoteError> {
            std::future::pending::<Result<Vec<RemoteTicketRecord>, RemoteError>>().await
        }

        async fn fetch_worklogs(&self, _: &str) -> Result<Vec<RemoteWorklog>, RemoteError> {
            Ok(Vec::new())
        }

        async fn submit_interaction(&self, _: &str, _: &str, _: WorklogChannel, _: &str) -> bool {
            true
        }
    }

    fn record(id: &str, status: &str, description: &str) -> RemoteTicketRecord {
        RemoteTicketRecord {
            external_id: id.to_string(),
            status: status.to_string(),
            description: description.to_string(),
        }
    }

    fn job(
        store: &Arc<MemoryStore>,
        records: Option<Vec<RemoteTicketRecord>>,
    ) -> (ReconciliationJob, Arc<RecordingMailer>) {
        job_with_remote(store, Arc::new(StaticRemote { records }))
    }

    fn job_with_remote(
        store: &Arc<MemoryStore>,
        remote: Arc<dyn RemoteTicketing>,
    ) -> (ReconciliationJob, Arc<RecordingMailer>) {
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
        let job = ReconciliationJob::new(store.clone(), remote, Arc::new(dispatcher));
        (job, mailer)
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_without_writes() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("client", "client@example.com", false, &[]);
        store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);

        let (job, _) = job(&store, None);
        let report = job.run().await;
        assert!(report.aborted());
        assert_eq!(store.ticket_writes(), 0);
        assert!(!store.is_job_locked(JOB_NAME));
    }

    #[tokio::test]
    async fn test_held_lock_aborts_run() {
        let store = Arc::new(MemoryStore::new());
        assert!(store.try_lock_job(JOB_NAME).unwrap());
        let (job, _) = job(&store, Some(Vec::new()));
        let report = job.run().await;
        assert!(report.aborted());
        assert!(report.abort_reason.unwrap().contains("lock"));
    }

    #[tokio::test]
    async fn test_aborted_run_releases_job_lock() {
        let store = Arc::new(MemoryStore::new());
        let (job, _) = job_with_remote(&store, Arc::new(HangingRemote));
        let job = Arc::new(job);

        let running = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.run().await }
        });
        while !store.is_job_locked(JOB_NAME) {
            tokio::task::yield_now().await;
        }
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());
        assert!(!store.is_job_locked(JOB_NAME));
    }

    #[tokio::test]
    async fn test_unrecognized_status_keeps_local_status_but_links() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("client", "client@example.com", false, &[]);
        let ticket = store.seed_ticket(owner.id, "printer jam", None, TicketStatus::Queued);

        let (job, mailer) = job(&store, Some(vec![record("100", "WAPPR", "printer jam")]));
        let report = job.run().await;
        assert_eq!(report.newly_linked, 1);
        assert_eq!(report.status_changed, 0);
        assert_eq!(report.unrecognized_statuses, 1);

        let stored = store.ticket(ticket.id).unwrap().unwrap();
        assert_eq!(stored.external_id.as_deref(), Some("100"));
        assert_eq!(stored.status, TicketStatus::Queued);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_batch() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("client", "client@example.com", false, &[]);
        let broken = store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);
        let fine = store.seed_ticket(owner.id, "vpn is down", None, TicketStatus::New);
        store.fail_writes_for(broken.id);

        let (job, _) = job(
            &store,
            Some(vec![
                record("100", "INPROG", "printer jam"),
                record("200", "INPROG", "vpn is down"),
            ]),
        );
        let report = job.run().await;
        assert_eq!(report.phase, RunPhase::Reported);
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.newly_linked, 1);
        let stored = store.ticket(fine.id).unwrap().unwrap();
        assert_eq!(stored.external_id.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn test_records_without_id_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("client", "client@example.com", false, &[]);
        store.seed_ticket(owner.id, "printer jam", None, TicketStatus::New);

        let (job, _) = job(&store, Some(vec![record("", "INPROG", "printer jam")]));
        let report = job.run().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.matched, 0);
        assert_eq!(store.ticket_writes(), 0);
    }
}
