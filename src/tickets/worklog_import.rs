//! Imports remote worklogs into the local ticket conversation.

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::remote::{RemoteTicketing, RemoteWorklog};
use super::{JobLockGuard, NewInteraction, PortalStore, Ticket};

pub const JOB_NAME: &str = "worklog_import";
pub const DEFAULT_AUTHOR: &str = "SUPPORT";

static TAG: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").ok());
static LINE_BREAK: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</li>").ok());
static NUMERIC_ENTITY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").ok());
static BLANK_LINES: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\n[ \t]*\n(\s*\n)+").ok());

fn replace_all(re: &Lazy<Option<Regex>>, text: &str, with: &str) -> String {
    match re.as_ref() {
        Some(re) => re.replace_all(text, with).into_owned(),
        None => text.to_string(),
    }
}

fn decode_entities(text: &str) -> String {
    let text = match NUMERIC_ENTITY.as_ref() {
        Some(re) => re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let raw = &caps[1];
                let code = match raw.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => raw.parse::<u32>().ok(),
                };
                code.and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        None => text.to_string(),
    };
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Plain text of a worklog field: markup removed, entities decoded.
pub fn clean_html(raw: &str) -> String {
    let text = replace_all(&LINE_BREAK, raw, "\n");
    let text = replace_all(&TAG, &text, "");
    let text = decode_entities(&text).replace("\r\n", "\n");
    let text = replace_all(&BLANK_LINES, &text, "\n\n");
    text.trim().to_string()
}

/// Text to import: the long description when it has content, else the short one.
pub fn worklog_text(worklog: &RemoteWorklog) -> String {
    let long = clean_html(&worklog.long_description);
    if long.is_empty() {
        clean_html(&worklog.description)
    } else {
        long
    }
}

pub fn message_body(author: &str, text: &str) -> String {
    let author = match author.trim() {
        "" => DEFAULT_AUTHOR,
        name => name,
    };
    format!("📋 [Remote log - {author}]\n\n{text}")
}

/// Parses the backend's timestamps, with or without an offset.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketImportCount {
    pub ticket_id: i64,
    pub external_id: String,
    pub imported: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorklogImportReport {
    pub tickets_scanned: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub empty: usize,
    pub failed_tickets: usize,
    pub write_failures: usize,
    /// Tickets that received at least one new interaction.
    pub per_ticket: Vec<TicketImportCount>,
    pub abort_reason: Option<String>,
}

impl WorklogImportReport {
    pub fn aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}

impl fmt::Display for WorklogImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.abort_reason {
            return write!(f, "worklog import aborted: {reason}");
        }
        write!(
            f,
            "worklog import finished: total imported {} from {} tickets \
             (duplicates={} empty={} failed_tickets={} write_failures={})",
            self.imported,
            self.tickets_scanned,
            self.duplicates,
            self.empty,
            self.failed_tickets,
            self.write_failures
        )
    }
}

pub struct WorklogImporter {
    store: Arc<dyn PortalStore>,
    remote: Arc<dyn RemoteTicketing>,
    system_user_email: String,
}

impl WorklogImporter {
    pub fn new(
        store: Arc<dyn PortalStore>,
        remote: Arc<dyn RemoteTicketing>,
        system_user_email: impl Into<String>,
    ) -> Self {
        Self {
            store,
            remote,
            system_user_email: system_user_email.into(),
        }
    }

    pub async fn run(&self) -> WorklogImportReport {
        let mut report = WorklogImportReport::default();
        let lock = match JobLockGuard::acquire(Arc::clone(&self.store), JOB_NAME) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                report.abort_reason = Some("another run holds the job lock".to_string());
                warn!("worklog import skipped: another run holds the job lock");
                return report;
            }
            Err(e) => {
                report.abort_reason = Some(format!("could not take the job lock: {e}"));
                error!("worklog import aborted: {e}");
                return report;
            }
        };

        self.run_locked(&mut report).await;
        drop(lock);
        info!("{report}");
        report
    }

    async fn run_locked(&self, report: &mut WorklogImportReport) {
        let system_user = match self.store.system_user(&self.system_user_email) {
            Ok(user) => user,
            Err(e) => {
                report.abort_reason = Some(format!("system user unavailable: {e}"));
                return;
            }
        };
        let tickets = match self.store.linked_tickets() {
            Ok(tickets) => tickets,
            Err(e) => {
                report.abort_reason = Some(format!("could not load linked tickets: {e}"));
                return;
            }
        };

        for ticket in tickets {
            let Some(external_id) = ticket.external_id.clone() else {
                continue;
            };
            report.tickets_scanned += 1;
            let worklogs = match self.remote.fetch_worklogs(&external_id).await {
                Ok(worklogs) => worklogs,
                Err(e) => {
                    report.failed_tickets += 1;
                    warn!("ticket_id={} external_id={external_id} worklogs: {e}", ticket.id);
                    continue;
                }
            };

            let imported = self.import_ticket(&ticket, system_user.id, &worklogs, report);
            if imported > 0 {
                info!("ticket #{external_id}: {imported} new worklogs");
                report.per_ticket.push(TicketImportCount {
                    ticket_id: ticket.id,
                    external_id,
                    imported,
                });
            }
        }
    }

    fn import_ticket(
        &self,
        ticket: &Ticket,
        author_id: i64,
        worklogs: &[RemoteWorklog],
        report: &mut WorklogImportReport,
    ) -> usize {
        let mut imported = 0;
        for worklog in worklogs {
            let text = worklog_text(worklog);
            if text.is_empty() {
                report.empty += 1;
                continue;
            }
            let body = message_body(&worklog.created_by, &text);

            match self.store.interaction_exists(ticket.id, &body) {
                Ok(true) => {
                    report.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    report.write_failures += 1;
                    error!("ticket_id={} duplicate check failed: {e}", ticket.id);
                    continue;
                }
            }

            let created_at = parse_remote_timestamp(&worklog.created_at);
            if created_at.is_none() && !worklog.created_at.trim().is_empty() {
                warn!(
                    "ticket_id={} worklog {} has unreadable createdate {:?}",
                    ticket.id, worklog.record_key, worklog.created_at
                );
            }
            match self.store.add_interaction(NewInteraction {
                ticket_id: ticket.id,
                author_id,
                body,
                attachment_name: None,
                created_at,
            }) {
                Ok(_) => imported += 1,
                Err(e) => {
                    report.write_failures += 1;
                    error!("ticket_id={} worklog insert failed: {e}", ticket.id);
                }
            }
        }
        report.imported += imported;
        imported
    }
}
