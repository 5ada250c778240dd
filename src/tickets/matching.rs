use std::collections::HashMap;

use super::remote::RemoteTicketRecord;
use super::Ticket;

/// A summary must be longer than this to match as a substring.
pub const PARTIAL_MATCH_MIN_CHARS: usize = 5;

pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    Strong,
    Exact,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub ticket_id: i64,
    pub kind: MatchKind,
}

/// Compares a normalized summary with a normalized remote description.
pub fn weak_match(summary_key: &str, description_key: &str) -> Option<MatchKind> {
    if summary_key.is_empty() {
        return None;
    }
    if summary_key == description_key {
        return Some(MatchKind::Exact);
    }
    if summary_key.chars().count() > PARTIAL_MATCH_MIN_CHARS
        && description_key.contains(summary_key)
    {
        return Some(MatchKind::Partial);
    }
    None
}

#[derive(Debug, Clone)]
struct PoolEntry {
    ticket_id: i64,
    summary_key: String,
}

/// Tickets eligible for matching during one run.
#[derive(Debug, Default)]
pub struct CandidateSet {
    linked: HashMap<String, Vec<i64>>,
    unlinked: Vec<PoolEntry>,
}

impl CandidateSet {
    /// Builds the run's pool. Tickets in a terminal status are left out.
    pub fn from_tickets<'a>(tickets: impl IntoIterator<Item = &'a Ticket>) -> Self {
        let mut set = Self::default();
        for ticket in tickets {
            if ticket.status.is_terminal() {
                continue;
            }
            match ticket.external_id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => set.linked.entry(id.to_string()).or_default().push(ticket.id),
                None => set.unlinked.push(PoolEntry {
                    ticket_id: ticket.id,
                    summary_key: normalize(&ticket.summary),
                }),
            }
        }
        set.unlinked.sort_by_key(|entry| entry.ticket_id);
        set
    }

    pub fn linked_count(&self) -> usize {
        self.linked.values().map(Vec::len).sum()
    }

    pub fn unlinked_count(&self) -> usize {
        self.unlinked.len()
    }

    /// Resolves the tickets `record` applies to. Weakly matched tickets are
    /// moved from the pool into the linked index under the record's id.
    pub fn match_record(&mut self, record: &RemoteTicketRecord) -> Vec<Link> {
        let external_id = record.external_id.trim();
        if external_id.is_empty() {
            return Vec::new();
        }

        if let Some(ids) = self.linked.get(external_id) {
            return ids
                .iter()
                .map(|&ticket_id| Link {
                    ticket_id,
                    kind: MatchKind::Strong,
                })
                .collect();
        }

        let description_key = normalize(&record.description);
        let mut links = Vec::new();
        self.unlinked.retain(|entry| {
            match weak_match(&entry.summary_key, &description_key) {
                Some(kind) => {
                    links.push(Link {
                        ticket_id: entry.ticket_id,
                        kind,
                    });
                    false
                }
                None => true,
            }
        });

        if !links.is_empty() {
            self.linked
                .entry(external_id.to_string())
                .or_default()
                .extend(links.iter().map(|link| link.ticket_id));
        }
        links
    }
}
