use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status codes shared with the remote ticketing backend.
///
/// The string form of every variant is the exact code used on the wire and in
/// the `tickets.status` column. `New` is also the local default for tickets
/// that have not been picked up remotely yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TicketStatus {
    New,
    Queued,
    InProgress,
    Pending,
    Approved,
    ApprovedFml,
    ApprovedLm,
    Resolved,
    Closed,
    Cancelled,
    Rejected,
    Draft,
    HistoryEdit,
    ClientTest,
    ClientTestOk,
    ClientTestFailed,
    ProductionOk,
    AwaitingMeeting,
    CriticalFailure,
    Rollback,
    Training,
    Documentation,
    SlaHold,
}

/// A status code the remote system sent that is not part of the enumeration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized ticket status {0:?}")]
pub struct UnrecognizedStatus(pub String);

impl TicketStatus {
    pub const ALL: [TicketStatus; 23] = [
        Self::New,
        Self::Queued,
        Self::InProgress,
        Self::Pending,
        Self::Approved,
        Self::ApprovedFml,
        Self::ApprovedLm,
        Self::Resolved,
        Self::Closed,
        Self::Cancelled,
        Self::Rejected,
        Self::Draft,
        Self::HistoryEdit,
        Self::ClientTest,
        Self::ClientTestOk,
        Self::ClientTestFailed,
        Self::ProductionOk,
        Self::AwaitingMeeting,
        Self::CriticalFailure,
        Self::Rollback,
        Self::Training,
        Self::Documentation,
        Self::SlaHold,
    ];

    /// Statuses that take a ticket out of reconciliation for good.
    pub const TERMINAL: [TicketStatus; 2] = [Self::Closed, Self::Cancelled];

    pub fn code(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::InProgress => "INPROG",
            Self::Pending => "PENDING",
            Self::Approved => "APPR",
            Self::ApprovedFml => "APPFML",
            Self::ApprovedLm => "APPLM",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Draft => "DRAFT",
            Self::HistoryEdit => "HISTEDIT",
            Self::ClientTest => "TSTCLI",
            Self::ClientTestOk => "TSTCLIOK",
            Self::ClientTestFailed => "TSTCLIFAIL",
            Self::ProductionOk => "IMPPRODOK",
            Self::AwaitingMeeting => "AGREUN",
            Self::CriticalFailure => "CRITFAIL",
            Self::Rollback => "ROLLBACK",
            Self::Training => "TREINAMTO",
            Self::Documentation => "DOC",
            Self::SlaHold => "SLAHOLD",
        }
    }

    /// Human-readable label used in emails and notifications.
    pub fn label(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Queued => "Queued",
            Self::InProgress => "In progress",
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::ApprovedFml => "Approved (functional lead)",
            Self::ApprovedLm => "Approved (line manager)",
            Self::Resolved => "Resolved",
            Self::Closed => "Closed",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
            Self::Draft => "Draft",
            Self::HistoryEdit => "History edit",
            Self::ClientTest => "Client testing",
            Self::ClientTestOk => "Client test passed",
            Self::ClientTestFailed => "Client test failed",
            Self::ProductionOk => "Deployed to production",
            Self::AwaitingMeeting => "Awaiting meeting",
            Self::CriticalFailure => "Critical failure",
            Self::Rollback => "Rolled back",
            Self::Training => "Training",
            Self::Documentation => "Documentation",
            Self::SlaHold => "SLA on hold",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl Default for TicketStatus {
    fn default() -> Self {
        Self::New
    }
}

impl FromStr for TicketStatus {
    type Err = UnrecognizedStatus;

    /// Codes must match exactly; no trimming or case folding.
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.code() == code)
            .ok_or_else(|| UnrecognizedStatus(code.to_string()))
    }
}

impl TryFrom<String> for TicketStatus {
    type Error = UnrecognizedStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TicketStatus> for String {
    fn from(value: TicketStatus) -> Self {
        value.code().to_string()
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
