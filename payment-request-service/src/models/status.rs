//! Payment status state machines for records and request batches.

use crate::grpc::proto;
use serde::{Deserialize, Serialize};

/// Payment status of a logistics record (and of its partner cost rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordPaymentStatus {
    Unpaid,
    Processing,
    Paid,
}

/// Allowed record transitions. There is no `Paid -> Unpaid` edge; cancelling
/// a payment goes back through `Processing`.
const RECORD_TRANSITIONS: &[(RecordPaymentStatus, RecordPaymentStatus)] = &[
    (RecordPaymentStatus::Unpaid, RecordPaymentStatus::Processing),
    (RecordPaymentStatus::Processing, RecordPaymentStatus::Paid),
    (RecordPaymentStatus::Processing, RecordPaymentStatus::Unpaid),
    (RecordPaymentStatus::Paid, RecordPaymentStatus::Processing),
];

impl RecordPaymentStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "Unpaid",
            Self::Processing => "Processing",
            Self::Paid => "Paid",
        }
    }

    /// Parse the database representation. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Unpaid" => Some(Self::Unpaid),
            "Processing" => Some(Self::Processing),
            "Paid" => Some(Self::Paid),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        RECORD_TRANSITIONS.contains(&(self, next))
    }
}

impl std::fmt::Display for RecordPaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<RecordPaymentStatus> for proto::RecordPaymentStatus {
    fn from(s: RecordPaymentStatus) -> Self {
        match s {
            RecordPaymentStatus::Unpaid => Self::Unpaid,
            RecordPaymentStatus::Processing => Self::Processing,
            RecordPaymentStatus::Paid => Self::Paid,
        }
    }
}

/// Status of a payment request batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
    Cancelled,
}

const REQUEST_TRANSITIONS: &[(RequestStatus, RequestStatus)] = &[
    (RequestStatus::Pending, RequestStatus::Approved),
    (RequestStatus::Approved, RequestStatus::Paid),
    (RequestStatus::Pending, RequestStatus::Rejected),
    (RequestStatus::Approved, RequestStatus::Rejected),
    (RequestStatus::Pending, RequestStatus::Cancelled),
    (RequestStatus::Approved, RequestStatus::Cancelled),
    // Cancel payment.
    (RequestStatus::Paid, RequestStatus::Approved),
    // Approval rollback.
    (RequestStatus::Approved, RequestStatus::Pending),
];

impl RequestStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Paid => "Paid",
            Self::Rejected => "Rejected",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Approved" => Some(Self::Approved),
            "Paid" => Some(Self::Paid),
            "Rejected" => Some(Self::Rejected),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Convert from proto enum value. `Unspecified` maps to `None`.
    pub fn from_proto(value: i32) -> Option<Self> {
        match proto::RequestStatus::try_from(value).ok()? {
            proto::RequestStatus::Unspecified => None,
            proto::RequestStatus::Pending => Some(Self::Pending),
            proto::RequestStatus::Approved => Some(Self::Approved),
            proto::RequestStatus::Paid => Some(Self::Paid),
            proto::RequestStatus::Rejected => Some(Self::Rejected),
            proto::RequestStatus::Cancelled => Some(Self::Cancelled),
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        REQUEST_TRANSITIONS.contains(&(self, next))
    }

    /// Rejected and cancelled batches no longer own their records.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Rejected | Self::Cancelled)
    }

    /// Payment status every record covered by a batch in this state must have.
    pub fn covered_record_status(self) -> RecordPaymentStatus {
        match self {
            Self::Pending | Self::Approved => RecordPaymentStatus::Processing,
            Self::Paid => RecordPaymentStatus::Paid,
            Self::Rejected | Self::Cancelled => RecordPaymentStatus::Unpaid,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<RequestStatus> for proto::RequestStatus {
    fn from(s: RequestStatus) -> Self {
        match s {
            RequestStatus::Pending => Self::Pending,
            RequestStatus::Approved => Self::Approved,
            RequestStatus::Paid => Self::Paid,
            RequestStatus::Rejected => Self::Rejected,
            RequestStatus::Cancelled => Self::Cancelled,
        }
    }
}
