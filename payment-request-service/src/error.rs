//! Domain errors for payment request operations.
//!
//! | PaymentRequestError | gRPC Status |
//! |---------------------|-------------|
//! | `SelectionEmpty`, `NoEligibleRecords`, `InvalidTransition` | `FAILED_PRECONDITION` |
//! | `RequestNotFound` | `NOT_FOUND` |
//! | `OperationInFlight` | `ABORTED` |
//! | `InvalidFilter` | `INVALID_ARGUMENT` |
//! | `Persistence` (timed out) | `UNAVAILABLE` |
//! | `Persistence` | mapped from the wrapped `AppError` |
//! | `MalformedLedgerResponse`, `ExportGeneration` | `INTERNAL` |

use crate::models::RequestStatus;
use service_core::error::AppError;
use service_core::grpc::IntoStatus;
use thiserror::Error;
use tonic::Status;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PaymentRequestError {
    #[error("No records selected")]
    SelectionEmpty,

    #[error("None of the selected records has a payable partner cost")]
    NoEligibleRecords,

    #[error("Ledger operation failed: {source}")]
    Persistence {
        #[source]
        source: AppError,
        timed_out: bool,
    },

    #[error("Export generation failed: {0}")]
    ExportGeneration(anyhow::Error),

    #[error("Cannot move payment request from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Payment request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("Malformed ledger response: {0}")]
    MalformedLedgerResponse(String),

    #[error("Another payment request submission is in progress")]
    OperationInFlight,

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

impl PaymentRequestError {
    /// Label used for the error counter.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::SelectionEmpty => "selection_empty",
            Self::NoEligibleRecords => "no_eligible_records",
            Self::Persistence {
                timed_out: true, ..
            } => "ledger_timeout",
            Self::Persistence { .. } => "persistence",
            Self::ExportGeneration(_) => "export_generation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::RequestNotFound(_) => "request_not_found",
            Self::MalformedLedgerResponse(_) => "malformed_ledger_response",
            Self::OperationInFlight => "operation_in_flight",
            Self::InvalidFilter(_) => "invalid_filter",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Persistence {
                timed_out: true,
                ..
            }
        )
    }
}

impl From<AppError> for PaymentRequestError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ValidationError(e) => Self::InvalidFilter(e.to_string()),
            AppError::BadRequest(e) => Self::InvalidFilter(e.to_string()),
            other => Self::Persistence {
                source: other,
                timed_out: false,
            },
        }
    }
}

impl From<PaymentRequestError> for Status {
    fn from(err: PaymentRequestError) -> Self {
        match err {
            PaymentRequestError::SelectionEmpty
            | PaymentRequestError::NoEligibleRecords
            | PaymentRequestError::InvalidTransition { .. } => {
                Status::failed_precondition(err.to_string())
            }
            PaymentRequestError::RequestNotFound(_) => Status::not_found(err.to_string()),
            PaymentRequestError::OperationInFlight => Status::aborted(err.to_string()),
            PaymentRequestError::InvalidFilter(_) => Status::invalid_argument(err.to_string()),
            PaymentRequestError::Persistence {
                source,
                timed_out: true,
            } => {
                tracing::warn!(error = %source, "Ledger operation timed out");
                Status::unavailable("Ledger operation timed out; check for the submitted request before retrying")
            }
            PaymentRequestError::Persistence { source, .. } => source.into_status(),
            PaymentRequestError::MalformedLedgerResponse(msg) => {
                tracing::error!(error = %msg, "Malformed ledger response");
                Status::internal("Malformed ledger response")
            }
            PaymentRequestError::ExportGeneration(e) => {
                tracing::error!(error = %e, "Export generation failed");
                Status::internal("Export generation failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (PaymentRequestError::SelectionEmpty, Code::FailedPrecondition),
            (PaymentRequestError::NoEligibleRecords, Code::FailedPrecondition),
            (
                PaymentRequestError::InvalidTransition {
                    from: RequestStatus::Paid,
                    to: RequestStatus::Cancelled,
                },
                Code::FailedPrecondition,
            ),
            (
                PaymentRequestError::RequestNotFound(Uuid::nil()),
                Code::NotFound,
            ),
            (PaymentRequestError::OperationInFlight, Code::Aborted),
            (
                PaymentRequestError::InvalidFilter("bad".to_string()),
                Code::InvalidArgument,
            ),
            (
                PaymentRequestError::Persistence {
                    source: AppError::DatabaseError(anyhow::anyhow!("deadline")),
                    timed_out: true,
                },
                Code::Unavailable,
            ),
            (
                PaymentRequestError::Persistence {
                    source: AppError::DatabaseError(anyhow::anyhow!("boom")),
                    timed_out: false,
                },
                Code::Internal,
            ),
            (
                PaymentRequestError::MalformedLedgerResponse("level".to_string()),
                Code::Internal,
            ),
        ];

        for (err, code) in cases {
            let status: Status = err.into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_bad_request_becomes_invalid_filter() {
        let err: PaymentRequestError = AppError::BadRequest(anyhow::anyhow!("dates")).into();
        assert!(matches!(err, PaymentRequestError::InvalidFilter(_)));

        let err: PaymentRequestError = AppError::DatabaseError(anyhow::anyhow!("down")).into();
        assert!(matches!(
            err,
            PaymentRequestError::Persistence {
                timed_out: false,
                ..
            }
        ));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_transition_message_names_states() {
        let err = PaymentRequestError::InvalidTransition {
            from: RequestStatus::Paid,
            to: RequestStatus::Rejected,
        };
        assert_eq!(
            err.to_string(),
            "Cannot move payment request from Paid to Rejected"
        );
    }
}
