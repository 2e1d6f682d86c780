//! Error conversion from `AppError` to `tonic::Status`.
//!
//! | AppError | gRPC Status |
//! |----------|-------------|
//! | `ValidationError`, `BadRequest` | `INVALID_ARGUMENT` |
//! | `NotFound` | `NOT_FOUND` |
//! | `Conflict` | `ALREADY_EXISTS` |
//! | `ServiceUnavailable` | `UNAVAILABLE` |
//! | `InternalError`, `DatabaseError`, `ConfigError` | `INTERNAL` |

use tonic::Status;

use crate::error::AppError;

/// Extension trait for converting types into `tonic::Status`.
pub trait IntoStatus {
    /// Convert into a `tonic::Status`.
    fn into_status(self) -> Status;
}

impl IntoStatus for AppError {
    fn into_status(self) -> Status {
        match self {
            AppError::ValidationError(err) => {
                Status::invalid_argument(format!("Validation error: {}", err))
            }
            AppError::BadRequest(err) => Status::invalid_argument(err.to_string()),
            AppError::NotFound(err) => Status::not_found(err.to_string()),
            AppError::Conflict(err) => Status::already_exists(err.to_string()),
            AppError::InternalError(err) => {
                // Log the full error but don't expose it to clients
                tracing::error!(error = %err, "Internal error");
                Status::internal("Internal server error")
            }
            AppError::ServiceUnavailable => Status::unavailable("Service unavailable"),
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                Status::internal("Database error")
            }
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                Status::internal("Configuration error")
            }
        }
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.into_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_app_error_to_status() {
        let err = AppError::NotFound(anyhow::anyhow!("Payment request not found"));
        let status: Status = err.into();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("Payment request not found"));
    }

    #[test]
    fn test_database_error_is_not_leaked() {
        let err = AppError::DatabaseError(anyhow::anyhow!("relation does not exist"));
        let status = err.into_status();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Database error");
    }

    #[test]
    fn test_unavailable() {
        let status = AppError::ServiceUnavailable.into_status();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
