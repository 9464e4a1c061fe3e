use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::AuthError;
use crate::booking::BookingError;
use crate::models::ApiResponse;

/// Every handler error ends up here and is rendered as an `ApiResponse`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("slot is no longer available, refresh availability and retry")]
    SlotUnavailable,

    #[error("booking cannot move from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) | AppError::SlotUnavailable | AppError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::SlotUnavailable => ApiResponse::<()>::retryable_error(self.to_string()),
            AppError::Database(e) => {
                tracing::error!(error = %e, "database failure");
                ApiResponse::error("DB error")
            }
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal failure");
                ApiResponse::error("Internal error")
            }
            _ => ApiResponse::error(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::InvalidService => AppError::NotFound("service not found or inactive".into()),
            BookingError::InvalidDate(msg) | BookingError::Validation(msg) => AppError::Validation(msg),
            BookingError::SlotUnavailable => AppError::SlotUnavailable,
            BookingError::NotFound => AppError::NotFound("booking not found".into()),
            BookingError::NotOwner => AppError::Forbidden("booking belongs to another client".into()),
            BookingError::InvalidTransition { from, to } => AppError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            },
            BookingError::DoubleBookingDetected { first, second } => AppError::Conflict(format!(
                "bookings {first} and {second} overlap"
            )),
            BookingError::Database(e) => AppError::Database(e),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::Expired => {
                AppError::Unauthorized(err.to_string())
            }
            AuthError::BadCredentials => AppError::Unauthorized(err.to_string()),
            AuthError::AdminOnly => AppError::Forbidden(err.to_string()),
            AuthError::Hash(msg) => AppError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_unavailable_is_conflict() {
        assert_eq!(AppError::SlotUnavailable.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_booking_errors_map_to_http() {
        let e: AppError = BookingError::NotOwner.into();
        assert_eq!(e.status(), StatusCode::FORBIDDEN);

        let e: AppError = BookingError::InvalidDate("past".into()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);

        let e: AppError = BookingError::InvalidService.into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_auth_errors_map_to_http() {
        let e: AppError = AuthError::Expired.into();
        assert_eq!(e.status(), StatusCode::UNAUTHORIZED);

        let e: AppError = AuthError::AdminOnly.into();
        assert_eq!(e.status(), StatusCode::FORBIDDEN);
    }
}
