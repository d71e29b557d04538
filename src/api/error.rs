//! Structured API error responses with error codes
//!
//! This module provides consistent error handling across all API endpoints
//! with machine-readable error codes and human-readable messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    /// Request body is malformed
    InvalidRequestBody,
    /// Field value is invalid
    InvalidFieldValue,
    /// Payload hash does not match the payload body
    InvalidPayloadHash,

    // Geofence errors (2xxx)
    /// PDV has no registered coordinates; validation fails closed
    MissingReferenceLocation,

    // Resource errors (3xxx)
    /// PDV not found
    PdvNotFound,
    /// Entity not found
    EntityNotFound,

    // Sync errors (4xxx)
    /// Version conflict during commit; resubmit the batch
    VersionConflict,
    /// Batch commit failed and was rolled back; resubmit the batch
    CommitFailed,
    /// Cursor predates the retention window; full resync required
    StaleCursor,
    /// Cursor ahead of the ledger head or otherwise malformed
    InvalidCursor,
    /// Session phase transition not permitted
    InvalidSessionPhase,

    // Infrastructure errors (5xxx)
    /// Database operation failed
    DatabaseError,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            // Validation (1xxx)
            ErrorCode::InvalidRequestBody => 1001,
            ErrorCode::InvalidFieldValue => 1002,
            ErrorCode::InvalidPayloadHash => 1003,

            // Geofence (2xxx)
            ErrorCode::MissingReferenceLocation => 2001,

            // Resource (3xxx)
            ErrorCode::PdvNotFound => 3001,
            ErrorCode::EntityNotFound => 3002,

            // Sync (4xxx)
            ErrorCode::VersionConflict => 4001,
            ErrorCode::CommitFailed => 4002,
            ErrorCode::StaleCursor => 4003,
            ErrorCode::InvalidCursor => 4004,
            ErrorCode::InvalidSessionPhase => 4005,

            // Infrastructure (5xxx)
            ErrorCode::DatabaseError => 5001,
            ErrorCode::InternalError => 5999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            // Validation -> 400 / 422
            ErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidFieldValue => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::InvalidPayloadHash => StatusCode::BAD_REQUEST,

            // Geofence -> 422
            ErrorCode::MissingReferenceLocation => StatusCode::UNPROCESSABLE_ENTITY,

            // Resource -> 404
            ErrorCode::PdvNotFound => StatusCode::NOT_FOUND,
            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            // Sync -> 409 / 410 / 400
            ErrorCode::VersionConflict => StatusCode::CONFLICT,
            ErrorCode::CommitFailed => StatusCode::CONFLICT,
            ErrorCode::StaleCursor => StatusCode::GONE,
            ErrorCode::InvalidCursor => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidSessionPhase => StatusCode::CONFLICT,

            // Infrastructure -> 500
            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code_str = match self {
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::InvalidPayloadHash => "INVALID_PAYLOAD_HASH",
            ErrorCode::MissingReferenceLocation => "MISSING_REFERENCE_LOCATION",
            ErrorCode::PdvNotFound => "PDV_NOT_FOUND",
            ErrorCode::EntityNotFound => "ENTITY_NOT_FOUND",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::CommitFailed => "COMMIT_FAILED",
            ErrorCode::StaleCursor => "STALE_CURSOR",
            ErrorCode::InvalidCursor => "INVALID_CURSOR",
            ErrorCode::InvalidSessionPhase => "INVALID_SESSION_PHASE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", code_str)
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error details
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    /// Create a new API error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                resource_id: None,
            },
        }
    }

    /// Set additional details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    /// Set related resource ID
    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    /// Get the HTTP status code
    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.to_string();
        let mut response = (status, Json(self)).into_response();

        // Add error code header for easier debugging
        if let Ok(code_value) = axum::http::HeaderValue::from_str(&code_str) {
            response.headers_mut().insert(
                axum::http::header::HeaderName::from_static("x-error-code"),
                code_value,
            );
        }

        response
    }
}

// ============================================================================
// Conversion from SyncError
// ============================================================================

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Database(e) => {
                ApiError::new(ErrorCode::DatabaseError, format!("Database error: {}", e))
            }
            SyncError::Validation(errors) => ApiError::new(
                ErrorCode::InvalidFieldValue,
                "Payload validation failed",
            )
            .with_details(serde_json::json!({ "errors": errors })),
            SyncError::MissingReferenceLocation(pdv_id) => ApiError::new(
                ErrorCode::MissingReferenceLocation,
                format!("PDV {} has no registered coordinates", pdv_id),
            )
            .with_resource_id(pdv_id.to_string()),
            SyncError::PdvNotFound(pdv_id) => {
                ApiError::new(ErrorCode::PdvNotFound, format!("PDV not found: {}", pdv_id))
                    .with_resource_id(pdv_id.to_string())
            }
            SyncError::EntityNotFound {
                entity_kind,
                entity_id,
            } => ApiError::new(
                ErrorCode::EntityNotFound,
                format!("Entity not found: {}/{}", entity_kind, entity_id),
            )
            .with_resource_id(entity_id.to_string()),
            SyncError::VersionConflict {
                entity_kind,
                entity_id,
                expected,
                actual,
            } => ApiError::new(
                ErrorCode::VersionConflict,
                format!(
                    "Version conflict for {}/{}: expected {}, found {}",
                    entity_kind, entity_id, expected, actual
                ),
            )
            .with_resource_id(entity_id.to_string()),
            SyncError::StorageCommit(msg) => ApiError::new(
                ErrorCode::CommitFailed,
                format!("Batch commit rolled back: {}", msg),
            ),
            SyncError::StaleCursor {
                cursor,
                retained_floor,
            } => ApiError::new(
                ErrorCode::StaleCursor,
                format!(
                    "Cursor {} predates the retention window; full resync required",
                    cursor
                ),
            )
            .with_details(serde_json::json!({
                "cursor": cursor,
                "retained_floor": retained_floor,
            })),
            SyncError::InvalidCursor(msg) => ApiError::new(ErrorCode::InvalidCursor, msg),
            SyncError::PayloadHashMismatch(change_id) => ApiError::new(
                ErrorCode::InvalidPayloadHash,
                format!("Payload hash mismatch for change {}", change_id),
            )
            .with_resource_id(change_id.to_string()),
            SyncError::InvalidSessionPhase {
                device_id,
                from,
                to,
            } => ApiError::new(
                ErrorCode::InvalidSessionPhase,
                format!(
                    "Device {} cannot move from {} to {}",
                    device_id, from, to
                ),
            ),
            SyncError::Internal(msg) => ApiError::new(ErrorCode::InternalError, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_cursor_maps_to_gone_with_floor_details() {
        let api: ApiError = SyncError::StaleCursor {
            cursor: 3,
            retained_floor: 40,
        }
        .into();
        assert_eq!(api.status(), StatusCode::GONE);
        assert_eq!(api.error.code, ErrorCode::StaleCursor);
        assert_eq!(api.error.details.unwrap()["retained_floor"], 40);
    }

    #[test]
    fn validation_carries_field_errors_in_details() {
        let api: ApiError = SyncError::Validation(vec![crate::error::FieldError::new(
            "name",
            "must not be empty",
        )])
        .into();
        assert_eq!(api.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api.error.details.unwrap()["errors"][0]["field"], "name");
    }
}
