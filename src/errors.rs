//! Error taxonomy shared by every driver, plus the HTTP mapping used by the
//! gateway handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};

/// Errors produced by a backend in its own native type.
///
/// Drivers box their native error; the façade asks the driver to classify it
/// with [`crate::driver::Driver::error_code`] before handing it to callers.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Backend-independent classification of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The failure could not be classified.
    Unknown,
    /// The addressed blob does not exist.
    NotFound,
    /// The blob already exists and the operation requires it not to.
    AlreadyExists,
    /// The request is structurally invalid (empty key, bad range, ...).
    InvalidArgument,
    /// The caller is not allowed to perform the operation.
    PermissionDenied,
    /// The backend does not support the capability.
    Unimplemented,
    /// The operation was canceled through its cancellation token.
    Canceled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::Unimplemented => "Unimplemented",
            ErrorCode::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error type application code sees.
#[derive(Debug, thiserror::Error)]
#[error("blob ({code}): {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<DriverError>,
}

impl Error {
    /// Create an error with a specific code and message.
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            source: None,
        }
    }

    pub fn with_source(code: ErrorCode, msg: impl Into<String>, source: DriverError) -> Self {
        Self {
            code,
            message: msg.into(),
            source: Some(source),
        }
    }

    /// Shortcut for `InvalidArgument`.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, msg)
    }

    /// Shortcut for `NotFound`.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Gateway-side error: a status plus a message rendered as JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorCode::Canceled => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::new(status_for(err.code()), err.to_string())
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        // Blob errors surfacing through io::Read/io::Write keep their code.
        if let Some(blob_err) = err.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
            return AppError::new(status_for(blob_err.code()), blob_err.to_string());
        }
        AppError::internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::internal(format!("blocking task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = Error::not_found("attributes \"a\"");
        assert_eq!(err.to_string(), "blob (NotFound): attributes \"a\"");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn io_errors_carrying_blob_errors_keep_their_status() {
        let io_err = io::Error::other(Error::invalid_argument("bad"));
        let app: AppError = io_err.into();
        assert_eq!(app.status, StatusCode::BAD_REQUEST);

        let plain: AppError = io::Error::other("disk on fire").into();
        assert_eq!(plain.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
