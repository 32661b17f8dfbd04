//! Application error types and their mapping onto HTTP responses.

use bytes::Bytes;

use crate::http::gate::GateError;
use crate::http::response::{Response, ResponseBody, StatusCode};

/// Body sent for server faults when running in production.
pub const GENERIC_FAILURE_MESSAGE: &str = "Internal Server Error";

/// A failure meant for the client: explicit status and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub status: StatusCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(status: impl Into<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Any failure raised while handling a request.
///
/// Wraps an [`anyhow::Error`], so any error type converts with `?`. A
/// [`ValidationError`] anywhere in the chain makes it client-facing;
/// everything else is a server fault.
pub struct AppError(anyhow::Error);

impl AppError {
    pub fn validation(status: impl Into<StatusCode>, message: impl Into<String>) -> Self {
        Self(ValidationError::new(status, message).into())
    }

    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::msg(message))
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        self.0.chain().find_map(|e| e.downcast_ref::<ValidationError>())
    }

    /// True when the failure came from the connection going away.
    pub fn is_disconnect(&self) -> bool {
        self.0.chain().any(|e| e.downcast_ref::<GateError>().is_some())
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Builds the terminal response for `error`.
///
/// Server faults are logged here with their full chain. The returned
/// response always carries an exact `Content-Length`.
pub fn failure_response(error: &AppError, production: bool) -> Response {
    let (status, content_type, body) = match error.as_validation() {
        Some(validation) => {
            let body = serde_json::json!({ "error": validation.message }).to_string();
            (validation.status, "application/json", body)
        }
        None => {
            tracing::error!(error = ?error, "Unhandled failure while handling request");
            let body = if production {
                GENERIC_FAILURE_MESSAGE.to_string()
            } else {
                error.to_string()
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                body,
            )
        }
    };

    let mut response = Response::new(status);
    response
        .headers
        .insert("Content-Type".to_string(), content_type.to_string());
    response
        .headers
        .insert("Content-Length".to_string(), body.len().to_string());
    response.body = ResponseBody::Full(Bytes::from(body));
    response
}

/// Renders a caught panic payload as an error.
pub fn panic_error(payload: Box<dyn std::any::Any + Send>) -> AppError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    AppError::msg(format!("panicked: {message}"))
}
