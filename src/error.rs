// Error handling module
// Defines the error taxonomy shared by the session pipeline

use thiserror::Error;

use crate::auth::Redirect;

/// Fallback text when neither the backend nor the transport gave a reason
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred";

/// Errors surfaced by the session pipeline.
///
/// `Clone` so a single refresh outcome can be handed to every request in a
/// refresh wave.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Login or refresh response was malformed or incomplete
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Network failure or timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend reported an authorization failure
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Backend rejected a login/refresh call with a non-auth status
    #[error("Request rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Session was cleared; the caller must send the user back to login
    #[error("Session ended: {0}")]
    SessionEnded(String),
}

impl AuthError {
    /// Build an error from a non-2xx auth endpoint response
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = normalize_message(status, body);
        match status.as_u16() {
            401 => AuthError::Unauthorized(message),
            code => AuthError::Rejected {
                status: code,
                message,
            },
        }
    }

    /// Build a transport error, keeping the reqwest message
    pub fn transport(err: &reqwest::Error) -> Self {
        let message = err.to_string();
        if message.is_empty() {
            AuthError::Transport(UNKNOWN_ERROR_MESSAGE.to_string())
        } else {
            AuthError::Transport(message)
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Unauthorized(_) => Some(401),
            AuthError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The normalized reason without the variant prefix
    pub fn message(&self) -> String {
        match self {
            AuthError::InvalidCredential(message)
            | AuthError::Transport(message)
            | AuthError::Unauthorized(message)
            | AuthError::Rejected { message, .. }
            | AuthError::SessionEnded(message) => message.clone(),
        }
    }

    /// Where a UI-level caller should navigate after this error
    pub fn redirect(&self) -> Option<Redirect> {
        match self {
            AuthError::SessionEnded(_) => Some(Redirect::Login { return_to: None }),
            _ => None,
        }
    }

    /// User-facing text for a failed login.
    ///
    /// A backend-supplied message always wins; otherwise well-known statuses
    /// get a friendly explanation.
    pub fn display_message(&self) -> String {
        match self {
            AuthError::Transport(_) => {
                "Unable to connect to server. Please check your connection.".to_string()
            }
            AuthError::Unauthorized(message) if is_status_text(message) => {
                "Invalid username or password".to_string()
            }
            AuthError::Rejected { status: 403, message } if is_status_text(message) => {
                "Account disabled. Please contact administrator.".to_string()
            }
            other => other.message(),
        }
    }
}

/// Pick the most specific message for a failed auth endpoint call:
/// backend payload `message`, else the status line, else a generic text.
pub fn normalize_message(status: reqwest::StatusCode, body: &str) -> String {
    let payload_message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .filter(|m| !m.trim().is_empty());

    if let Some(message) = payload_message {
        return message;
    }

    match status.canonical_reason() {
        Some(reason) => status_text(status.as_u16(), reason),
        None => UNKNOWN_ERROR_MESSAGE.to_string(),
    }
}

fn status_text(code: u16, reason: &str) -> String {
    format!("HTTP {} {}", code, reason)
}

fn is_status_text(message: &str) -> bool {
    message.starts_with("HTTP ") || message == UNKNOWN_ERROR_MESSAGE
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_error_messages() {
        let err = AuthError::InvalidCredential("missing user".to_string());
        assert_eq!(err.to_string(), "Invalid credential: missing user");

        let err = AuthError::Rejected {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Request rejected: 500 - boom");

        let err = AuthError::SessionEnded("refresh failed".to_string());
        assert_eq!(err.to_string(), "Session ended: refresh failed");
    }

    #[test]
    fn test_normalize_prefers_payload_message() {
        let msg = normalize_message(StatusCode::BAD_REQUEST, r#"{"message":"Bad password"}"#);
        assert_eq!(msg, "Bad password");
    }

    #[test]
    fn test_normalize_falls_back_to_status_line() {
        let msg = normalize_message(StatusCode::FORBIDDEN, "<html>nope</html>");
        assert_eq!(msg, "HTTP 403 Forbidden");

        let msg = normalize_message(StatusCode::BAD_GATEWAY, r#"{"message":"  "}"#);
        assert_eq!(msg, "HTTP 502 Bad Gateway");
    }

    #[test]
    fn test_normalize_unknown_status() {
        let status = StatusCode::from_u16(599).unwrap();
        assert_eq!(normalize_message(status, ""), UNKNOWN_ERROR_MESSAGE);
    }

    #[test]
    fn test_from_status_classifies_401() {
        let err = AuthError::from_status(StatusCode::UNAUTHORIZED, "");
        assert_eq!(err, AuthError::Unauthorized("HTTP 401 Unauthorized".to_string()));
        assert_eq!(err.status(), Some(401));

        let err = AuthError::from_status(StatusCode::INTERNAL_SERVER_ERROR, r#"{"message":"db down"}"#);
        assert_eq!(
            err,
            AuthError::Rejected {
                status: 500,
                message: "db down".to_string()
            }
        );
    }

    #[test]
    fn test_display_message_login_mapping() {
        let err = AuthError::from_status(StatusCode::UNAUTHORIZED, "");
        assert_eq!(err.display_message(), "Invalid username or password");

        let err = AuthError::from_status(StatusCode::FORBIDDEN, "");
        assert_eq!(
            err.display_message(),
            "Account disabled. Please contact administrator."
        );

        let err = AuthError::from_status(StatusCode::UNAUTHORIZED, r#"{"message":"Locked out"}"#);
        assert_eq!(err.display_message(), "Locked out");

        let err = AuthError::Transport("connection refused".to_string());
        assert!(err.display_message().starts_with("Unable to connect"));
    }

    #[test]
    fn test_only_session_ended_redirects() {
        assert_eq!(
            AuthError::SessionEnded("x".to_string()).redirect(),
            Some(Redirect::Login { return_to: None })
        );
        assert_eq!(AuthError::Unauthorized("x".to_string()).redirect(), None);
        assert_eq!(AuthError::Transport("x".to_string()).redirect(), None);
    }
}
