//! Capture error taxonomy.
//!
//! Failures are classified once, at the boundary where they first become
//! observable (driver call, admission gate, queue); higher layers carry the
//! classification through unchanged.

use serde::{Deserialize, Serialize};

/// Failure classes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Overloaded,
    QueueTimeout,
    CircuitOpen,
    AcquireFailed,
    NavigateTimeout,
    NavigateUnreachable,
    TargetClosed,
    ScreenshotFailed,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::AcquireFailed => "acquire_failed",
            ErrorKind::NavigateTimeout => "navigate_timeout",
            ErrorKind::NavigateUnreachable => "navigate_unreachable",
            ErrorKind::TargetClosed => "target_closed",
            ErrorKind::ScreenshotFailed => "screenshot_failed",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status the boundary maps this class to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 422,
            ErrorKind::Overloaded | ErrorKind::QueueTimeout | ErrorKind::CircuitOpen => 429,
            _ => 500,
        }
    }

    /// Whether a retry from the client side is likely to help soon.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Overloaded
                | ErrorKind::QueueTimeout
                | ErrorKind::CircuitOpen
                | ErrorKind::AcquireFailed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified capture failure, carried unchanged to the HTTP boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CaptureError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl CaptureError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }

    pub fn queue_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueTimeout, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn acquire_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AcquireFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<anyhow::Error> for CaptureError {
    fn from(err: anyhow::Error) -> Self {
        CaptureError::internal(err.to_string())
    }
}

/// How a single browser-driver call failed.
///
/// The CDP client reports failures as strings, so classification is by
/// message fragment. The fragments come from the driver itself ("connection
/// is closed", "No session with given id") and from Chrome's net error
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFailure {
    /// Browser process, context or page died mid-call.
    TargetClosed,
    /// The call ran out of time.
    Timeout,
    /// DNS/connect level failure reported by the browser.
    Unreachable,
    /// Anything else.
    Other,
}

pub fn classify_driver_error(message: &str) -> DriverFailure {
    let lower = message.to_lowercase();
    if lower.contains("connection is closed")
        || lower.contains("no session with given id")
        || lower.contains("no such process")
        || lower.contains("target closed")
        || lower.contains("session closed")
        || lower.contains("browser has been closed")
    {
        DriverFailure::TargetClosed
    } else if lower.contains("timeout") || lower.contains("timed out") {
        DriverFailure::Timeout
    } else if lower.contains("err_name_not_resolved")
        || lower.contains("err_connection")
        || lower.contains("err_address_unreachable")
        || lower.contains("err_internet_disconnected")
        || lower.contains("net::err")
        || lower.contains("chrome-error://")
        || lower.contains("dns")
    {
        DriverFailure::Unreachable
    } else {
        DriverFailure::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_boundary_contract() {
        assert_eq!(ErrorKind::Validation.http_status(), 422);
        assert_eq!(ErrorKind::Overloaded.http_status(), 429);
        assert_eq!(ErrorKind::QueueTimeout.http_status(), 429);
        assert_eq!(ErrorKind::CircuitOpen.http_status(), 429);
        assert_eq!(ErrorKind::AcquireFailed.http_status(), 500);
        assert_eq!(ErrorKind::NavigateTimeout.http_status(), 500);
        assert_eq!(ErrorKind::DeadlineExceeded.http_status(), 500);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(ErrorKind::NavigateUnreachable.as_str(), "navigate_unreachable");
        let json = serde_json::to_string(&ErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
    }

    #[test]
    fn driver_errors_classify_by_fragment() {
        assert_eq!(
            classify_driver_error("the connection is closed"),
            DriverFailure::TargetClosed
        );
        assert_eq!(
            classify_driver_error("No session with given id"),
            DriverFailure::TargetClosed
        );
        assert_eq!(
            classify_driver_error("navigation timed out after 8000ms"),
            DriverFailure::Timeout
        );
        assert_eq!(
            classify_driver_error("net::ERR_NAME_NOT_RESOLVED"),
            DriverFailure::Unreachable
        );
        assert_eq!(classify_driver_error("some js exception"), DriverFailure::Other);
    }

    #[test]
    fn retry_after_survives_serialization() {
        let err = CaptureError::circuit_open("upstream failing").with_retry_after(60_000);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "circuit_open");
        assert_eq!(json["retry_after_ms"], 60_000);

        let err = CaptureError::overloaded("pool saturated");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("retry_after_ms").is_none());
    }
}
