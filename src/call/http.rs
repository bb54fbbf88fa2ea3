use http::StatusCode;
use snafu::Snafu;

use crate::Error as CrateError;

/// Outcome of a single downstream HTTP attempt that did not produce a `200`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// Connection-level failure (refused, reset, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The request could not be expressed as HTTP (bad URL, method, header).
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The downstream answered with a status other than `200`.
    #[snafu(display("http status {}", status))]
    ServerError { status: u16, body: String },

    #[snafu(display("HTTP request timed out"))]
    Timeout,

    #[snafu(display("Failed to build HTTP request: {}", details))]
    BuildRequest { details: String },

    /// Other, unspecified HTTP client errors (e.g. unreadable response body).
    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    /// Status reported to the caller for this failure. Anything that never
    /// reached a downstream status line maps to `500`.
    pub fn status(&self) -> u16 {
        match self {
            HttpError::ServerError { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == StatusCode::NOT_FOUND.as_u16()
    }

    /// Whether another attempt could plausibly succeed. Requests that cannot
    /// be built will fail identically every time.
    pub const fn is_retriable(&self) -> bool {
        match self {
            HttpError::BuildRequest { .. } | HttpError::InvalidRequest { .. } => false,
            HttpError::ServerError { status, .. } => *status != 404,
            HttpError::Transport { .. } | HttpError::Timeout | HttpError::ClientError { .. } => {
                true
            }
        }
    }

    /// Folds an arbitrary service error into this vocabulary, keeping an
    /// `HttpError` intact when that is what the service produced.
    pub fn from_boxed(error: CrateError) -> Self {
        match error.downcast::<HttpError>() {
            Ok(http_error) => *http_error,
            Err(other) => HttpError::Transport { source: other },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(HttpError::Timeout.status(), 500);
        assert_eq!(
            HttpError::ServerError {
                status: 503,
                body: String::new()
            }
            .status(),
            503
        );
        assert!(
            HttpError::ServerError {
                status: 404,
                body: String::new()
            }
            .is_not_found()
        );
    }

    #[test]
    fn build_failures_are_final() {
        let error = HttpError::BuildRequest {
            details: "bad header".into(),
        };
        assert!(!error.is_retriable());
        assert!(HttpError::Timeout.is_retriable());
    }

    #[test]
    fn from_boxed_keeps_http_errors() {
        let boxed: CrateError = Box::new(HttpError::Timeout);
        assert!(matches!(HttpError::from_boxed(boxed), HttpError::Timeout));

        let other: CrateError = "connection reset".into();
        assert!(matches!(
            HttpError::from_boxed(other),
            HttpError::Transport { .. }
        ));
    }
}
