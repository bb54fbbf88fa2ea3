use snafu::Snafu;

use super::http::HttpError;

/// Body returned for route/service resolution failures.
pub const NOT_FOUND: &str = "not found";
/// Body returned when the downstream call failed after all attempts.
pub const SERVER_ERROR: &str = "server error";
/// Body returned when the route's limiter rejected the call.
pub const SERVER_LIMITER: &str = "server limiter";
/// Body returned when the route's circuit is open.
pub const SERVER_FUSING: &str = "server fusing";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CallError {
    /// Unknown service or action, no reachable node, or a route the current
    /// role may not call. Callers cannot tell these apart.
    #[snafu(display("{}", reason))]
    RouteNotFound { reason: String },

    #[snafu(display("server limiter"))]
    RateLimited,

    #[snafu(display("server fusing"))]
    CircuitOpen,

    #[snafu(display("downstream call failed: {}", source))]
    Downstream { source: HttpError },
}

impl CallError {
    pub fn status(&self) -> u16 {
        match self {
            CallError::RouteNotFound { .. } => 404,
            CallError::RateLimited | CallError::CircuitOpen => 403,
            CallError::Downstream { .. } => 500,
        }
    }

    /// Fixed message handed back to the caller in place of the error detail.
    pub fn message(&self) -> &'static str {
        match self {
            CallError::RouteNotFound { .. } => NOT_FOUND,
            CallError::RateLimited => SERVER_LIMITER,
            CallError::CircuitOpen => SERVER_FUSING,
            CallError::Downstream { .. } => SERVER_ERROR,
        }
    }
}

/// Normalised outcome of [`super::Dispatcher::call`].
#[derive(Debug)]
pub struct CallResult {
    pub status: u16,
    pub body: String,
    pub error: Option<CallError>,
}

impl CallResult {
    pub fn success(body: String) -> Self {
        Self {
            status: 200,
            body,
            error: None,
        }
    }

    pub fn failure(error: CallError) -> Self {
        Self {
            status: error.status(),
            body: error.message().to_string(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
