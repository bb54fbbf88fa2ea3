use std::{future::Future, time::Duration};

use http::StatusCode;
use snafu::{ResultExt, ensure};
use tokio::time::sleep;

use super::{
    http::HttpError,
    spec::{EmptySnafu, InvalidNumberSnafu, SpecError},
};

/// Defines the contract for determining which failed attempts are retried.
///
/// # Example
/// ```rust
/// use mesh_call::call::retries::RetryLogic;
///
/// #[derive(Clone)]
/// struct TimeoutsOnly;
///
/// impl RetryLogic for TimeoutsOnly {
///     type Error = std::io::Error;
///
///     fn is_retriable_error(&self, error: &Self::Error) -> bool {
///         error.kind() == std::io::ErrorKind::TimedOut
///     }
/// }
/// ```
pub trait RetryLogic: Clone + Send + Sync + 'static {
    /// The type of errors produced by one attempt
    type Error: std::error::Error + Send + Sync + 'static;

    /// Determines if an error should trigger another attempt.
    fn is_retriable_error(&self, error: &Self::Error) -> bool;
}

/// Retry logic for downstream HTTP attempts: a `404` is final, as are
/// requests that cannot be built.
#[derive(Clone, Debug, Default)]
pub struct DownstreamRetryLogic;

impl RetryLogic for DownstreamRetryLogic {
    type Error = HttpError;

    fn is_retriable_error(&self, error: &Self::Error) -> bool {
        match error {
            HttpError::ServerError { status, .. } if *status == StatusCode::NOT_FOUND.as_u16() => {
                debug!(%status, "Not retrying: downstream route not found");
                false
            }
            HttpError::ServerError { status, body } => {
                warn!(%status, error_body = body.chars().take(100).collect::<String>(), "Retrying server error");
                true
            }
            other if other.is_retriable() => true,
            other => {
                debug!(error_type = %other, "Not retrying request that cannot be built");
                false
            }
        }
    }
}

/// Ordered attempt plan parsed from a `"/"`-separated list of millisecond
/// delays, e.g. `"0/100/300"`.
///
/// The plan has one entry per attempt. The first attempt runs immediately;
/// entry `i` (for `i >= 1`) is the pause before attempt `i`, i.e. after
/// attempt `i - 1` failed. Nothing is slept after the last attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPlan {
    delays: Vec<Duration>,
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self::single()
    }
}

impl RetryPlan {
    /// One attempt, no retries.
    pub fn single() -> Self {
        Self {
            delays: vec![Duration::ZERO],
        }
    }

    pub fn from_delays(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self::single();
        }
        Self { delays }
    }

    pub fn analyze(spec: &str) -> Result<Self, SpecError> {
        let trimmed = spec.trim();
        ensure!(!trimmed.is_empty(), EmptySnafu);

        let delays = trimmed
            .split('/')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .context(InvalidNumberSnafu { spec })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { delays })
    }

    /// Like [`RetryPlan::analyze`], but a malformed spec degrades to a single
    /// attempt instead of failing.
    pub fn analyze_or_single(spec: &str) -> Self {
        Self::analyze(spec).unwrap_or_else(|error| {
            debug!(%error, spec, "Retry spec rejected; using a single attempt");
            Self::single()
        })
    }

    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Drives `attempt` through the plan.
    ///
    /// Stops at the first success, at the first error `logic` deems final,
    /// or after the last planned attempt; the last error is returned.
    pub async fn run<T, L, F, Fut>(&self, logic: &L, mut attempt: F) -> Result<T, L::Error>
    where
        L: RetryLogic,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, L::Error>>,
    {
        let last = self.delays.len().saturating_sub(1);
        let mut index = 0;
        loop {
            let error = match attempt(index).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if index >= last {
                error!(message = "Retries exhausted; dropping the request.", attempts = index + 1, %error);
                return Err(error);
            }
            if !logic.is_retriable_error(&error) {
                error!(message = "Non-retriable error; dropping the request.", attempt = index + 1, %error);
                return Err(error);
            }

            index += 1;
            let delay = self.delays[index];
            warn!(message = "Retrying after error.", %error, attempt = index + 1, delay_ms = %delay.as_millis());
            sleep(delay).await;
        }
    }
}
