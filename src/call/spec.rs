//! Parsers for the `"<seconds>/<count>"` policy strings attached to routes.

use std::{num::ParseIntError, time::Duration};

use snafu::{ResultExt, Snafu, ensure};

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SpecError {
    #[snafu(display("empty specification"))]
    Empty,

    #[snafu(display("malformed specification {:?}", spec))]
    Malformed { spec: String },

    #[snafu(display("invalid number in specification {:?}: {}", spec, source))]
    InvalidNumber { spec: String, source: ParseIntError },

    #[snafu(display("count must be positive in specification {:?}", spec))]
    NonPositive { spec: String },
}

/// A time window and the count allowed (limiter) or tolerated (fusing) in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub window: Duration,
    pub count: u64,
}

impl WindowSpec {
    pub fn new(window: Duration, count: u64) -> Self {
        Self { window, count }
    }

    /// Parses `"<windowSeconds>/<count>"`, e.g. `"5/100"`.
    pub fn parse(spec: &str) -> Result<Self, SpecError> {
        let trimmed = spec.trim();
        ensure!(!trimmed.is_empty(), EmptySnafu);

        let mut parts = trimmed.split('/');
        let (Some(seconds), Some(count), None) = (parts.next(), parts.next(), parts.next()) else {
            return MalformedSnafu { spec }.fail();
        };

        let seconds: u64 = seconds
            .trim()
            .parse()
            .context(InvalidNumberSnafu { spec })?;
        let count: u64 = count.trim().parse().context(InvalidNumberSnafu { spec })?;
        ensure!(count > 0, NonPositiveSnafu { spec });

        Ok(Self::new(Duration::from_secs(seconds), count))
    }
}
