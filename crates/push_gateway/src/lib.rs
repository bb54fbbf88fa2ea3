//! Client for a Prometheus push gateway.
//!
//! Metrics are pushed as the plain-text exposition format, one `name value`
//! line per entry, grouped under a job whose instance label equals the job.

use std::time::Duration;

use mesh_call::request::MapData;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use url::Url;

#[macro_use]
extern crate tracing;

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PushError {
    #[snafu(display("Failed to build push gateway client: {source}"))]
    Initialization { source: reqwest::Error },

    #[snafu(display("Invalid push gateway url {url}: {source}"))]
    UrlParse { url: String, source: url::ParseError },

    #[snafu(display("Push to {url} failed: {source}"))]
    Send { url: String, source: reqwest::Error },

    #[snafu(display("Failed to read push gateway response: {source}"))]
    ReadBody { source: reqwest::Error },
}

/// Renders `data` as exposition lines. String values are written verbatim,
/// everything else in its JSON form.
pub fn format_metrics(data: &MapData) -> String {
    data.iter()
        .map(|(name, value)| match value {
            Value::String(text) => format!("{name} {text}\n"),
            other => format!("{name} {other}\n"),
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct PushGateway {
    address: String,
    client: reqwest::Client,
}

impl PushGateway {
    /// Gateway at `address` (`host:port`). Every push is bounded by a 5 s
    /// timeout.
    pub fn new(address: impl Into<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context(InitializationSnafu)?;
        Ok(Self::with_client(address, client))
    }

    pub fn with_client(address: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            address: address.into(),
            client,
        }
    }

    pub fn job_url(&self, job: &str) -> Result<Url, PushError> {
        let url = format!("http://{}/metrics/job/{job}/instance/{job}", self.address);
        Url::parse(&url).context(UrlParseSnafu { url })
    }

    /// Pushes `data` under `job` and returns the gateway's response body,
    /// whatever its status.
    pub async fn push(&self, job: &str, data: &MapData) -> Result<String, PushError> {
        let url = self.job_url(job)?;
        let payload = format_metrics(data);
        debug!(%url, metrics = data.len(), "Pushing metrics");

        let response = self
            .client
            .post(url.clone())
            .body(payload)
            .send()
            .await
            .context(SendSnafu {
                url: url.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%url, %status, "Push gateway rejected metrics");
        }
        response.text().await.context(ReadBodySnafu)
    }
}
