use std::{
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request as HttpRequest, Response as HttpResponse};
use tower::Service;

use super::http::HttpError;

/// A `tower::Service` wrapper for `reqwest::Client`.
///
/// Any status line is a successful response at this level; deciding which
/// statuses count as failures is left to the caller. Only transport-level
/// problems surface as errors.
#[derive(Clone, Debug)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    /// Client whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::ClientError { source: Box::new(e) })?;
        Ok(Self { client })
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        warn!(error = %e, "Request timed out");
        HttpError::Timeout
    } else if e.is_connect() {
        error!(error = %e, "Connection error");
        HttpError::Transport { source: Box::new(e) }
    } else {
        error!(error = %e, "Other reqwest error");
        HttpError::ClientError { source: Box::new(e) }
    }
}

impl Service<HttpRequest<Bytes>> for ReqwestService {
    type Response = HttpResponse<String>;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, http_request: HttpRequest<Bytes>) -> Self::Future {
        let (parts, body) = http_request.into_parts();

        let url_str = parts.uri.to_string();
        let url = match reqwest::Url::parse(&url_str) {
            Ok(u) => u,
            Err(parse_err) => {
                let ge = HttpError::InvalidRequest {
                    details: format!("Invalid URL '{}': {}", url_str, parse_err),
                };
                return Box::pin(async move { Err(ge) });
            }
        };

        let request_future = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(body)
            .send();

        Box::pin(async move {
            let response = request_future.await.map_err(classify)?;
            let status = response.status();
            let text = response.text().await.map_err(classify)?;
            HttpResponse::builder()
                .status(status)
                .body(text)
                .map_err(|e| HttpError::BuildRequest {
                    details: e.to_string(),
                })
        })
    }
}
