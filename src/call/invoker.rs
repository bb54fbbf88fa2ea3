//! One downstream HTTP attempt.

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Request as HttpRequest,
    Response as HttpResponse, StatusCode,
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING},
};
use serde_json::Value;
use tower::{Service, ServiceExt};

use super::http::HttpError;
use crate::{
    Error as CrateError,
    request::{MapData, Request},
    trace::SpanContext,
};

/// Header carrying the inter-service authentication key.
pub const CALL_KEY_HEADER: HeaderName = HeaderName::from_static("call-key");

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Framing headers describe the inbound connection, not the outgoing request.
const SKIPPED_HEADERS: [HeaderName; 5] =
    [HOST, CONTENT_LENGTH, CONTENT_TYPE, CONNECTION, TRANSFER_ENCODING];

/// Encodes and sends a [`Request`] to one node through the wrapped service.
#[derive(Clone, Debug)]
pub struct DownstreamInvoker<S> {
    service: S,
    call_key: String,
}

impl<S> DownstreamInvoker<S>
where
    S: Service<HttpRequest<Bytes>, Response = HttpResponse<String>> + Clone + Send + 'static,
    S::Error: Into<CrateError>,
    S::Future: Send,
{
    pub fn new(service: S, call_key: impl Into<String>) -> Self {
        Self {
            service,
            call_key: call_key.into(),
        }
    }

    /// Sends `request` to `url`. Only a `200` is a success; its body is
    /// returned as text.
    pub async fn invoke<T: SpanContext + ?Sized>(
        &self,
        span: &T,
        url: &str,
        request: &Request,
    ) -> Result<String, HttpError> {
        let http_request = self.build_request(span, url, request)?;

        let response = self
            .service
            .clone()
            .oneshot(http_request)
            .await
            .map_err(|e| HttpError::from_boxed(e.into()))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response.into_body());
        }

        let body = response.into_body();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%url, status = %status, error_body = %truncate(&body), "Server error or rate limited");
        } else {
            debug!(%url, status = %status, "Downstream answered with a non-200 status");
        }
        Err(HttpError::ServerError {
            status: status.as_u16(),
            body,
        })
    }

    pub fn build_request<T: SpanContext + ?Sized>(
        &self,
        span: &T,
        url: &str,
        request: &Request,
    ) -> Result<HttpRequest<Bytes>, HttpError> {
        let method = if request.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(request.method.to_ascii_uppercase().as_bytes()).map_err(|e| {
                HttpError::InvalidRequest {
                    details: format!("invalid method {:?}: {}", request.method, e),
                }
            })?
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| HttpError::BuildRequest {
                    details: format!("invalid header name {:?}: {}", name, e),
                })?;
            if SKIPPED_HEADERS.contains(&header_name) {
                continue;
            }
            let header_value =
                HeaderValue::from_str(&value_text(value)).map_err(|e| HttpError::BuildRequest {
                    details: format!("invalid value for header {:?}: {}", name, e),
                })?;
            headers.append(header_name, header_value);
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        let call_key = HeaderValue::from_str(&self.call_key).map_err(|e| HttpError::BuildRequest {
            details: format!("invalid call key: {}", e),
        })?;
        headers.insert(CALL_KEY_HEADER, call_key);
        span.inject(&mut headers);

        let mut http_request = HttpRequest::builder()
            .method(method)
            .uri(url)
            .body(encode_form(&request.body))
            .map_err(|e| HttpError::InvalidRequest {
                details: format!("invalid url {:?}: {}", url, e),
            })?;
        *http_request.headers_mut() = headers;
        Ok(http_request)
    }
}

/// `application/x-www-form-urlencoded` rendering of a body map.
pub fn encode_form(body: &MapData) -> Bytes {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in body {
        serializer.append_pair(key, &value_text(value));
    }
    Bytes::from(serializer.finish())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(100).collect()
}
