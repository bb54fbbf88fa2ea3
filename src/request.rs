//! Internal request representation and the capability interface front-end
//! adapters implement to produce it.

use std::net::IpAddr;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Loosely typed key/value payload shared by request bodies, headers and
/// metrics pushes.
pub type MapData = serde_json::Map<String, Value>;

/// A decoded inbound request, ready to be forwarded downstream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub url_param: String,
    pub client_ip: String,
    pub headers: MapData,
    pub body: MapData,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), Value::String(value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Builds the internal representation from any front-end adapter.
    pub fn from_source<S: RequestSource + ?Sized>(source: &S) -> Self {
        Self {
            method: source.method(),
            url: source.url(),
            url_param: source.url_param(),
            client_ip: source.client_ip(),
            headers: source.headers(),
            body: source.body(),
        }
    }
}

/// What a front-end framework must expose for its requests to enter the
/// call layer.
pub trait RequestSource {
    fn method(&self) -> String;
    fn url(&self) -> String;
    fn url_param(&self) -> String;
    fn client_ip(&self) -> String;
    fn headers(&self) -> MapData;
    fn body(&self) -> MapData;
}

/// Adapter over a plain `http::Request` with a fully buffered body.
pub struct HttpSource<'a> {
    request: &'a http::Request<Bytes>,
    peer: Option<IpAddr>,
}

impl<'a> HttpSource<'a> {
    pub fn new(request: &'a http::Request<Bytes>, peer: Option<IpAddr>) -> Self {
        Self { request, peer }
    }

    fn is_json(&self) -> bool {
        self.request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"))
    }
}

impl RequestSource for HttpSource<'_> {
    fn method(&self) -> String {
        self.request.method().as_str().to_string()
    }

    fn url(&self) -> String {
        self.request.uri().path().to_string()
    }

    fn url_param(&self) -> String {
        self.request.uri().query().unwrap_or_default().to_string()
    }

    /// Prefers the first `X-Forwarded-For` hop over the socket peer.
    fn client_ip(&self) -> String {
        let forwarded = self
            .request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        forwarded
            .or_else(|| self.peer.map(|ip| ip.to_string()))
            .unwrap_or_default()
    }

    fn headers(&self) -> MapData {
        let mut headers = MapData::new();
        for (name, value) in self.request.headers() {
            if headers.contains_key(name.as_str()) {
                continue;
            }
            match value.to_str() {
                Ok(v) => {
                    headers.insert(name.as_str().to_string(), Value::String(v.to_string()));
                }
                Err(_) => debug!(header = %name, "Skipping non-visible-ASCII header value"),
            }
        }
        headers
    }

    fn body(&self) -> MapData {
        let raw = self.request.body();
        if raw.is_empty() {
            return MapData::new();
        }

        if self.is_json() {
            return match serde_json::from_slice::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    debug!("Request body is not a JSON object; ignoring it");
                    MapData::new()
                }
            };
        }

        url::form_urlencoded::parse(raw)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect()
    }
}
