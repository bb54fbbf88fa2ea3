//! Distributed-trace collaborator.
//!
//! The call layer only needs two things from a span: tag it, and write its
//! context into outgoing headers. [`SpanContext`] captures exactly that;
//! [`OtelSpan`] is the OpenTelemetry-backed implementation. Exporting spans is
//! left to whatever tracer provider the host process installs.

use http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::{
    Context, KeyValue, global,
    propagation::{Extractor, Injector},
    trace::{TraceContextExt, Tracer},
};
use opentelemetry_sdk::propagation::TraceContextPropagator;

use crate::request::Request;

const TRACER_NAME: &str = "mesh_call";

pub trait SpanContext: Send + Sync {
    /// Writes this span's propagation headers into `headers`.
    fn inject(&self, headers: &mut HeaderMap);

    fn tag(&self, key: &str, value: &str);
}

/// Registers the W3C `traceparent` propagator as the global text-map propagator.
pub fn install_trace_context_propagator() {
    global::set_text_map_propagator(TraceContextPropagator::new());
}

/// A span living inside an OpenTelemetry [`Context`].
#[derive(Debug, Clone)]
pub struct OtelSpan {
    cx: Context,
}

impl OtelSpan {
    /// Continues the trace carried by `headers`, or starts a new root span
    /// when they carry none.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let parent = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(headers))
        });
        let span = global::tracer(TRACER_NAME).start_with_context("http", &parent);
        Self {
            cx: parent.with_span(span),
        }
    }

    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn end(&self) {
        self.cx.span().end();
    }
}

impl SpanContext for OtelSpan {
    fn inject(&self, headers: &mut HeaderMap) {
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&self.cx, &mut HeaderInjector(headers))
        });
    }

    fn tag(&self, key: &str, value: &str) {
        self.cx
            .span()
            .set_attribute(KeyValue::new(key.to_string(), value.to_string()));
    }
}

/// Span for callers that do not trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSpan;

impl SpanContext for NoopSpan {
    fn inject(&self, _headers: &mut HeaderMap) {}

    fn tag(&self, _key: &str, _value: &str) {}
}

/// Attaches the decoded request to the span under the `Request` tag.
pub fn trace_request<S: SpanContext + ?Sized>(span: &S, request: &Request) {
    match serde_json::to_string(request) {
        Ok(encoded) => span.tag("Request", &encoded),
        Err(error) => debug!(%error, "Failed to encode request for span tag"),
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                self.0.insert(name, value);
            }
            _ => debug!(header = key, "Dropping unrepresentable trace header"),
        }
    }
}
