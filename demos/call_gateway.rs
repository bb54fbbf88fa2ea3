// demos/call_gateway.rs
//
// Runs one call through the dispatcher against locally running services.
//
//   MESH_CALL_CONFIG=config.json \
//   MESH_CALL_NODES="user=127.0.0.1:9510,127.0.0.1:9511" \
//   cargo run --example call_gateway -- user login

use std::{env, sync::Arc};

use http::{HeaderMap, HeaderValue};
use mesh_call::{
    Error as CrateError,
    call::Dispatcher,
    config::{Config, StaticNodes},
    request::Request,
    trace::{OtelSpan, install_trace_context_propagator, trace_request},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV_VAR: &str = "MESH_CALL_CONFIG";
const NODES_ENV_VAR: &str = "MESH_CALL_NODES";
const TRACEPARENT_ENV_VAR: &str = "MESH_CALL_TRACEPARENT";
const DEFAULT_CONFIG_PATH: &str = "config.json";
const LOG_FILE_NAME: &str = "call_gateway.log";

/// `service=host:port,host:port;service=...`
fn parse_nodes(raw: &str) -> StaticNodes {
    raw.split(';')
        .filter_map(|entry| entry.split_once('='))
        .map(|(service, nodes)| {
            let nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            (service.trim().to_string(), nodes)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), CrateError> {
    let file_appender = tracing_appender::rolling::daily(".", LOG_FILE_NAME);
    let (non_blocking_appender, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = "info,mesh_call=debug,mesh_call::stats=trace";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout).with_target(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_appender)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;

    dotenvy::dotenv().ok();

    let mut args = env::args().skip(1);
    let service = args.next().unwrap_or_else(|| "user".to_string());
    let action = args.next().unwrap_or_else(|| "login".to_string());

    let config_path = env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::from_path(&config_path)?;
    let nodes = parse_nodes(&env::var(NODES_ENV_VAR).unwrap_or_default());
    info!(%config_path, role = %config.service.service_name, "Configuration loaded");

    install_trace_context_propagator();
    let mut incoming = HeaderMap::new();
    if let Ok(traceparent) = env::var(TRACEPARENT_ENV_VAR) {
        incoming.insert("traceparent", HeaderValue::from_str(&traceparent)?);
    }
    let span = OtelSpan::from_headers(&incoming);

    let dispatcher = Dispatcher::new(config, Arc::new(nodes))?;
    let request = Request::new("POST")
        .header("X-Request-Source", "call_gateway")
        .field("name", "demo");
    trace_request(&span, &request);

    let result = dispatcher.call(&span, &service, &action, &request).await;
    span.end();

    match &result.error {
        None => info!(status = result.status, body = %result.body, "Call succeeded"),
        Some(e) => error!(status = result.status, body = %result.body, error = %e, "Call failed"),
    }
    Ok(())
}
