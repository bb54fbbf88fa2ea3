//! Pushes a handful of gauges to the gateway named by `PUSH_GATEWAY_ADDRESS`.
//!
//! ```sh
//! PUSH_GATEWAY_ADDRESS=127.0.0.1:9091 cargo run -p push_gateway --example push_metrics
//! ```

use mesh_call::request::MapData;
use push_gateway::PushGateway;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), mesh_call::Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let address =
        std::env::var("PUSH_GATEWAY_ADDRESS").unwrap_or_else(|_| "127.0.0.1:9091".to_string());
    let gateway = PushGateway::new(address)?;

    let mut data = MapData::new();
    data.insert("mesh_call_up".into(), json!(1));
    data.insert("mesh_call_nodes".into(), json!(3));

    let body = gateway.push("mesh_call_demo", &data).await?;
    tracing::info!(response = %body, "Metrics pushed");
    Ok(())
}
