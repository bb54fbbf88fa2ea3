//! Microservice call layer.
//!
//! Given a logical service name and action, [`call::Dispatcher`] resolves the
//! route, enforces the route's access policy, picks the least-loaded replica,
//! applies the route's rate limiter and circuit breaker, and drives the
//! downstream HTTP call through a retry plan. The outcome is always normalised
//! into a [`call::CallResult`] of `(status, body, error)`.
//!
//! # Pipeline
//! 1. Route lookup and role check (`404` on failure)
//! 2. Node selection through the [`call::load_tracker::LoadTracker`] actor
//! 3. Limiter gate (`403 "server limiter"`) and fusing gate (`403 "server fusing"`)
//! 4. Attempt loop driven by [`call::retries::RetryPlan`]
//! 5. Failure accounting on the circuit breaker after the plan is exhausted
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use mesh_call::call::Dispatcher;
//! use mesh_call::config::{Config, StaticNodes};
//! use mesh_call::request::Request;
//! use mesh_call::trace::NoopSpan;
//!
//! # async fn run() -> Result<(), mesh_call::Error> {
//! let config = Config::from_path("config.json")?;
//! let nodes = StaticNodes::from_iter([("user", vec!["127.0.0.1:9510".to_string()])]);
//! let dispatcher = Dispatcher::new(config, Arc::new(nodes))?;
//!
//! let result = dispatcher.call(&NoopSpan, "user", "login", &Request::default()).await;
//! println!("{} {}", result.status, result.body);
//! # Ok(())
//! # }
//! ```
pub mod call;
pub mod clock;
pub mod config;
pub mod request;
pub mod trace;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
