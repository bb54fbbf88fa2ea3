//! Route table, service settings and the node directory consumed by the
//! dispatcher. All of it is loaded once at start-up and read-only afterwards.

use std::{collections::HashMap, fs, path::{Path, PathBuf}, time::Duration};

use bon::Builder;
use serde::{Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

/// Role name of the gateway-facing entry point.
pub const GATEWAY_ROLE: &str = "gateway";

const DEFAULT_DOWNSTREAM_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse config: {}", source))]
    Parse { source: serde_json::Error },
}

/// Settings of the service this process runs as.
///
/// # Example
///
/// ```rust
/// use mesh_call::config::ServiceSettings;
///
/// let settings = ServiceSettings::builder()
///     .service_name("gateway")
///     .call_retry("0/100/300")
///     .call_key("secret")
///     .build();
/// assert!(settings.is_gateway());
/// ```
#[derive(Clone, Debug, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    /// Role of the current process. `"gateway"` may only call outbound routes.
    #[builder(into)]
    pub service_name: String,

    /// Retry plan specification, see [`crate::call::retries::RetryPlan::analyze`].
    #[builder(into, default = default_call_retry())]
    #[serde(default = "default_call_retry")]
    pub call_retry: String,

    /// Value of the `Call-Key` header sent to downstream services.
    #[builder(into, default)]
    #[serde(default)]
    pub call_key: String,

    /// `host:port` of the metrics push gateway.
    #[builder(into, default)]
    #[serde(default)]
    pub push_gateway_address: String,

    #[builder(default = DEFAULT_DOWNSTREAM_TIMEOUT_SECS)]
    #[serde(default = "default_downstream_timeout_secs")]
    pub downstream_timeout_secs: u64,
}

fn default_call_retry() -> String {
    "0".to_string()
}

const fn default_downstream_timeout_secs() -> u64 {
    DEFAULT_DOWNSTREAM_TIMEOUT_SECS
}

impl ServiceSettings {
    pub fn is_gateway(&self) -> bool {
        self.service_name == GATEWAY_ROLE
    }

    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_secs(self.downstream_timeout_secs)
    }
}

/// Direction of a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    /// Service-to-service call; never reachable from the gateway role.
    Inbound,
    /// Externally triggered call; only the gateway role may invoke it.
    Outbound,
}

impl<'de> Deserialize<'de> for RouteKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "in" | "inbound" => Ok(RouteKind::Inbound),
            "out" | "outbound" => Ok(RouteKind::Outbound),
            other => Err(serde::de::Error::unknown_variant(other, &["in", "out"])),
        }
    }
}

impl RouteKind {
    /// Whether a process running as `role` may invoke a route of this kind.
    pub fn permits(self, role_is_gateway: bool) -> bool {
        match self {
            RouteKind::Outbound => role_is_gateway,
            RouteKind::Inbound => !role_is_gateway,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: RouteKind,
    #[serde(default, deserialize_with = "non_blank")]
    pub limiter: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub fusing: Option<String>,
}

fn non_blank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

impl Route {
    pub fn new(path: impl Into<String>, kind: RouteKind) -> Self {
        Self {
            path: path.into(),
            kind,
            limiter: None,
            fusing: None,
        }
    }

    pub fn with_limiter(mut self, spec: impl Into<String>) -> Self {
        self.limiter = Some(spec.into());
        self
    }

    pub fn with_fusing(mut self, spec: impl Into<String>) -> Self {
        self.fusing = Some(spec.into());
        self
    }
}

/// service name → action name → route.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct RouteTable(HashMap<String, HashMap<String, Route>>);

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: impl Into<String>, action: impl Into<String>, route: Route) {
        self.0
            .entry(service.into())
            .or_default()
            .insert(action.into(), route);
    }

    /// Whether `service` has at least one declared action.
    pub fn has_service(&self, service: &str) -> bool {
        self.0.get(service).is_some_and(|actions| !actions.is_empty())
    }

    /// Routes with an empty path count as undeclared.
    pub fn lookup(&self, service: &str, action: &str) -> Option<&Route> {
        self.0
            .get(service)?
            .get(action)
            .filter(|route| !route.path.is_empty())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub service: ServiceSettings,
    #[serde(default)]
    pub routes: RouteTable,
}

impl Config {
    pub fn new(service: ServiceSettings, routes: RouteTable) -> Self {
        Self { service, routes }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).context(ParseSnafu)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_json_str(&raw)
    }
}

/// Externally maintained list of replica addresses per service.
pub trait NodeDirectory: Send + Sync + 'static {
    /// Current `host:port` addresses of `service`, in node-index order.
    fn nodes(&self, service: &str) -> Vec<String>;
}

/// A fixed directory, typically filled from configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticNodes(HashMap<String, Vec<String>>);

impl StaticNodes {
    pub fn insert(&mut self, service: impl Into<String>, nodes: Vec<String>) {
        self.0.insert(service.into(), nodes);
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<String>)> for StaticNodes {
    fn from_iter<I: IntoIterator<Item = (S, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(s, n)| (s.into(), n)).collect())
    }
}

impl NodeDirectory for StaticNodes {
    fn nodes(&self, service: &str) -> Vec<String> {
        self.0.get(service).cloned().unwrap_or_default()
    }
}
