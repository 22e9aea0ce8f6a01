//! Configuration management for the admission service.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{FailurePolicy, LimiterConfig};

/// Prefix of environment variables that override file settings,
/// e.g. `ADMISSION__RATE_LIMIT__MAX_REQUESTS=10`.
pub const ENV_PREFIX: &str = "ADMISSION";

/// Main configuration for the admission service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Route-scoped limiter settings
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Behavior when a limiter cannot evaluate a request
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Interval between sweeps of expired limiter state
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Named limiters that endpoints opt into
    #[serde(default)]
    pub policies: HashMap<String, LimiterConfig>,

    /// Limiters applied to every request, in order
    #[serde(default)]
    pub chain: Vec<ChainStageConfig>,

    /// Per-route bindings keyed by request path; policy names are
    /// lower-cased on load
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings::default(),
            failure_policy: FailurePolicy::default(),
            sweep_interval_seconds: default_sweep_interval(),
            policies: HashMap::new(),
            chain: Vec::new(),
            endpoints: HashMap::new(),
        }
    }
}

/// Settings of the route-scoped limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enable_rate_limiting: bool,

    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_time_window")]
    pub time_window_seconds: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enable_rate_limiting: false,
            max_requests: default_max_requests(),
            time_window_seconds: default_time_window(),
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(AdmissionError::Config(
                "rate_limit.max_requests must be positive".to_string(),
            ));
        }
        let secs = self.time_window_seconds;
        if !secs.is_finite() || secs <= 0.0 || secs > u32::MAX as f64 {
            return Err(AdmissionError::Config(format!(
                "rate_limit.time_window_seconds must be a positive number of seconds, got {}",
                secs
            )));
        }
        Ok(())
    }
}

/// One entry of the global chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStageConfig {
    pub name: String,
    pub limiter: LimiterConfig,
}

/// Which limiters apply to a single route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Name of a policy in [`AdmissionConfig::policies`]
    #[serde(default)]
    pub policy: Option<String>,

    /// Apply the route-scoped limiter
    #[serde(default)]
    pub route_scoped: bool,

    /// Skip every limiter, including the global chain
    #[serde(default)]
    pub exempt: bool,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_requests() -> u64 {
    100
}

fn default_time_window() -> f64 {
    60.0
}

impl AdmissionConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    ///
    /// Only an unreadable or malformed file is an error. Each limiter,
    /// chain stage and endpoint block is parsed on its own; an invalid block
    /// is logged and left out while the rest of the file still applies.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AdmissionError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_document(settings.try_deserialize()?)
    }

    /// Load configuration, falling back to rate limiting disabled when the
    /// file is missing or unreadable.
    pub fn load_or_disabled(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("No configuration file given, rate limiting disabled");
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(config) => {
                info!(path = %path.display(), "Configuration loaded");
                config
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Invalid configuration, rate limiting disabled"
                );
                Self::default()
            }
        }
    }

    fn from_document(document: Value) -> Result<Self> {
        let mut sections = match document {
            Value::Object(sections) => sections,
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(AdmissionError::Config(format!(
                    "expected a mapping at the top level, got {}",
                    other
                )))
            }
        };

        let mut config = Self::default();
        if let Some(value) = sections.remove("rate_limit") {
            config.rate_limit = parse_block("rate_limit", value).unwrap_or_default();
        }
        if let Some(value) = sections.remove("failure_policy") {
            config.failure_policy = parse_block("failure_policy", value).unwrap_or_default();
        }
        if let Some(value) = sections.remove("sweep_interval_seconds") {
            config.sweep_interval_seconds = parse_block("sweep_interval_seconds", value)
                .unwrap_or_else(default_sweep_interval);
        }

        for (name, value) in mapping("policies", sections.remove("policies")) {
            let Some(policy) = parse_block(&format!("policies.{}", name), value) else {
                continue;
            };
            let name = normalize_policy_name(&name);
            if config.policies.insert(name.clone(), policy).is_some() {
                warn!(policy = %name, "Duplicate policy name, keeping the last definition");
            }
        }

        match sections.remove("chain") {
            None | Some(Value::Null) => {}
            Some(Value::Array(stages)) => {
                for (index, value) in stages.into_iter().enumerate() {
                    if let Some(stage) = parse_block(&format!("chain[{}]", index), value) {
                        config.chain.push(stage);
                    }
                }
            }
            Some(_) => warn!(block = "chain", "Expected a list of stages, ignoring block"),
        }

        for (route, value) in mapping("endpoints", sections.remove("endpoints")) {
            let Some(mut endpoint) =
                parse_block::<EndpointConfig>(&format!("endpoints.{}", route), value)
            else {
                continue;
            };
            endpoint.policy = endpoint.policy.as_deref().map(normalize_policy_name);
            config.endpoints.insert(route, endpoint);
        }

        Ok(config)
    }
}

/// Policy names match case-insensitively.
pub fn normalize_policy_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn parse_block<T: DeserializeOwned>(block: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(block, error = %err, "Skipping invalid configuration block");
            None
        }
    }
}

fn mapping(block: &str, value: Option<Value>) -> Vec<(String, Value)> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(entries)) => entries.into_iter().collect(),
        Some(_) => {
            warn!(block, "Expected a mapping, ignoring block");
            Vec::new()
        }
    }
}
