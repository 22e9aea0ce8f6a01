//! Request descriptors and partition key derivation.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Partition shared by every request when a limiter is not partitioned.
const GLOBAL_PARTITION: &str = "*";

/// What the HTTP layer knows about an inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Route identifier or request path, e.g. `/api/v2/home/limit`
    pub route: String,
    /// Direct peer address, with or without a port
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Raw `X-Forwarded-For` header value
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Raw `User-Agent` header value
    #[serde(default)]
    pub user_agent: Option<String>,
    /// When the HTTP layer received the request
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl RequestDescriptor {
    /// Create a descriptor for `route` with no client information.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            remote_addr: None,
            forwarded_for: None,
            user_agent: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// The client identity used for per-client partitions.
    ///
    /// The direct peer address wins. Without one, the first entry of the
    /// forwarded-for header is used. Addresses are rendered canonically so
    /// `::ffff:10.0.0.1`, `10.0.0.1:443` and `10.0.0.1` share a partition.
    pub fn client_identity(&self) -> String {
        let direct = self
            .remote_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty());
        if let Some(addr) = direct {
            return normalize_address(addr);
        }

        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty());
        match forwarded {
            Some(addr) => normalize_address(addr),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }

    /// The route name: the last non-empty path segment, lower-cased.
    pub fn route_name(&self) -> String {
        let path = self.route.split(['?', '#']).next().unwrap_or_default();
        path.rsplit('/')
            .map(str::trim)
            .find(|segment| !segment.is_empty())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    /// The normalized full route, used to look up endpoint bindings.
    pub fn normalized_route(&self) -> String {
        normalize_route(&self.route)
    }
}

/// Normalize a route path: drop query and fragment, trailing slashes and case.
pub fn normalize_route(route: &str) -> String {
    let path = route.split(['?', '#']).next().unwrap_or_default().trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

fn normalize_address(raw: &str) -> String {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return ip.to_canonical().to_string();
    }
    if let Ok(socket) = raw.parse::<SocketAddr>() {
        return socket.ip().to_canonical().to_string();
    }
    raw.to_ascii_lowercase()
}

/// A key that scopes limiter state to one client or route identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key used by the route-scoped limiter: `route-name:client-identity`.
    pub fn route_scoped(request: &RequestDescriptor) -> Self {
        Self(format!(
            "{}:{}",
            request.route_name(),
            request.client_identity()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// How a limiter partitions incoming requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    /// One partition shared by every request
    #[default]
    Global,
    /// Per client address
    ClientAddress,
    /// Per `User-Agent` header value
    UserAgent,
    /// Per route name
    Route,
    /// Per route name and client address
    RouteAndClient,
}

impl PartitionBy {
    /// Derive the partition key for `request`.
    pub fn resolve(&self, request: &RequestDescriptor) -> PartitionKey {
        match self {
            PartitionBy::Global => PartitionKey::from(GLOBAL_PARTITION),
            PartitionBy::ClientAddress => PartitionKey::new(request.client_identity()),
            PartitionBy::UserAgent => {
                PartitionKey::new(request.user_agent.as_deref().unwrap_or_default().trim())
            }
            PartitionBy::Route => PartitionKey::new(request.route_name()),
            PartitionBy::RouteAndClient => PartitionKey::route_scoped(request),
        }
    }
}
