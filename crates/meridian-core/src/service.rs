//! Service types addressable through an endpoint.

use serde::{Deserialize, Serialize};

/// Category of remote service an endpoint talks to.
///
/// Every endpoint is bound to exactly one service type for its whole
/// lifetime; the type selects the per-service circuit breaker
/// configuration and the pipeline installed on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Binary key-value service.
    Kv,
    /// Query (N1QL-style) service.
    Query,
    /// Full-text search service.
    Search,
    /// Analytics service.
    Analytics,
    /// View engine.
    Views,
    /// Eventing service.
    Eventing,
    /// Cluster management service.
    Management,
}

impl ServiceType {
    /// Stable lowercase identifier, used in context exports and logs.
    pub const fn ident(&self) -> &'static str {
        match self {
            ServiceType::Kv => "kv",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Views => "views",
            ServiceType::Eventing => "eventing",
            ServiceType::Management => "management",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ident())
    }
}
