/// Configuration management for the gateway engine
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Top-level rule configuration: the routes to serve, filters applied to
/// every route, and housekeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Route definitions
    pub routes: Vec<RouteDef>,
    /// Filters applied to every route, ordered before route filters on ties
    #[serde(default)]
    pub default_filters: Vec<FilterDef>,
    /// Idle rate-limit bucket eviction
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// A single route rule.
///
/// Predicates combine with logical AND; a route with no predicates
/// matches every request. Routes are tried sorted by `order` (lower
/// first), declaration order breaking ties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDef {
    /// Route identifier, unique within the table
    pub id: String,
    /// Route precedence, lower values are tried first
    #[serde(default)]
    pub order: i32,
    /// Conditions that must all hold for this route to match
    #[serde(default)]
    pub predicates: Vec<PredicateDef>,
    /// Route-local filters, ordered by declaration position
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    /// Opaque upstream descriptor handed to the forwarder
    pub target: String,
}

/// A predicate reference: factory name plus its arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateDef {
    /// Predicate factory name, e.g. "Path" or "TimeBetween"
    pub name: String,
    /// Factory-specific arguments
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A filter reference: factory name plus its arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDef {
    /// Filter factory name, e.g. "AddRequestHeader" or "RequestRateLimiter"
    pub name: String,
    /// Factory-specific arguments
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Idle rate-limit bucket eviction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Run a background task that sweeps idle buckets
    #[serde(default)]
    pub enabled: bool,
    /// Sweep interval
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub interval: Duration,
    /// Evict buckets not touched for this long
    #[serde(with = "humantime_serde", default = "default_max_idle")]
    pub max_idle: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_sweep_interval(),
            max_idle: default_max_idle(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow::anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                return Err(anyhow::anyhow!("Route with empty ID"));
            }
            if !seen_ids.insert(route.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate route ID: {}", route.id));
            }
            if route.target.is_empty() {
                return Err(anyhow::anyhow!("Route '{}' has an empty target", route.id));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_idle() -> Duration {
    Duration::from_secs(600)
}
