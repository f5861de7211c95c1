//! Waypoint - routing, filtering, and rate-limiting core for a
//! reverse-proxy API gateway
//!
//! Waypoint decides what happens to each request before it reaches an
//! upstream:
//! - Predicate-based route matching (path, method, header, host,
//!   query, time window)
//! - Per-route filter chains with ordered request/response phases
//! - Token-bucket rate limiting with pluggable key resolvers
//! - Atomic route table reloads that never disturb in-flight requests
//! - Prometheus metrics via pluggable observers
//!
//! Transport is delegated to a host-provided [`chain::Forwarder`];
//! waypoint itself never opens sockets.

pub mod chain;
pub mod config;
pub mod exchange;
pub mod filter;
pub mod gateway;
pub mod limiter;
pub mod metrics;
pub mod predicate;
pub mod routes;

pub use chain::{AssembledFilter, Chain, FilterScope, Forwarder};
pub use config::*;
pub use exchange::{Exchange, Response};
pub use filter::{FilterFactory, FilterInstance, FilterRegistry, GatewayFilter};
pub use gateway::{Gateway, GatewayBuilder};
pub use limiter::{EmptyKeyPolicy, KeyResolver, KeyResolverRegistry, TokenBucketLimiter};
pub use metrics::{MetricsObserver, NoopObserver, Observer};
pub use predicate::{PredicateFactory, PredicateRegistry, RoutePredicate};
pub use routes::{Route, RouteDescription, RouteTable};
