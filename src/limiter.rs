/// Token-bucket rate limiting: key resolvers, the shared bucket store,
/// and the RequestRateLimiter filter
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chain::Chain;
use crate::exchange::{Exchange, Response};
use crate::filter::{FilterFactory, FilterInstance, GatewayFilter};
use crate::metrics::Observer;

/// Derives the rate-limit bucket key from an exchange.
///
/// Returning `None` (or an empty string) means the request carries no
/// usable key; the filter's `empty_key` policy decides what happens.
pub trait KeyResolver: Send + Sync {
    /// Produce the bucket key for this exchange
    fn resolve(&self, exchange: &Exchange) -> Option<String>;
}

/// Keys requests by path, giving each path its own bucket
pub struct PathKeyResolver;

impl KeyResolver for PathKeyResolver {
    fn resolve(&self, exchange: &Exchange) -> Option<String> {
        Some(exchange.request.uri.path().to_string())
    }
}

/// Keys requests by client IP address
pub struct RemoteAddrKeyResolver;

impl KeyResolver for RemoteAddrKeyResolver {
    fn resolve(&self, exchange: &Exchange) -> Option<String> {
        Some(exchange.client_addr.ip().to_string())
    }
}

/// Keys requests by the value of a request header
pub struct HeaderKeyResolver {
    header: String,
}

impl HeaderKeyResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl KeyResolver for HeaderKeyResolver {
    fn resolve(&self, exchange: &Exchange) -> Option<String> {
        exchange.request_header(&self.header).map(|v| v.to_string())
    }
}

/// Keys requests by the value of a query parameter
pub struct QueryParamKeyResolver {
    param: String,
}

impl QueryParamKeyResolver {
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
        }
    }
}

impl KeyResolver for QueryParamKeyResolver {
    fn resolve(&self, exchange: &Exchange) -> Option<String> {
        exchange.query_param(&self.param)
    }
}

/// Registry of key resolvers referenced by name from rate limiter rules.
///
/// `path` and `remote_addr` are registered out of the box; header and
/// query-parameter resolvers need a header or parameter name, so hosts
/// register those under names of their choosing.
pub struct KeyResolverRegistry {
    resolvers: HashMap<String, Arc<dyn KeyResolver>>,
}

impl KeyResolverRegistry {
    /// Create a registry with the built-in resolvers
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            resolvers: HashMap::new(),
        };
        registry.register("path", Arc::new(PathKeyResolver));
        registry.register("remote_addr", Arc::new(RemoteAddrKeyResolver));
        registry
    }

    /// Register a resolver under a name, replacing any previous one
    pub fn register(&mut self, name: &str, resolver: Arc<dyn KeyResolver>) {
        self.resolvers.insert(name.to_string(), resolver);
    }

    /// Look up a resolver by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyResolver>> {
        self.resolvers.get(name).cloned()
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Whole tokens left in the bucket after the check
    pub remaining: u64,
}

/// Token bucket with fractional accrual
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(refill_rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Adopt the caller's current rate and capacity. Tokens above the
    /// new capacity are forfeited.
    fn set_limits(&mut self, refill_rate: f64, capacity: f64) {
        self.refill_rate = refill_rate;
        self.capacity = capacity;
        if self.tokens > capacity {
            self.tokens = capacity;
        }
    }

    /// Add tokens for the elapsed time, capped at capacity
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Refill, then consume one token if at least one is available.
    /// A denied request consumes nothing.
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u64 {
        self.tokens as u64
    }
}

/// Shared store of token buckets, one per resolved key.
///
/// The map entry guard makes the refill-and-consume sequence atomic per
/// key and bucket creation race-free; the guard is always dropped
/// before the caller awaits anything. Distinct keys hit different map
/// shards and proceed independently.
pub struct TokenBucketLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Admit or reject one request for `key`.
    ///
    /// Each call applies its own rate and capacity before consuming, so
    /// reloaded rules take effect on live buckets and a key shared by
    /// two rules is governed by whichever checked it last.
    pub fn check(&self, key: &str, replenish_rate: f64, burst_capacity: f64) -> RateLimitDecision {
        self.check_at(key, replenish_rate, burst_capacity, Instant::now())
    }

    /// Admission check against an explicit clock reading
    pub fn check_at(
        &self,
        key: &str,
        replenish_rate: f64,
        burst_capacity: f64,
        now: Instant,
    ) -> RateLimitDecision {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(replenish_rate, burst_capacity, now));
        bucket.set_limits(replenish_rate, burst_capacity);
        let allowed = bucket.try_consume(now);
        RateLimitDecision {
            allowed,
            remaining: bucket.remaining(),
        }
    }

    /// Remove buckets idle for longer than `max_idle`; returns how many
    /// were evicted
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    /// Idle eviction against an explicit clock reading
    pub fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < max_idle);
        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn a background task that periodically sweeps idle buckets.
    /// Without it the store grows with the key space until evict_idle
    /// is called by hand.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(max_idle);
                if evicted > 0 {
                    debug!("Evicted {} idle rate limit buckets", evicted);
                }
            }
        })
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do when the key resolver yields no key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyKeyPolicy {
    /// Reject the request with 429
    Deny,
    /// Skip rate limiting and forward
    Bypass,
}

#[derive(Debug, Deserialize)]
struct RateLimiterArgs {
    key_resolver: String,
    replenish_rate: f64,
    burst_capacity: f64,
    empty_key: EmptyKeyPolicy,
}

struct RequestRateLimiterFilter {
    key_resolver: Arc<dyn KeyResolver>,
    limiter: Arc<TokenBucketLimiter>,
    observer: Arc<dyn Observer>,
    replenish_rate: f64,
    burst_capacity: f64,
    empty_key: EmptyKeyPolicy,
}

fn deny_response(remaining: u64) -> Response {
    let mut response = Response::plain_text(429, Bytes::from_static(b"Rate limit exceeded"));
    response.header.insert_header("retry-after", "1").unwrap();
    response
        .header
        .insert_header("x-ratelimit-remaining", remaining.to_string())
        .unwrap();
    response
}

#[async_trait]
impl GatewayFilter for RequestRateLimiterFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        let key = self
            .key_resolver
            .resolve(exchange)
            .filter(|k| !k.is_empty());
        let route_id = exchange.route_id.clone().unwrap_or_default();

        let key = match key {
            Some(key) => key,
            None => match self.empty_key {
                EmptyKeyPolicy::Bypass => {
                    debug!(
                        "Request {} resolved no rate limit key, bypassing limiter",
                        exchange.request_id
                    );
                    return chain.proceed(exchange).await;
                }
                EmptyKeyPolicy::Deny => {
                    warn!(
                        "Request {} resolved no rate limit key, denying",
                        exchange.request_id
                    );
                    self.observer.on_rate_limit(&route_id, "", false);
                    exchange.set_response(deny_response(0));
                    return Ok(());
                }
            },
        };

        let decision = self
            .limiter
            .check(&key, self.replenish_rate, self.burst_capacity);
        self.observer.on_rate_limit(&route_id, &key, decision.allowed);

        if decision.allowed {
            debug!(
                "Rate limit passed for key: {} ({} remaining)",
                key, decision.remaining
            );
            chain.proceed(exchange).await?;
            if let Some(response) = exchange.response.as_mut() {
                response
                    .header
                    .insert_header("x-ratelimit-remaining", decision.remaining.to_string())
                    .map_err(|e| anyhow!("Failed to set rate limit header: {}", e))?;
            }
            Ok(())
        } else {
            warn!("Rate limit exceeded for key: {}", key);
            exchange.set_response(deny_response(decision.remaining));
            Ok(())
        }
    }
}

/// Admission-control filter backed by the shared token bucket store.
///
/// Registered by the gateway builder rather than with the stateless
/// built-ins because it carries the bucket store, the resolver
/// registry, and the observer.
pub struct RequestRateLimiterFactory {
    limiter: Arc<TokenBucketLimiter>,
    resolvers: Arc<KeyResolverRegistry>,
    observer: Arc<dyn Observer>,
}

impl RequestRateLimiterFactory {
    pub fn new(
        limiter: Arc<TokenBucketLimiter>,
        resolvers: Arc<KeyResolverRegistry>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            limiter,
            resolvers,
            observer,
        }
    }
}

impl FilterFactory for RequestRateLimiterFactory {
    fn name(&self) -> &str {
        "RequestRateLimiter"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: RateLimiterArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for RequestRateLimiter filter".to_string())?;
        if args.replenish_rate <= 0.0 {
            return Err(anyhow!("RequestRateLimiter replenish_rate must be positive"));
        }
        if args.burst_capacity < 1.0 {
            return Err(anyhow!("RequestRateLimiter burst_capacity must be at least 1"));
        }
        let key_resolver = self
            .resolvers
            .get(&args.key_resolver)
            .ok_or_else(|| anyhow!("Unknown key resolver: {}", args.key_resolver))?;

        Ok(FilterInstance::new(Arc::new(RequestRateLimiterFilter {
            key_resolver,
            limiter: self.limiter.clone(),
            observer: self.observer.clone(),
            replenish_rate: args.replenish_rate,
            burst_capacity: args.burst_capacity,
            empty_key: args.empty_key,
        })))
    }
}
