/// Gateway filters and their factories
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::Chain;
use crate::exchange::Exchange;

/// A filter wrapping the forwarding of one request.
///
/// Filters run in continuation style: work done before
/// `chain.proceed(exchange)` is the pre phase, work done after it is the
/// post phase. A filter that does not call `proceed` short-circuits the
/// rest of the chain and must set a response on the exchange.
#[async_trait]
pub trait GatewayFilter: Send + Sync {
    /// Process the exchange, invoking the rest of the chain at most once
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()>;
}

impl std::fmt::Debug for dyn GatewayFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn GatewayFilter")
    }
}

/// A built filter together with an explicitly requested order, if the
/// factory chose one. Filters without a requested order receive their
/// position in the declaring list (1-based) during chain assembly.
#[derive(Debug)]
pub struct FilterInstance {
    /// The filter itself
    pub filter: Arc<dyn GatewayFilter>,
    /// Explicit order requested by the factory
    pub order: Option<i32>,
}

impl FilterInstance {
    /// A filter ordered by its declaration position
    pub fn new(filter: Arc<dyn GatewayFilter>) -> Self {
        Self {
            filter,
            order: None,
        }
    }

    /// A filter with an explicitly requested order
    pub fn ordered(filter: Arc<dyn GatewayFilter>, order: i32) -> Self {
        Self {
            filter,
            order: Some(order),
        }
    }
}

/// Builds filters from rule arguments, looked up by name
pub trait FilterFactory: Send + Sync {
    /// Factory name as referenced in rule definitions
    fn name(&self) -> &str;

    /// Build a filter from the rule's argument value
    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance>;
}

/// Registry of filter factories, populated at startup and read-only
/// while requests are being served
pub struct FilterRegistry {
    factories: HashMap<String, Arc<dyn FilterFactory>>,
}

impl FilterRegistry {
    /// Create a registry with all built-in filter factories that need no
    /// shared state. The rate limiter factory is registered separately
    /// because it carries the shared bucket store.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(Arc::new(PreLogFilterFactory));
        registry.register(Arc::new(AddRequestHeaderFilterFactory));
        registry.register(Arc::new(SetRequestHeaderFilterFactory));
        registry.register(Arc::new(RemoveRequestHeaderFilterFactory));
        registry.register(Arc::new(AddResponseHeaderFilterFactory));
        registry.register(Arc::new(SetResponseHeaderFilterFactory));
        registry.register(Arc::new(StripPrefixFilterFactory));
        registry
    }

    /// Register a factory under its own name, replacing any previous one
    pub fn register(&mut self, factory: Arc<dyn FilterFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    /// Build a filter by factory name
    pub fn build(&self, name: &str, args: &serde_json::Value) -> Result<FilterInstance> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("Unknown filter factory: {}", name))?;
        factory.build(args)
    }

    /// Check whether a factory is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Validate a header name/value pair at load time so bad rules fail the
/// table build instead of every request
fn validate_header_pair(name: &str, value: &str) -> Result<()> {
    http::header::HeaderName::try_from(name)
        .map_err(|e| anyhow!("Invalid header name '{}': {}", name, e))?;
    http::header::HeaderValue::try_from(value)
        .map_err(|e| anyhow!("Invalid header value for '{}': {}", name, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// PreLog

#[derive(Debug, Deserialize)]
struct PreLogArgs {
    name: String,
    value: String,
    order: Option<i32>,
}

struct PreLogFilter {
    name: String,
    value: String,
}

#[async_trait]
impl GatewayFilter for PreLogFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        info!(
            "Request {} inbound: {}={}",
            exchange.request_id, self.name, self.value
        );
        chain.proceed(exchange).await
    }
}

/// Logs a configured name/value pair before the request is forwarded.
/// An optional `order` argument overrides the positional chain order.
pub struct PreLogFilterFactory;

impl FilterFactory for PreLogFilterFactory {
    fn name(&self) -> &str {
        "PreLog"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: PreLogArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for PreLog filter".to_string())?;
        let filter = Arc::new(PreLogFilter {
            name: args.name,
            value: args.value,
        });
        Ok(match args.order {
            Some(order) => FilterInstance::ordered(filter, order),
            None => FilterInstance::new(filter),
        })
    }
}

// ---------------------------------------------------------------------------
// Request header edits

#[derive(Debug, Deserialize)]
struct HeaderEditArgs {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct HeaderNameArgs {
    name: String,
}

struct AddRequestHeaderFilter {
    name: String,
    value: String,
}

#[async_trait]
impl GatewayFilter for AddRequestHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        exchange
            .request
            .append_header(self.name.clone(), self.value.clone())
            .map_err(|e| anyhow!("Failed to add header {}: {}", self.name, e))?;
        chain.proceed(exchange).await
    }
}

/// Appends a request header before forwarding, keeping existing values
pub struct AddRequestHeaderFilterFactory;

impl FilterFactory for AddRequestHeaderFilterFactory {
    fn name(&self) -> &str {
        "AddRequestHeader"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: HeaderEditArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for AddRequestHeader filter".to_string())?;
        validate_header_pair(&args.name, &args.value)?;
        Ok(FilterInstance::new(Arc::new(AddRequestHeaderFilter {
            name: args.name,
            value: args.value,
        })))
    }
}

struct SetRequestHeaderFilter {
    name: String,
    value: String,
}

#[async_trait]
impl GatewayFilter for SetRequestHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        exchange.request.remove_header(self.name.as_str());
        exchange
            .request
            .insert_header(self.name.clone(), self.value.clone())
            .map_err(|e| anyhow!("Failed to set header {}: {}", self.name, e))?;
        chain.proceed(exchange).await
    }
}

/// Sets a request header before forwarding, overwriting existing values
pub struct SetRequestHeaderFilterFactory;

impl FilterFactory for SetRequestHeaderFilterFactory {
    fn name(&self) -> &str {
        "SetRequestHeader"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: HeaderEditArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for SetRequestHeader filter".to_string())?;
        validate_header_pair(&args.name, &args.value)?;
        Ok(FilterInstance::new(Arc::new(SetRequestHeaderFilter {
            name: args.name,
            value: args.value,
        })))
    }
}

struct RemoveRequestHeaderFilter {
    name: String,
}

#[async_trait]
impl GatewayFilter for RemoveRequestHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        exchange.request.remove_header(self.name.as_str());
        chain.proceed(exchange).await
    }
}

/// Removes a request header before forwarding
pub struct RemoveRequestHeaderFilterFactory;

impl FilterFactory for RemoveRequestHeaderFilterFactory {
    fn name(&self) -> &str {
        "RemoveRequestHeader"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: HeaderNameArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for RemoveRequestHeader filter".to_string())?;
        http::header::HeaderName::try_from(args.name.as_str())
            .map_err(|e| anyhow!("Invalid header name '{}': {}", args.name, e))?;
        Ok(FilterInstance::new(Arc::new(RemoveRequestHeaderFilter {
            name: args.name,
        })))
    }
}

// ---------------------------------------------------------------------------
// Response header edits

struct AddResponseHeaderFilter {
    name: String,
    value: String,
}

#[async_trait]
impl GatewayFilter for AddResponseHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        chain.proceed(exchange).await?;
        if let Some(response) = exchange.response.as_mut() {
            response
                .header
                .append_header(self.name.clone(), self.value.clone())
                .map_err(|e| anyhow!("Failed to add response header {}: {}", self.name, e))?;
        }
        Ok(())
    }
}

/// Appends a response header after the rest of the chain has produced a
/// response
pub struct AddResponseHeaderFilterFactory;

impl FilterFactory for AddResponseHeaderFilterFactory {
    fn name(&self) -> &str {
        "AddResponseHeader"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: HeaderEditArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for AddResponseHeader filter".to_string())?;
        validate_header_pair(&args.name, &args.value)?;
        Ok(FilterInstance::new(Arc::new(AddResponseHeaderFilter {
            name: args.name,
            value: args.value,
        })))
    }
}

struct SetResponseHeaderFilter {
    name: String,
    value: String,
}

#[async_trait]
impl GatewayFilter for SetResponseHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        chain.proceed(exchange).await?;
        if let Some(response) = exchange.response.as_mut() {
            response.header.remove_header(self.name.as_str());
            response
                .header
                .insert_header(self.name.clone(), self.value.clone())
                .map_err(|e| anyhow!("Failed to set response header {}: {}", self.name, e))?;
        }
        Ok(())
    }
}

/// Sets a response header after the rest of the chain has produced a
/// response, overwriting existing values
pub struct SetResponseHeaderFilterFactory;

impl FilterFactory for SetResponseHeaderFilterFactory {
    fn name(&self) -> &str {
        "SetResponseHeader"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: HeaderEditArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for SetResponseHeader filter".to_string())?;
        validate_header_pair(&args.name, &args.value)?;
        Ok(FilterInstance::new(Arc::new(SetResponseHeaderFilter {
            name: args.name,
            value: args.value,
        })))
    }
}

// ---------------------------------------------------------------------------
// StripPrefix

#[derive(Debug, Deserialize)]
struct StripPrefixArgs {
    parts: usize,
}

struct StripPrefixFilter {
    parts: usize,
}

/// Drop the first `parts` path segments, keeping the leading slash
fn strip_segments(path: &str, parts: usize) -> String {
    let kept: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip(parts)
        .collect();
    if kept.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", kept.join("/"))
    }
}

#[async_trait]
impl GatewayFilter for StripPrefixFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
        let path = exchange.request.uri.path();
        let stripped = strip_segments(path, self.parts);
        let new_path_and_query = match exchange.request.uri.query() {
            Some(query) => format!("{}?{}", stripped, query),
            None => stripped,
        };
        let uri = new_path_and_query
            .parse::<http::Uri>()
            .map_err(|e| anyhow!("Failed to rewrite path '{}': {}", path, e))?;
        exchange.request.set_uri(uri);
        chain.proceed(exchange).await
    }
}

/// Removes leading path segments before forwarding, e.g. `parts: 1`
/// rewrites `/users/1` to `/1`
pub struct StripPrefixFilterFactory;

impl FilterFactory for StripPrefixFilterFactory {
    fn name(&self) -> &str {
        "StripPrefix"
    }

    fn build(&self, args: &serde_json::Value) -> Result<FilterInstance> {
        let args: StripPrefixArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for StripPrefix filter".to_string())?;
        if args.parts == 0 {
            return Err(anyhow!("StripPrefix requires parts >= 1"));
        }
        Ok(FilterInstance::new(Arc::new(StripPrefixFilter {
            parts: args.parts,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AssembledFilter, FilterScope, Forwarder};
    use crate::exchange::Response;
    use bytes::Bytes;
    use pingora_http::RequestHeader;
    use serde_json::json;

    struct OkForwarder;

    #[async_trait]
    impl Forwarder for OkForwarder {
        async fn forward(&self, _exchange: &Exchange, _target: &str) -> Result<Response> {
            Ok(Response::plain_text(200, Bytes::from_static(b"ok")))
        }
    }

    fn make_exchange(path: &str) -> Exchange {
        let req = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        Exchange::new(req, "127.0.0.1:9000".parse().unwrap())
    }

    async fn run_single(instance: FilterInstance, exchange: &mut Exchange) {
        let assembled = vec![AssembledFilter {
            name: "test".to_string(),
            scope: FilterScope::Route,
            order: 1,
            filter: instance.filter,
        }];
        let forwarder: Arc<dyn Forwarder> = Arc::new(OkForwarder);
        Chain::new(&assembled, &forwarder, "http://upstream")
            .proceed(exchange)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_request_header() {
        let registry = FilterRegistry::with_builtins();
        let instance = registry
            .build(
                "AddRequestHeader",
                &json!({ "name": "S-Header", "value": "Bar" }),
            )
            .unwrap();

        let mut exchange = make_exchange("/users/1");
        run_single(instance, &mut exchange).await;

        assert_eq!(exchange.request.headers.get("s-header").unwrap(), "Bar");
        assert_eq!(exchange.response.as_ref().unwrap().status(), 200);
    }

    #[tokio::test]
    async fn test_set_request_header_overwrites() {
        let registry = FilterRegistry::with_builtins();
        let instance = registry
            .build(
                "SetRequestHeader",
                &json!({ "name": "x-env", "value": "prod" }),
            )
            .unwrap();

        let mut exchange = make_exchange("/users/1");
        exchange.request.insert_header("x-env", "dev").unwrap();
        run_single(instance, &mut exchange).await;

        let values: Vec<_> = exchange.request.headers.get_all("x-env").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "prod");
    }

    #[tokio::test]
    async fn test_remove_request_header() {
        let registry = FilterRegistry::with_builtins();
        let instance = registry
            .build("RemoveRequestHeader", &json!({ "name": "x-secret" }))
            .unwrap();

        let mut exchange = make_exchange("/users/1");
        exchange.request.insert_header("x-secret", "hide").unwrap();
        run_single(instance, &mut exchange).await;

        assert!(exchange.request.headers.get("x-secret").is_none());
    }

    #[tokio::test]
    async fn test_add_response_header() {
        let registry = FilterRegistry::with_builtins();
        let instance = registry
            .build(
                "AddResponseHeader",
                &json!({ "name": "x-served-by", "value": "waypoint" }),
            )
            .unwrap();

        let mut exchange = make_exchange("/users/1");
        run_single(instance, &mut exchange).await;

        let response = exchange.response.as_ref().unwrap();
        assert_eq!(
            response.header.headers.get("x-served-by").unwrap(),
            "waypoint"
        );
    }

    #[tokio::test]
    async fn test_strip_prefix_rewrites_path() {
        let registry = FilterRegistry::with_builtins();
        let instance = registry
            .build("StripPrefix", &json!({ "parts": 1 }))
            .unwrap();

        let mut exchange = make_exchange("/users/1?page=2");
        run_single(instance, &mut exchange).await;

        assert_eq!(exchange.request.uri.path(), "/1");
        assert_eq!(exchange.request.uri.query(), Some("page=2"));
    }

    #[tokio::test]
    async fn test_strip_prefix_to_root() {
        let registry = FilterRegistry::with_builtins();
        let instance = registry
            .build("StripPrefix", &json!({ "parts": 2 }))
            .unwrap();

        let mut exchange = make_exchange("/users/1");
        run_single(instance, &mut exchange).await;

        assert_eq!(exchange.request.uri.path(), "/");
    }

    #[test]
    fn test_strip_segments() {
        assert_eq!(strip_segments("/users/1", 1), "/1");
        assert_eq!(strip_segments("/users/1/orders", 2), "/orders");
        assert_eq!(strip_segments("/users", 3), "/");
    }

    #[test]
    fn test_prelog_order_override() {
        let registry = FilterRegistry::with_builtins();
        let positional = registry
            .build("PreLog", &json!({ "name": "a", "value": "b" }))
            .unwrap();
        let explicit = registry
            .build("PreLog", &json!({ "name": "a", "value": "b", "order": -1 }))
            .unwrap();

        assert_eq!(positional.order, None);
        assert_eq!(explicit.order, Some(-1));
    }

    #[test]
    fn test_invalid_header_name_fails_at_build() {
        let registry = FilterRegistry::with_builtins();
        let err = registry
            .build(
                "AddRequestHeader",
                &json!({ "name": "bad header", "value": "x" }),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Invalid header name"));
    }

    #[test]
    fn test_strip_prefix_rejects_zero_parts() {
        let registry = FilterRegistry::with_builtins();
        assert!(registry
            .build("StripPrefix", &json!({ "parts": 0 }))
            .is_err());
    }

    #[test]
    fn test_unknown_filter_factory_is_an_error() {
        let registry = FilterRegistry::with_builtins();
        let err = registry.build("Nope", &json!({})).unwrap_err();
        assert!(err.to_string().contains("Unknown filter factory"));
    }
}
