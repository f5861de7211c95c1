/// Gateway core: builder, atomic route table snapshot, and the
/// request handling loop
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use log::{debug, error, info};
use pingora_http::RequestHeader;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::chain::{Chain, Forwarder};
use crate::config::GatewayConfig;
use crate::exchange::{Exchange, Response};
use crate::filter::{FilterFactory, FilterRegistry};
use crate::limiter::{
    KeyResolver, KeyResolverRegistry, RequestRateLimiterFactory, TokenBucketLimiter,
};
use crate::metrics::{NoopObserver, Observer};
use crate::predicate::{PredicateFactory, PredicateRegistry};
use crate::routes::{RouteDescription, RouteTable};

/// Assembles a [`Gateway`] from a forwarder, optional observer, and
/// any extra predicate factories, filter factories, or key resolvers
/// beyond the built-ins.
pub struct GatewayBuilder {
    forwarder: Arc<dyn Forwarder>,
    observer: Arc<dyn Observer>,
    predicates: PredicateRegistry,
    filters: FilterRegistry,
    resolvers: KeyResolverRegistry,
}

impl GatewayBuilder {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            forwarder,
            observer: Arc::new(NoopObserver),
            predicates: PredicateRegistry::with_builtins(),
            filters: FilterRegistry::with_builtins(),
            resolvers: KeyResolverRegistry::with_builtins(),
        }
    }

    /// Install an observer; defaults to a no-op
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Register an extra predicate factory
    pub fn register_predicate(mut self, factory: Arc<dyn PredicateFactory>) -> Self {
        self.predicates.register(factory);
        self
    }

    /// Register an extra filter factory
    pub fn register_filter(mut self, factory: Arc<dyn FilterFactory>) -> Self {
        self.filters.register(factory);
        self
    }

    /// Register a rate limit key resolver under a name
    pub fn register_key_resolver(mut self, name: &str, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolvers.register(name, resolver);
        self
    }

    /// Build the gateway and load the initial route table.
    ///
    /// Fails if the config is invalid or any route fails to build; the
    /// gateway never starts with a partially loaded table.
    pub async fn build(self, config: &GatewayConfig) -> Result<Gateway> {
        config.validate()?;

        let limiter = Arc::new(TokenBucketLimiter::new());
        let mut filters = self.filters;
        filters.register(Arc::new(RequestRateLimiterFactory::new(
            limiter.clone(),
            Arc::new(self.resolvers),
            self.observer.clone(),
        )));

        let table = RouteTable::build(config, &self.predicates, &filters)?;
        info!("Loaded {} routes", table.len());

        let eviction_task = if config.eviction.enabled {
            Some(limiter.spawn_sweeper(config.eviction.interval, config.eviction.max_idle))
        } else {
            None
        };

        Ok(Gateway {
            table: ArcSwap::from_pointee(table),
            predicates: self.predicates,
            filters,
            forwarder: self.forwarder,
            observer: self.observer,
            eviction_task,
        })
    }
}

/// The gateway engine: matches requests against the active route
/// table, runs the matched route's filter chain, and synthesizes
/// error responses.
///
/// All shared state is behind `Arc` or atomics, so one instance
/// serves any number of concurrent `handle` calls.
pub struct Gateway {
    /// Active route table; swapped atomically on reload
    table: ArcSwap<RouteTable>,
    predicates: PredicateRegistry,
    filters: FilterRegistry,
    forwarder: Arc<dyn Forwarder>,
    observer: Arc<dyn Observer>,
    eviction_task: Option<tokio::task::JoinHandle<()>>,
}

impl Gateway {
    /// Build a route table from the config and swap it in atomically.
    ///
    /// In-flight requests keep the table they started with. On failure
    /// nothing is swapped and the current table keeps serving.
    pub fn apply_routes(&self, config: &GatewayConfig) -> Result<()> {
        config.validate().context("Invalid gateway config")?;
        let table = RouteTable::build(config, &self.predicates, &self.filters)?;
        info!("Applying new route table with {} routes", table.len());
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Process one request to completion and produce its response
    pub async fn handle(&self, request: RequestHeader, client_addr: SocketAddr) -> Response {
        let mut exchange = Exchange::new(request, client_addr);
        let table = self.table.load_full();

        let route = match table.find(&exchange) {
            Some(route) => route,
            None => {
                debug!(
                    "Request {} matched no route: {} {}",
                    exchange.request_id,
                    exchange.request.method,
                    exchange.request.uri.path()
                );
                self.observer
                    .on_unmatched(exchange.request.method.as_str(), exchange.request.uri.path());
                let response = Response::plain_text(404, Bytes::from_static(b"Not Found"));
                return self.finish(&exchange, response);
            }
        };

        exchange.route_id = Some(route.id.clone());
        self.observer.on_route_matched(&route.id);

        let result = Chain::new(&route.filters, &self.forwarder, &route.target)
            .proceed(&mut exchange)
            .await;

        let response = match result {
            Ok(()) => match exchange.response.take() {
                Some(response) => response,
                None => {
                    error!(
                        "Request {} produced no response on route '{}'",
                        exchange.request_id, route.id
                    );
                    self.observer.on_chain_error(&route.id);
                    Response::plain_text(500, Bytes::from_static(b"Internal Server Error"))
                }
            },
            Err(e) => {
                error!(
                    "Request {} failed on route '{}': {:#}",
                    exchange.request_id, route.id, e
                );
                self.observer.on_chain_error(&route.id);
                Response::plain_text(500, Bytes::from_static(b"Internal Server Error"))
            }
        };

        self.finish(&exchange, response)
    }

    /// Inspection snapshot of the active route table
    pub fn describe_routes(&self) -> Vec<RouteDescription> {
        self.table.load().describe()
    }

    /// Tag, record, and log the outgoing response
    fn finish(&self, exchange: &Exchange, mut response: Response) -> Response {
        if let Err(e) = response
            .header
            .insert_header("x-request-id", exchange.request_id.as_str())
        {
            debug!("Failed to tag response with request id: {}", e);
        }

        let status = response.status();
        let duration = exchange.duration();
        self.observer.on_response(status, duration);

        let log_level = if status >= 500 {
            log::Level::Error
        } else if status >= 400 {
            log::Level::Warn
        } else {
            log::Level::Info
        };

        log::log!(
            log_level,
            "Request {} completed: {} {} -> {} ({}ms) [{}]",
            exchange.request_id,
            exchange.request.method,
            exchange.request.uri.path(),
            status,
            duration.as_millis(),
            exchange.route_id.as_deref().unwrap_or("no-route")
        );

        response
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(task) = self.eviction_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterInstance, GatewayFilter};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct EchoForwarder;

    #[async_trait]
    impl Forwarder for EchoForwarder {
        async fn forward(&self, _exchange: &Exchange, target: &str) -> Result<Response> {
            Ok(Response::plain_text(200, Bytes::from(format!("from:{}", target))))
        }
    }

    struct BoomFilter;

    #[async_trait]
    impl GatewayFilter for BoomFilter {
        async fn filter(&self, _exchange: &mut Exchange, _chain: Chain<'_>) -> Result<()> {
            Err(anyhow!("boom"))
        }
    }

    struct BoomFactory;

    impl FilterFactory for BoomFactory {
        fn name(&self) -> &str {
            "Boom"
        }

        fn build(&self, _args: &serde_json::Value) -> Result<FilterInstance> {
            Ok(FilterInstance::new(Arc::new(BoomFilter)))
        }
    }

    fn parse_config(yaml: &str) -> GatewayConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    async fn make_gateway(yaml: &str) -> Gateway {
        GatewayBuilder::new(Arc::new(EchoForwarder))
            .build(&parse_config(yaml))
            .await
            .unwrap()
    }

    fn make_request(method: &str, path: &str) -> RequestHeader {
        RequestHeader::build(method, path.as_bytes(), None).unwrap()
    }

    fn client() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    const USERS_ROUTE: &str = r#"
routes:
  - id: users
    predicates:
      - name: Path
        args: { pattern: "/users/**" }
    target: "http://users:8080"
"#;

    #[tokio::test]
    async fn test_handle_forwards_matched_request() {
        let gateway = make_gateway(USERS_ROUTE).await;
        let response = gateway.handle(make_request("GET", "/users/1"), client()).await;

        assert_eq!(response.status(), 200);
        assert_eq!(response.body, Bytes::from("from:http://users:8080"));
        assert!(response.header.headers.get("x-request-id").is_some());
    }

    #[tokio::test]
    async fn test_handle_unmatched_returns_404() {
        let gateway = make_gateway(USERS_ROUTE).await;
        let response = gateway.handle(make_request("GET", "/missing"), client()).await;

        assert_eq!(response.status(), 404);
        assert_eq!(response.body, Bytes::from_static(b"Not Found"));
    }

    #[tokio::test]
    async fn test_filter_failure_returns_500() {
        let config = parse_config(
            r#"
routes:
  - id: users
    predicates:
      - name: Path
        args: { pattern: "/users/**" }
    filters:
      - name: Boom
    target: "http://users:8080"
"#,
        );
        let gateway = GatewayBuilder::new(Arc::new(EchoForwarder))
            .register_filter(Arc::new(BoomFactory))
            .build(&config)
            .await
            .unwrap();

        let response = gateway.handle(make_request("GET", "/users/1"), client()).await;
        assert_eq!(response.status(), 500);
        assert_eq!(response.body, Bytes::from_static(b"Internal Server Error"));
    }

    #[tokio::test]
    async fn test_apply_routes_swaps_table() {
        let gateway = make_gateway(USERS_ROUTE).await;
        assert_eq!(
            gateway.handle(make_request("GET", "/users/1"), client()).await.status(),
            200
        );

        gateway
            .apply_routes(&parse_config(
                r#"
routes:
  - id: shares
    predicates:
      - name: Path
        args: { pattern: "/shares/**" }
    target: "http://shares:8080"
"#,
            ))
            .unwrap();

        assert_eq!(
            gateway.handle(make_request("GET", "/users/1"), client()).await.status(),
            404
        );
        assert_eq!(
            gateway.handle(make_request("GET", "/shares/1"), client()).await.status(),
            200
        );
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_serving_old_table() {
        let gateway = make_gateway(USERS_ROUTE).await;

        let err = gateway
            .apply_routes(&parse_config(
                r#"
routes:
  - id: broken
    predicates:
      - name: Nope
    target: "http://b:8080"
"#,
            ))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown predicate factory"));

        let response = gateway.handle(make_request("GET", "/users/1"), client()).await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_describe_routes_reflects_active_table() {
        let gateway = make_gateway(USERS_ROUTE).await;
        let descriptions = gateway.describe_routes();

        assert_eq!(descriptions.len(), 1);
        assert_eq!(descriptions[0].id, "users");
        assert_eq!(descriptions[0].target, "http://users:8080");
    }
}
