/// Filter chain assembly and execution
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error};
use serde::Serialize;
use std::sync::Arc;

use crate::config::FilterDef;
use crate::exchange::{Exchange, Response};
use crate::filter::{FilterRegistry, GatewayFilter};

/// Terminal step of every filter chain: hands the filtered request to
/// the upstream identified by the route's target and returns its
/// response. Connection handling, retries, and timeouts live behind
/// this seam, outside the engine.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward the request head to the target and return the upstream
    /// response
    async fn forward(&self, exchange: &Exchange, target: &str) -> Result<Response>;
}

/// Scope a filter was declared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterScope {
    /// Declared in the table-wide default filter list
    Default,
    /// Declared on the route itself
    Route,
}

impl FilterScope {
    fn label(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Route => "route",
        }
    }
}

/// A built filter with its resolved chain position
#[derive(Debug)]
pub struct AssembledFilter {
    /// Factory name the filter was built from
    pub name: String,
    /// Where the filter was declared
    pub scope: FilterScope,
    /// Effective order: factory-requested, or 1-based declaration
    /// position within its scope
    pub order: i32,
    /// The filter itself
    pub filter: Arc<dyn GatewayFilter>,
}

/// Build the executable chain for one route.
///
/// Filters in each scope receive orders 1..=n by declaration position
/// unless their factory requested an explicit order. The combined list
/// is stable-sorted ascending by order, so default filters run before
/// route filters when orders tie. Any unknown factory name or invalid
/// argument fails the whole build.
pub fn assemble_chain(
    registry: &FilterRegistry,
    default_filters: &[FilterDef],
    route_filters: &[FilterDef],
    route_id: &str,
) -> Result<Vec<AssembledFilter>> {
    let mut assembled = Vec::with_capacity(default_filters.len() + route_filters.len());

    let scopes = [
        (FilterScope::Default, default_filters),
        (FilterScope::Route, route_filters),
    ];
    for (scope, defs) in scopes {
        for (position, def) in defs.iter().enumerate() {
            let instance = registry.build(&def.name, &def.args).with_context(|| {
                format!(
                    "Route '{}': failed to build {} filter '{}'",
                    route_id,
                    scope.label(),
                    def.name
                )
            })?;
            assembled.push(AssembledFilter {
                name: def.name.clone(),
                scope,
                order: instance.order.unwrap_or(position as i32 + 1),
                filter: instance.filter,
            });
        }
    }

    // Stable sort keeps defaults ahead of route filters on equal orders
    assembled.sort_by_key(|f| f.order);
    Ok(assembled)
}

/// Cursor over the remaining filters of a chain.
///
/// Each filter receives the chain positioned after itself and calls
/// `proceed` to run the rest; past the last filter, `proceed` invokes
/// the forwarder. A filter that returns without calling `proceed`
/// short-circuits everything downstream, including the upstream call.
///
/// The cursor is `Copy`, so a filter may run the rest of the chain
/// more than once; retry middleware clears the exchange's response and
/// proceeds again.
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    filters: &'a [AssembledFilter],
    forwarder: &'a Arc<dyn Forwarder>,
    target: &'a str,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        filters: &'a [AssembledFilter],
        forwarder: &'a Arc<dyn Forwarder>,
        target: &'a str,
    ) -> Self {
        Self {
            filters,
            forwarder,
            target,
        }
    }

    /// Run the rest of the chain on this exchange.
    ///
    /// At the terminal position this calls the forwarder, unless a
    /// response was already set earlier in the chain. A forwarder
    /// failure becomes a synthesized 502 response rather than an error.
    pub async fn proceed(self, exchange: &mut Exchange) -> Result<()> {
        match self.filters.split_first() {
            Some((current, rest)) => {
                debug!(
                    "Request {} running filter {}",
                    exchange.request_id, current.name
                );
                let next = Chain {
                    filters: rest,
                    forwarder: self.forwarder,
                    target: self.target,
                };
                current.filter.filter(exchange, next).await
            }
            None => {
                if exchange.has_response() {
                    return Ok(());
                }
                match self.forwarder.forward(exchange, self.target).await {
                    Ok(response) => {
                        exchange.set_response(response);
                        Ok(())
                    }
                    Err(e) => {
                        error!(
                            "Request {} forward to '{}' failed: {}",
                            exchange.request_id, self.target, e
                        );
                        exchange.set_response(Response::plain_text(
                            502,
                            Bytes::from_static(b"Bad Gateway"),
                        ));
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use pingora_http::RequestHeader;
    use serde_json::json;
    use std::sync::Mutex;

    fn filter_def(name: &str, args: serde_json::Value) -> FilterDef {
        FilterDef {
            name: name.to_string(),
            args,
        }
    }

    fn make_exchange(path: &str) -> Exchange {
        let req = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        Exchange::new(req, "127.0.0.1:9000".parse().unwrap())
    }

    struct RecordingFilter {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GatewayFilter for RecordingFilter {
        async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:pre", self.label));
            chain.proceed(exchange).await?;
            self.log.lock().unwrap().push(format!("{}:post", self.label));
            Ok(())
        }
    }

    struct ShortCircuitFilter {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GatewayFilter for ShortCircuitFilter {
        async fn filter(&self, exchange: &mut Exchange, _chain: Chain<'_>) -> Result<()> {
            self.log.lock().unwrap().push("short:pre".to_string());
            exchange.set_response(Response::plain_text(
                401,
                Bytes::from_static(b"Unauthorized"),
            ));
            Ok(())
        }
    }

    struct RecordingForwarder {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        async fn forward(&self, _exchange: &Exchange, _target: &str) -> Result<Response> {
            self.log.lock().unwrap().push("forward".to_string());
            Ok(Response::plain_text(200, Bytes::from_static(b"ok")))
        }
    }

    struct FailingForwarder;

    #[async_trait]
    impl Forwarder for FailingForwarder {
        async fn forward(&self, _exchange: &Exchange, _target: &str) -> Result<Response> {
            Err(anyhow!("connection refused"))
        }
    }

    fn recording(
        label: &'static str,
        scope: FilterScope,
        order: i32,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> AssembledFilter {
        AssembledFilter {
            name: label.to_string(),
            scope,
            order,
            filter: Arc::new(RecordingFilter {
                label,
                log: log.clone(),
            }),
        }
    }

    #[test]
    fn test_positional_orders_interleave_scopes() {
        let registry = FilterRegistry::with_builtins();
        let defaults = vec![
            filter_def("PreLog", json!({ "name": "a", "value": "b" })),
            filter_def("AddRequestHeader", json!({ "name": "x-d", "value": "2" })),
        ];
        let route = vec![
            filter_def("SetRequestHeader", json!({ "name": "x-r", "value": "1" })),
            filter_def("RemoveRequestHeader", json!({ "name": "x-r2" })),
        ];

        let chain = assemble_chain(&registry, &defaults, &route, "users").unwrap();

        let layout: Vec<(&str, FilterScope, i32)> = chain
            .iter()
            .map(|f| (f.name.as_str(), f.scope, f.order))
            .collect();
        assert_eq!(
            layout,
            vec![
                ("PreLog", FilterScope::Default, 1),
                ("SetRequestHeader", FilterScope::Route, 1),
                ("AddRequestHeader", FilterScope::Default, 2),
                ("RemoveRequestHeader", FilterScope::Route, 2),
            ]
        );
    }

    #[test]
    fn test_explicit_order_overrides_position() {
        let registry = FilterRegistry::with_builtins();
        let defaults = vec![filter_def("PreLog", json!({ "name": "d", "value": "1" }))];
        let route = vec![
            filter_def("AddRequestHeader", json!({ "name": "x-a", "value": "1" })),
            filter_def("PreLog", json!({ "name": "r", "value": "2", "order": -5 })),
        ];

        let chain = assemble_chain(&registry, &defaults, &route, "users").unwrap();

        assert_eq!(chain[0].order, -5);
        assert_eq!(chain[0].scope, FilterScope::Route);
        assert_eq!(chain[1].name, "PreLog");
        assert_eq!(chain[1].scope, FilterScope::Default);
        assert_eq!(chain[2].name, "AddRequestHeader");
    }

    #[test]
    fn test_unknown_filter_fails_the_build() {
        let registry = FilterRegistry::with_builtins();
        let route = vec![filter_def("NoSuchFilter", json!({}))];

        let err = assemble_chain(&registry, &[], &route, "users").unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Route 'users'"));
        assert!(message.contains("NoSuchFilter"));
    }

    #[tokio::test]
    async fn test_execution_wraps_in_chain_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recording("d1", FilterScope::Default, 1, &log),
            recording("r1", FilterScope::Route, 1, &log),
            recording("d2", FilterScope::Default, 2, &log),
            recording("r2", FilterScope::Route, 2, &log),
        ];
        let forwarder: Arc<dyn Forwarder> = Arc::new(RecordingForwarder { log: log.clone() });

        let mut exchange = make_exchange("/users/1");
        Chain::new(&chain, &forwarder, "http://upstream")
            .proceed(&mut exchange)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "d1:pre", "r1:pre", "d2:pre", "r2:pre", "forward", "r2:post", "d2:post",
                "r1:post", "d1:post",
            ]
        );
        assert_eq!(exchange.response.as_ref().unwrap().status(), 200);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest_of_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            AssembledFilter {
                name: "short".to_string(),
                scope: FilterScope::Route,
                order: 1,
                filter: Arc::new(ShortCircuitFilter { log: log.clone() }),
            },
            recording("after", FilterScope::Route, 2, &log),
        ];
        let forwarder: Arc<dyn Forwarder> = Arc::new(RecordingForwarder { log: log.clone() });

        let mut exchange = make_exchange("/users/1");
        Chain::new(&chain, &forwarder, "http://upstream")
            .proceed(&mut exchange)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["short:pre"]);
        assert_eq!(exchange.response.as_ref().unwrap().status(), 401);
    }

    #[tokio::test]
    async fn test_forwarder_failure_becomes_502() {
        let forwarder: Arc<dyn Forwarder> = Arc::new(FailingForwarder);

        let mut exchange = make_exchange("/users/1");
        Chain::new(&[], &forwarder, "http://upstream")
            .proceed(&mut exchange)
            .await
            .unwrap();

        let response = exchange.response.as_ref().unwrap();
        assert_eq!(response.status(), 502);
        assert_eq!(response.body, Bytes::from_static(b"Bad Gateway"));
    }

    struct FlakyForwarder {
        calls: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Forwarder for FlakyForwarder {
        async fn forward(&self, _exchange: &Exchange, _target: &str) -> Result<Response> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(Response::plain_text(200, Bytes::from_static(b"ok")))
            }
        }
    }

    struct RetryOnceFilter;

    #[async_trait]
    impl GatewayFilter for RetryOnceFilter {
        async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> Result<()> {
            chain.proceed(exchange).await?;
            if exchange.response.as_ref().map(|r| r.status()) == Some(502) {
                exchange.response = None;
                chain.proceed(exchange).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_copy_chain_supports_retry_middleware() {
        let calls = Arc::new(Mutex::new(0));
        let chain = vec![AssembledFilter {
            name: "RetryOnce".to_string(),
            scope: FilterScope::Route,
            order: 1,
            filter: Arc::new(RetryOnceFilter),
        }];
        let forwarder: Arc<dyn Forwarder> = Arc::new(FlakyForwarder {
            calls: calls.clone(),
        });

        let mut exchange = make_exchange("/users/1");
        Chain::new(&chain, &forwarder, "http://upstream")
            .proceed(&mut exchange)
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(exchange.response.as_ref().unwrap().status(), 200);
    }

    #[tokio::test]
    async fn test_existing_response_suppresses_forwarding() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let forwarder: Arc<dyn Forwarder> = Arc::new(RecordingForwarder { log: log.clone() });

        let mut exchange = make_exchange("/users/1");
        exchange.set_response(Response::plain_text(204, Bytes::new()));
        Chain::new(&[], &forwarder, "http://upstream")
            .proceed(&mut exchange)
            .await
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(exchange.response.as_ref().unwrap().status(), 204);
    }
}
