/// Route table construction and first-match lookup
use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::chain::{assemble_chain, AssembledFilter, FilterScope};
use crate::config::{FilterDef, GatewayConfig, RouteDef};
use crate::exchange::Exchange;
use crate::filter::FilterRegistry;
use crate::predicate::{PredicateRegistry, RoutePredicate};

/// A fully built route: compiled predicates plus its assembled filter
/// chain. Both are built once at load time; lookup never compiles or
/// sorts anything.
pub struct Route {
    /// Unique route identifier
    pub id: String,
    /// Evaluation priority; lower values are tried first
    pub order: i32,
    /// Upstream target requests are forwarded to
    pub target: String,
    /// Predicates, all of which must accept the request
    predicates: Vec<Arc<dyn RoutePredicate>>,
    /// Predicate names in declaration order, for inspection
    predicate_names: Vec<String>,
    /// Filter chain in execution order
    pub filters: Vec<AssembledFilter>,
}

impl Route {
    /// True when every predicate accepts the exchange. Evaluation stops
    /// at the first rejection.
    pub fn matches(&self, exchange: &Exchange) -> bool {
        self.predicates.iter().all(|p| p.matches(exchange))
    }
}

/// Immutable snapshot of all routes in evaluation order
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field(
                "routes",
                &self.routes.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RouteTable {
    /// Build every route in the config, or fail without producing a
    /// table. A single bad rule never yields a partially built table.
    pub fn build(
        config: &GatewayConfig,
        predicates: &PredicateRegistry,
        filters: &FilterRegistry,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &config.routes {
            if !seen.insert(def.id.as_str()) {
                return Err(anyhow!("Duplicate route id: {}", def.id));
            }
        }

        let mut routes = Vec::with_capacity(config.routes.len());
        for def in &config.routes {
            let route = build_route(def, &config.default_filters, predicates, filters)
                .with_context(|| format!("Failed to build route '{}'", def.id))?;
            routes.push(Arc::new(route));
        }

        // Stable sort keeps declaration order for routes with equal priority
        routes.sort_by_key(|r| r.order);

        Ok(Self { routes })
    }

    /// First route whose predicates all accept the exchange
    pub fn find(&self, exchange: &Exchange) -> Option<Arc<Route>> {
        for route in &self.routes {
            if route.matches(exchange) {
                debug!(
                    "Request {} matched route '{}'",
                    exchange.request_id, route.id
                );
                return Some(route.clone());
            }
        }
        None
    }

    /// Number of routes in the table
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Inspection snapshot of every route, in evaluation order
    pub fn describe(&self) -> Vec<RouteDescription> {
        self.routes
            .iter()
            .map(|route| RouteDescription {
                id: route.id.clone(),
                order: route.order,
                target: route.target.clone(),
                predicates: route.predicate_names.clone(),
                filters: route
                    .filters
                    .iter()
                    .map(|f| FilterDescription {
                        name: f.name.clone(),
                        scope: f.scope,
                        order: f.order,
                    })
                    .collect(),
            })
            .collect()
    }
}

fn build_route(
    def: &RouteDef,
    default_filters: &[FilterDef],
    predicates: &PredicateRegistry,
    filters: &FilterRegistry,
) -> Result<Route> {
    let mut compiled = Vec::with_capacity(def.predicates.len());
    let mut predicate_names = Vec::with_capacity(def.predicates.len());
    for pred in &def.predicates {
        let built = predicates
            .build(&pred.name, &pred.args)
            .with_context(|| format!("Failed to build {} predicate", pred.name))?;
        compiled.push(built);
        predicate_names.push(pred.name.clone());
    }

    let chain = assemble_chain(filters, default_filters, &def.filters, &def.id)?;

    Ok(Route {
        id: def.id.clone(),
        order: def.order,
        target: def.target.clone(),
        predicates: compiled,
        predicate_names,
        filters: chain,
    })
}

/// One filter position in a route's chain, for inspection
#[derive(Debug, Clone, Serialize)]
pub struct FilterDescription {
    pub name: String,
    pub scope: FilterScope,
    pub order: i32,
}

/// Inspection view of a single route
#[derive(Debug, Clone, Serialize)]
pub struct RouteDescription {
    pub id: String,
    pub order: i32,
    pub target: String,
    pub predicates: Vec<String>,
    pub filters: Vec<FilterDescription>,
}
