/// Route predicates and their factories
use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveTime};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::exchange::Exchange;

/// A compiled predicate evaluated against an inbound request.
///
/// Predicates are pure: they inspect the exchange (and the clock) and
/// never mutate anything. A route matches when all of its predicates
/// return true, evaluated in declaration order with short-circuiting.
pub trait RoutePredicate: Send + Sync {
    /// Check whether this predicate holds for the given exchange
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl std::fmt::Debug for dyn RoutePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn RoutePredicate")
    }
}

/// Builds predicates from rule arguments, looked up by name
pub trait PredicateFactory: Send + Sync {
    /// Factory name as referenced in rule definitions
    fn name(&self) -> &str;

    /// Build a predicate from the rule's argument value
    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>>;
}

/// Registry of predicate factories, populated at startup and read-only
/// while requests are being served
pub struct PredicateRegistry {
    factories: HashMap<String, Arc<dyn PredicateFactory>>,
}

impl PredicateRegistry {
    /// Create a registry with all built-in predicate factories
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(Arc::new(PathPredicateFactory));
        registry.register(Arc::new(MethodPredicateFactory));
        registry.register(Arc::new(HeaderPredicateFactory));
        registry.register(Arc::new(HostPredicateFactory));
        registry.register(Arc::new(QueryPredicateFactory));
        registry.register(Arc::new(TimeBetweenPredicateFactory));
        registry
    }

    /// Register a factory under its own name, replacing any previous one
    pub fn register(&mut self, factory: Arc<dyn PredicateFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    /// Build a predicate by factory name
    pub fn build(&self, name: &str, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("Unknown predicate factory: {}", name))?;
        factory.build(args)
    }

    /// Check whether a factory is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Convert a glob-like pattern to an anchored regex pattern
pub(crate) fn glob_to_regex(pattern: &str) -> Result<String> {
    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    // ** means match anything including path separators
                    chars.next(); // consume the second *
                    regex.push_str(".*");
                } else {
                    // * means match anything except path separators
                    regex.push_str("[^/]*");
                }
            }
            '?' => {
                regex.push_str("[^/]");
            }
            '[' => {
                regex.push('[');
                // Copy character class as-is
                for ch in chars.by_ref() {
                    regex.push(ch);
                    if ch == ']' {
                        break;
                    }
                }
            }
            // Escape regex special characters
            '.' | '+' | '(' | ')' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => {
                regex.push(ch);
            }
        }
    }

    regex.push('$');
    Ok(regex)
}

/// Compile a path or host pattern: raw regex passthrough for `^...$`
/// patterns, glob conversion otherwise
fn compile_pattern(pattern: &str) -> Result<Regex> {
    let regex_pattern = if pattern.starts_with('^') && pattern.ends_with('$') {
        pattern.to_string()
    } else {
        glob_to_regex(pattern)?
    };
    Regex::new(&regex_pattern).map_err(|e| anyhow!("Invalid pattern '{}': {}", pattern, e))
}

// ---------------------------------------------------------------------------
// Path

#[derive(Debug, Deserialize)]
struct PathArgs {
    pattern: String,
}

struct PathPredicate {
    regex: Regex,
}

impl RoutePredicate for PathPredicate {
    fn matches(&self, exchange: &Exchange) -> bool {
        self.regex.is_match(exchange.request.uri.path())
    }
}

/// Matches the request path against a glob pattern (`*` one segment,
/// `**` any tail, `?` one character) or a raw `^...$` regex
pub struct PathPredicateFactory;

impl PredicateFactory for PathPredicateFactory {
    fn name(&self) -> &str {
        "Path"
    }

    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let args: PathArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for Path predicate".to_string())?;
        let regex = compile_pattern(&args.pattern)?;
        Ok(Arc::new(PathPredicate { regex }))
    }
}

// ---------------------------------------------------------------------------
// Method

#[derive(Debug, Deserialize)]
struct MethodArgs {
    methods: Vec<String>,
}

struct MethodPredicate {
    methods: Vec<String>,
}

impl RoutePredicate for MethodPredicate {
    fn matches(&self, exchange: &Exchange) -> bool {
        let method = exchange.request.method.as_str();
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Matches one of the listed HTTP methods, case-insensitively
pub struct MethodPredicateFactory;

impl PredicateFactory for MethodPredicateFactory {
    fn name(&self) -> &str {
        "Method"
    }

    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let args: MethodArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for Method predicate".to_string())?;
        if args.methods.is_empty() {
            return Err(anyhow!("Method predicate requires at least one method"));
        }
        Ok(Arc::new(MethodPredicate {
            methods: args.methods,
        }))
    }
}

// ---------------------------------------------------------------------------
// Header

#[derive(Debug, Deserialize)]
struct HeaderArgs {
    header: String,
    regexp: Option<String>,
}

struct HeaderPredicate {
    name: String,
    value_regex: Option<Regex>,
}

impl RoutePredicate for HeaderPredicate {
    fn matches(&self, exchange: &Exchange) -> bool {
        match exchange.request_header(&self.name) {
            Some(value) => match &self.value_regex {
                Some(regex) => regex.is_match(value),
                None => true,
            },
            None => false,
        }
    }
}

/// Matches when a request header is present, optionally constraining its
/// value with a regex
pub struct HeaderPredicateFactory;

impl PredicateFactory for HeaderPredicateFactory {
    fn name(&self) -> &str {
        "Header"
    }

    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let args: HeaderArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for Header predicate".to_string())?;
        let value_regex = args
            .regexp
            .map(|r| Regex::new(&r).map_err(|e| anyhow!("Invalid header regex '{}': {}", r, e)))
            .transpose()?;
        Ok(Arc::new(HeaderPredicate {
            name: args.header,
            value_regex,
        }))
    }
}

// ---------------------------------------------------------------------------
// Host

#[derive(Debug, Deserialize)]
struct HostArgs {
    pattern: String,
}

struct HostPredicate {
    regex: Regex,
}

impl RoutePredicate for HostPredicate {
    fn matches(&self, exchange: &Exchange) -> bool {
        match exchange.request_header("host") {
            Some(host) => self.regex.is_match(host),
            None => false,
        }
    }
}

/// Matches the Host header against a glob pattern such as `*.example.com`
pub struct HostPredicateFactory;

impl PredicateFactory for HostPredicateFactory {
    fn name(&self) -> &str {
        "Host"
    }

    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let args: HostArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for Host predicate".to_string())?;
        let regex = compile_pattern(&args.pattern)?;
        Ok(Arc::new(HostPredicate { regex }))
    }
}

// ---------------------------------------------------------------------------
// Query

#[derive(Debug, Deserialize)]
struct QueryArgs {
    param: String,
    value: Option<String>,
}

struct QueryPredicate {
    param: String,
    value: Option<String>,
}

impl RoutePredicate for QueryPredicate {
    fn matches(&self, exchange: &Exchange) -> bool {
        match exchange.query_param(&self.param) {
            Some(actual) => match &self.value {
                Some(expected) => &actual == expected,
                None => true,
            },
            None => false,
        }
    }
}

/// Matches when a query parameter is present, optionally requiring an
/// exact value
pub struct QueryPredicateFactory;

impl PredicateFactory for QueryPredicateFactory {
    fn name(&self) -> &str {
        "Query"
    }

    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let args: QueryArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for Query predicate".to_string())?;
        Ok(Arc::new(QueryPredicate {
            param: args.param,
            value: args.value,
        }))
    }
}

// ---------------------------------------------------------------------------
// TimeBetween

#[derive(Debug, Deserialize)]
struct TimeBetweenArgs {
    start: String,
    end: String,
}

struct TimeBetweenPredicate {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeBetweenPredicate {
    /// Half-open window check: `[start, end)` in local time. A window
    /// whose start is later than its end wraps past midnight; equal
    /// start and end denote an empty window that never matches.
    fn contains(&self, now: NaiveTime) -> bool {
        if self.start == self.end {
            false
        } else if self.start < self.end {
            now >= self.start && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

impl RoutePredicate for TimeBetweenPredicate {
    fn matches(&self, _exchange: &Exchange) -> bool {
        self.contains(Local::now().time())
    }
}

fn parse_local_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| anyhow!("Invalid time '{}': {}", s, e))
}

/// Matches only while the local wall clock is inside `[start, end)`.
/// Windows may wrap midnight, e.g. start 22:00 end 06:00.
pub struct TimeBetweenPredicateFactory;

impl PredicateFactory for TimeBetweenPredicateFactory {
    fn name(&self) -> &str {
        "TimeBetween"
    }

    fn build(&self, args: &serde_json::Value) -> Result<Arc<dyn RoutePredicate>> {
        let args: TimeBetweenArgs = serde_json::from_value(args.clone())
            .with_context(|| "Invalid arguments for TimeBetween predicate".to_string())?;
        let start = parse_local_time(&args.start)?;
        let end = parse_local_time(&args.end)?;
        Ok(Arc::new(TimeBetweenPredicate { start, end }))
    }
}
