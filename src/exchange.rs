/// Per-request exchange state carried through the filter chain
use bytes::Bytes;
use pingora_http::{RequestHeader, ResponseHeader};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global counter for request ID generation
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A synthesized or upstream response: status line, headers, and body
#[derive(Debug, Clone)]
pub struct Response {
    /// Response headers
    pub header: ResponseHeader,
    /// Response body
    pub body: Bytes,
}

impl Response {
    /// Build a response with the given status and a plain-text body.
    ///
    /// Panics if `status` is not a valid HTTP status code; callers pass
    /// well-known constants (404, 429, 500, 502).
    pub fn plain_text(status: u16, body: Bytes) -> Self {
        let mut header = ResponseHeader::build(status, None).unwrap();
        header.insert_header("content-type", "text/plain").unwrap();
        Self { header, body }
    }

    /// HTTP status code of this response
    pub fn status(&self) -> u16 {
        self.header.status.as_u16()
    }
}

/// Request state that travels through routing, filtering, and forwarding.
///
/// An exchange is exclusively owned by the task handling one request.
/// Filters mutate it in place; nothing they change is visible to any
/// other in-flight request.
pub struct Exchange {
    /// The inbound request head, mutated by request filters before forwarding
    pub request: RequestHeader,
    /// The response, set by the forwarder or by a short-circuiting filter
    pub response: Option<Response>,
    /// Client socket address
    pub client_addr: SocketAddr,
    /// Unique request ID for tracing
    pub request_id: String,
    /// ID of the route that matched this request
    pub route_id: Option<String>,
    /// Request start time
    pub start_time: Instant,
    /// Custom attributes for filters (only allocated when needed)
    attributes: Option<std::collections::HashMap<String, String>>,
}

impl Exchange {
    /// Create a new exchange for an inbound request
    pub fn new(request: RequestHeader, client_addr: SocketAddr) -> Self {
        let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let request_id = format!(
            "req-{:016x}-{:08x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            counter
        );

        Self {
            request,
            response: None,
            client_addr,
            request_id,
            route_id: None,
            start_time: Instant::now(),
            attributes: None,
        }
    }

    /// Elapsed time since the exchange was created
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// True once a response has been produced
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Replace the response, discarding any previous one
    pub fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }

    /// Set an attribute value (allocates the map on first use)
    pub fn set_attribute(&mut self, key: String, value: String) {
        self.attributes
            .get_or_insert_with(std::collections::HashMap::new)
            .insert(key, value);
    }

    /// Get an attribute value
    pub fn attribute(&self, key: &str) -> Option<&String> {
        self.attributes.as_ref()?.get(key)
    }

    /// First value of a request header, if present and valid UTF-8
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a query parameter, if present
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.request.uri.query().unwrap_or("");
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.to_string())
    }
}
