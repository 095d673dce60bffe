//! # HTTP Transport
//!
//! The seam between the engine and the network. Everything above this
//! module speaks [`HttpRequest`] / [`HttpResponse`]; tests swap in an
//! in-process server by implementing [`SyncTransport`].
//!
//! ## Outcome Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     What the transport reports                          │
//! │                                                                         │
//! │  send(request)                                                         │
//! │     │                                                                   │
//! │     ├── response received (any status) ─► Ok(HttpResponse)             │
//! │     │                                                                   │
//! │     ├── connect refused / DNS ──────────► Err(TransportError::Connect) │
//! │     ├── timeout ────────────────────────► Err(TransportError::Timeout) │
//! │     └── anything else ──────────────────► Err(TransportError::Request) │
//! │                                                                         │
//! │  Status classification (2xx / 4xx / 5xx) happens one layer up.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use till_core::HttpMethod;

use crate::error::{SyncResult, TransportError};

// =============================================================================
// Request / Response
// =============================================================================

/// One outgoing HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path relative to the server base URL, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        HttpRequest {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A response that reached the client, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl HttpResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        HttpResponse { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Short error text for logs and the mutation log.
    ///
    /// Prefers a `message` or `error` field of a JSON body.
    pub fn error_message(&self) -> String {
        match &self.body {
            Some(Value::Object(map)) => ["message", "error"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(String::from)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => format!("HTTP {}", self.status),
        }
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Sends one request to the authoritative server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

// =============================================================================
// reqwest Implementation
// =============================================================================

/// [`SyncTransport`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    /// Creates a transport with a per-request timeout.
    pub fn new(base_url: Url, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(HttpTransport { client, base_url })
    }

    /// Joins `path` onto the base URL, keeping any base path prefix.
    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{}/{}", base, path)).map_err(|e| TransportError::Request(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut url = self.url_for(&request.path)?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        Ok(HttpResponse {
            status,
            body: parse_body(&text),
        })
    }
}

fn parse_body(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_join_keeps_base_path() {
        let transport = HttpTransport::new(
            Url::parse("https://api.example.com/v1/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            transport.url_for("/sales/12").unwrap().as_str(),
            "https://api.example.com/v1/sales/12"
        );
    }

    #[test]
    fn test_request_builders() {
        let req = HttpRequest::get("/sync/changes")
            .with_query("since", "2024-01-01T00:00:00Z")
            .with_header("X-Store-Id", "s1");
        assert_eq!(req.header("x-store-id"), Some("s1"));
        assert_eq!(req.query_param("since"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(req.header("Idempotency-Key"), None);
    }

    #[test]
    fn test_error_message() {
        let resp = HttpResponse::new(422, Some(json!({ "message": "total mismatch" })));
        assert!(!resp.is_success());
        assert_eq!(resp.error_message(), "total mismatch");
        assert_eq!(HttpResponse::new(503, None).error_message(), "HTTP 503");
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(""), None);
        assert_eq!(parse_body("{\"id\":1}"), Some(json!({ "id": 1 })));
        assert_eq!(parse_body("oops"), Some(json!("oops")));
    }
}
