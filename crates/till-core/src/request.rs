//! # Replay Requests
//!
//! Structured form of a mutating request captured at enqueue time.
//!
//! ## Reference Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Placeholder Substitution                             │
//! │                                                                         │
//! │  Captured offline:                                                     │
//! │    POST /sales/{local-7f..}/items                                      │
//! │    body: { "sale_id": "local-7f..", "product_id": "p-9", "qty": 2 }    │
//! │    body_refs: ["/sale_id"]                                             │
//! │                                                                         │
//! │  Substitution map (this pass + replicas):                              │
//! │    local-7f.. → 1042                                                   │
//! │                                                                         │
//! │  Replayed:                                                             │
//! │    POST /sales/1042/items                                              │
//! │    body: { "sale_id": "1042", "product_id": "p-9", "qty": 2 }          │
//! │                                                                         │
//! │  Only whole path segments and declared body locations are rewritten.  │
//! │  A note field that happens to contain "local-7f.." is left alone.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::types::{is_placeholder, HttpMethod};

/// One segment of a request path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PathSegment {
    /// Fixed text.
    Literal(String),
    /// Placeholder id to be replaced by the server id.
    Ref(String),
}

/// A JSON pointer into the request body whose string value is a resource id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRef {
    pub pointer: String,
}

/// Method, path and body of a queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub method: HttpMethod,
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body_refs: Vec<BodyRef>,
}

/// A request with every placeholder substituted, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
}

/// Maps placeholder ids to server ids.
pub trait IdResolver {
    fn server_id(&self, local_id: &str) -> Option<String>;
}

impl IdResolver for HashMap<String, String> {
    fn server_id(&self, local_id: &str) -> Option<String> {
        self.get(local_id).cloned()
    }
}

impl ReplayRequest {
    /// Builds a request from a path; segments that are placeholders become refs.
    ///
    /// ## Example
    /// ```rust
    /// use till_core::request::{PathSegment, ReplayRequest};
    /// use till_core::types::HttpMethod;
    ///
    /// let req = ReplayRequest::new(HttpMethod::Patch, "/sales/local-1");
    /// assert_eq!(req.path[1], PathSegment::Ref("local-1".into()));
    /// ```
    pub fn new(method: HttpMethod, path: &str) -> Self {
        let path = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if is_placeholder(s) {
                    PathSegment::Ref(s.to_string())
                } else {
                    PathSegment::Literal(s.to_string())
                }
            })
            .collect();

        ReplayRequest {
            method,
            path,
            body: None,
            body_refs: Vec::new(),
        }
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Declares a body location that holds a resource id.
    pub fn with_body_ref(mut self, pointer: impl Into<String>) -> Self {
        self.body_refs.push(BodyRef {
            pointer: pointer.into(),
        });
        self
    }

    /// Renders the path with placeholders in braces, for logs and storage.
    pub fn template(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            out.push('/');
            match segment {
                PathSegment::Literal(s) => out.push_str(s),
                PathSegment::Ref(id) => {
                    out.push('{');
                    out.push_str(id);
                    out.push('}');
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Returns every placeholder this request depends on, in first-seen order.
    pub fn local_references(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !refs.iter().any(|r| r == id) {
                refs.push(id.to_string());
            }
        };

        for segment in &self.path {
            if let PathSegment::Ref(id) = segment {
                push(id);
            }
        }

        if let Some(body) = &self.body {
            for r in &self.body_refs {
                if let Some(Value::String(id)) = body.pointer(&r.pointer) {
                    if is_placeholder(id) {
                        push(id);
                    }
                }
            }
        }

        refs
    }

    /// Substitutes placeholders using `resolver`.
    ///
    /// Path refs and declared body locations are rewritten by position; the
    /// rest of the body is copied untouched. A declared location that is
    /// absent from the body is skipped.
    pub fn resolve<R: IdResolver + ?Sized>(&self, resolver: &R) -> CoreResult<ResolvedRequest> {
        let lookup = |id: &str| -> CoreResult<String> {
            resolver
                .server_id(id)
                .ok_or_else(|| CoreError::UnresolvedReference {
                    local_id: id.to_string(),
                })
        };

        let mut path = String::new();
        for segment in &self.path {
            path.push('/');
            match segment {
                PathSegment::Literal(s) => path.push_str(s),
                PathSegment::Ref(id) => path.push_str(&lookup(id)?),
            }
        }
        if path.is_empty() {
            path.push('/');
        }

        let mut body = self.body.clone();
        if let Some(body) = body.as_mut() {
            for r in &self.body_refs {
                match body.pointer_mut(&r.pointer) {
                    None => continue,
                    Some(Value::String(id)) => {
                        if is_placeholder(id) {
                            *id = lookup(id)?;
                        }
                    }
                    Some(_) => {
                        return Err(CoreError::InvalidBodyRef {
                            pointer: r.pointer.clone(),
                        })
                    }
                }
            }
        }

        Ok(ResolvedRequest {
            method: self.method,
            path,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> HashMap<String, String> {
        HashMap::from([("local-a".to_string(), "1042".to_string())])
    }

    #[test]
    fn test_path_parsing_detects_placeholders() {
        let req = ReplayRequest::new(HttpMethod::Post, "/sales/local-a/items/");
        assert_eq!(
            req.path,
            vec![
                PathSegment::Literal("sales".into()),
                PathSegment::Ref("local-a".into()),
                PathSegment::Literal("items".into()),
            ]
        );
        assert_eq!(req.template(), "/sales/{local-a}/items");
    }

    #[test]
    fn test_resolve_rewrites_path_and_declared_fields_only() {
        let req = ReplayRequest::new(HttpMethod::Post, "/sales/local-a/items")
            .with_body(json!({
                "sale_id": "local-a",
                "note": "split from local-a",
                "qty": 2
            }))
            .with_body_ref("/sale_id");

        let resolved = req.resolve(&resolver()).unwrap();
        assert_eq!(resolved.path, "/sales/1042/items");
        let body = resolved.body.unwrap();
        assert_eq!(body["sale_id"], "1042");
        assert_eq!(body["note"], "split from local-a");
        assert_eq!(body["qty"], 2);
    }

    #[test]
    fn test_resolve_nested_pointer() {
        let req = ReplayRequest::new(HttpMethod::Post, "/payments")
            .with_body(json!({ "target": { "sale": "local-a" } }))
            .with_body_ref("/target/sale");

        let body = req.resolve(&resolver()).unwrap().body.unwrap();
        assert_eq!(body["target"]["sale"], "1042");
    }

    #[test]
    fn test_unresolved_reference() {
        let req = ReplayRequest::new(HttpMethod::Delete, "/sales/local-zzz");
        let err = req.resolve(&resolver()).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnresolvedReference {
                local_id: "local-zzz".into()
            }
        );
    }

    #[test]
    fn test_server_ids_pass_through() {
        let req = ReplayRequest::new(HttpMethod::Patch, "/sales/991")
            .with_body(json!({ "customer_id": "c-1" }))
            .with_body_ref("/customer_id")
            .with_body_ref("/missing");

        let resolved = req.resolve(&HashMap::new()).unwrap();
        assert_eq!(resolved.path, "/sales/991");
        assert_eq!(resolved.body.unwrap()["customer_id"], "c-1");
    }

    #[test]
    fn test_non_string_ref_is_rejected() {
        let req = ReplayRequest::new(HttpMethod::Post, "/items")
            .with_body(json!({ "sale_id": 7 }))
            .with_body_ref("/sale_id");
        assert!(matches!(
            req.resolve(&resolver()),
            Err(CoreError::InvalidBodyRef { .. })
        ));
    }

    #[test]
    fn test_local_references_deduplicated() {
        let req = ReplayRequest::new(HttpMethod::Post, "/sales/local-a/items")
            .with_body(json!({ "sale_id": "local-a", "customer_id": "local-b" }))
            .with_body_ref("/sale_id")
            .with_body_ref("/customer_id");
        assert_eq!(req.local_references(), vec!["local-a", "local-b"]);
    }

    #[test]
    fn test_serde_shape() {
        let req = ReplayRequest::new(HttpMethod::Patch, "/sales/local-a");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "PATCH");
        assert_eq!(json["path"][1]["type"], "ref");
        let back: ReplayRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
