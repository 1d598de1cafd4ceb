//! The inbound request as seen by the protocol layer.
//!
//! [`RequestContext`] is one concrete struct; the capability traits below let
//! filters and adapters depend only on the slice of the request they need.
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use percent_encoding::percent_decode_str;
use std::sync::OnceLock;

use super::conditional::Preconditions;
use super::error::ProtocolError;
use super::media_type::{self, MediaType};
use crate::model::{xml, Entry};
use crate::util::decode_slug;

// ============================================================================
// Capability Traits
// ============================================================================

/// Read access to a header map.
pub trait HeaderAccess {
    fn headers(&self) -> &HeaderMap;

    /// First value of `name`, if present and valid visible ASCII.
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a repeated header, in arrival order.
    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }
}

/// Access to the request's conditional headers.
pub trait ConditionalHeaders: HeaderAccess {
    fn preconditions(&self) -> Preconditions {
        Preconditions::from_headers(self.headers())
    }
}

/// Access to the request body.
pub trait BodyAccess {
    fn body(&self) -> &Bytes;

    fn content_type(&self) -> Option<MediaType>;

    /// The body parsed as an entry. Parsed at most once per request.
    fn entry(&self) -> Result<&Entry, ProtocolError>;
}

// ============================================================================
// Request Context
// ============================================================================

#[derive(Debug)]
pub struct RequestContext {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    base_uri: Option<String>,
    entry: OnceLock<Result<Entry, String>>,
}

impl RequestContext {
    /// Builds a context from a method and a request target such as
    /// `/atom/blog?page=2`. The path is percent-decoded; query pairs are
    /// form-decoded and kept in order.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
        let query = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            base_uri: None,
            entry: OnceLock::new(),
        }
    }

    /// Adds a header. Invalid names or values are dropped with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid request header"),
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.entry = OnceLock::new();
        self
    }

    /// Scheme and authority (`http://host:port`) used to absolutize links.
    pub fn with_base_uri(mut self, base: impl Into<String>) -> Self {
        self.base_uri = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn base_uri(&self) -> Option<&str> {
        self.base_uri.as_deref()
    }

    /// Prefixes `path` with the base URI when one is known.
    pub fn absolute(&self, path: &str) -> String {
        match &self.base_uri {
            Some(base) if path.starts_with('/') => format!("{base}{path}"),
            _ => path.to_string(),
        }
    }

    /// The decoded AtomPub `Slug` header, if present and non-empty.
    pub fn slug(&self) -> Option<String> {
        self.header("slug")
            .map(decode_slug)
            .filter(|s| !s.is_empty())
    }

    pub fn accepts_json(&self) -> bool {
        media_type::prefers_json(self.header("accept"))
    }

    fn parse_entry(&self) -> Result<Entry, String> {
        if self.body.is_empty() {
            return Err("request body is empty".to_string());
        }
        let is_json = self.content_type().is_some_and(|ct| ct.is_json());
        if is_json {
            serde_json::from_slice(&self.body)
                .map_err(|e| format!("invalid JSON entry: {e}"))
        } else {
            xml::parse_entry(&self.body).map_err(|e| e.to_string())
        }
    }
}

impl HeaderAccess for RequestContext {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl ConditionalHeaders for RequestContext {}

impl BodyAccess for RequestContext {
    fn body(&self) -> &Bytes {
        &self.body
    }

    fn content_type(&self) -> Option<MediaType> {
        self.header("content-type").and_then(|ct| ct.parse().ok())
    }

    fn entry(&self) -> Result<&Entry, ProtocolError> {
        match self.entry.get_or_init(|| self.parse_entry()) {
            Ok(entry) => Ok(entry),
            Err(msg) => Err(ProtocolError::BadRequest(msg.clone())),
        }
    }
}
