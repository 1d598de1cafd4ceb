//! The outbound response built by the provider.
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::sync::OnceLock;

use super::cache_control::CacheControl;
use super::conditional::format_http_date;
use super::error::{ErrorBody, ProtocolError};
use super::etag::EntityTag;
use super::media_type;
use super::request::HeaderAccess;
use crate::model::{xml, Categories, Entry, Feed, Service};

/// Wire representation selected for documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Atom,
    Json,
}

/// The document (or bytes) carried by a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Feed(Feed),
    Entry(Box<Entry>),
    Service(Service),
    Categories(Categories),
    Media { content_type: String, bytes: Bytes },
    Error(ErrorBody),
}

impl Entity {
    /// Content type of this entity in `format`. Errors are always JSON.
    pub fn content_type(&self, format: Format) -> String {
        match (self, format) {
            (Self::Media { content_type, .. }, _) => content_type.clone(),
            (Self::Error(_), _) | (_, Format::Json) => media_type::JSON.to_string(),
            (Self::Feed(_), Format::Atom) => media_type::ATOM_FEED.to_string(),
            (Self::Entry(_), Format::Atom) => media_type::ATOM_ENTRY.to_string(),
            (Self::Service(_), Format::Atom) => media_type::ATOM_SERVICE.to_string(),
            (Self::Categories(_), Format::Atom) => media_type::ATOM_CATEGORIES.to_string(),
        }
    }

    pub fn serialize(&self, format: Format) -> Result<Bytes, ProtocolError> {
        let json = |value: serde_json::Result<Vec<u8>>| {
            value.map(Bytes::from).map_err(ProtocolError::internal)
        };
        match (self, format) {
            (Self::Media { bytes, .. }, _) => Ok(bytes.clone()),
            (Self::Error(body), _) => json(serde_json::to_vec(body)),
            (Self::Feed(feed), Format::Json) => json(serde_json::to_vec(feed)),
            (Self::Entry(entry), Format::Json) => json(serde_json::to_vec(entry)),
            (Self::Service(service), Format::Json) => json(serde_json::to_vec(service)),
            (Self::Categories(cats), Format::Json) => json(serde_json::to_vec(cats)),
            (Self::Feed(feed), Format::Atom) => Ok(xml::write_feed(feed)?.into()),
            (Self::Entry(entry), Format::Atom) => Ok(xml::write_entry(entry)?.into()),
            (Self::Service(service), Format::Atom) => Ok(xml::write_service(service)?.into()),
            (Self::Categories(cats), Format::Atom) => Ok(xml::write_categories(cats)?.into()),
        }
    }
}

impl From<Entry> for Entity {
    fn from(entry: Entry) -> Self {
        Self::Entry(Box::new(entry))
    }
}

impl From<Feed> for Entity {
    fn from(feed: Feed) -> Self {
        Self::Feed(feed)
    }
}

// ============================================================================
// Response Context
// ============================================================================

#[derive(Debug)]
pub struct ResponseContext {
    status: StatusCode,
    status_text: Option<String>,
    headers: HeaderMap,
    entity: Option<Entity>,
    format: Format,
    content_length: Option<u64>,
    chunked: bool,
    body: OnceLock<Result<Bytes, String>>,
}

impl ResponseContext {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_text: None,
            headers: HeaderMap::new(),
            entity: None,
            format: Format::Atom,
            content_length: None,
            chunked: false,
            body: OnceLock::new(),
        }
    }

    pub fn ok(entity: impl Into<Entity>) -> Self {
        Self::new(StatusCode::OK).with_entity(entity)
    }

    /// 201 with `Location` and `Content-Location` pointing at the new member.
    pub fn created(entity: impl Into<Entity>, location: &str) -> Self {
        Self::new(StatusCode::CREATED)
            .with_entity(entity)
            .with_location(location)
            .with_content_location(location)
    }

    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT)
    }

    pub fn not_modified() -> Self {
        Self::new(StatusCode::NOT_MODIFIED)
    }

    /// Error response with the structured JSON body. 405s also carry `Allow`;
    /// 304s carry no body.
    pub fn error(err: &ProtocolError, debug: bool) -> Self {
        if matches!(err, ProtocolError::NotModified) {
            return Self::not_modified();
        }
        let response = Self::new(err.status()).with_entity(Entity::Error(err.to_body(debug)));
        match err {
            ProtocolError::MethodNotAllowed { allowed, .. } => response.with_allow(allowed),
            _ => response,
        }
    }

    pub fn with_entity(mut self, entity: impl Into<Entity>) -> Self {
        self.entity = Some(entity.into());
        self.body = OnceLock::new();
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self.body = OnceLock::new();
        self
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = Some(text.into());
        self
    }

    /// Sets a header, replacing existing values. Invalid values are dropped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = %name, "Dropping invalid response header value"),
        }
        self
    }

    pub fn with_etag(self, etag: &EntityTag) -> Self {
        self.with_header(header::ETAG, &etag.to_string())
    }

    pub fn with_last_modified(self, modified: &DateTime<Utc>) -> Self {
        self.with_header(header::LAST_MODIFIED, &format_http_date(modified))
    }

    pub fn with_location(self, location: &str) -> Self {
        self.with_header(header::LOCATION, location)
    }

    pub fn with_content_location(self, location: &str) -> Self {
        self.with_header(header::CONTENT_LOCATION, location)
    }

    pub fn with_cache_control(self, cache_control: &CacheControl) -> Self {
        if cache_control.is_empty() {
            return self;
        }
        self.with_header(header::CACHE_CONTROL, &cache_control.to_string())
    }

    pub fn with_allow(self, methods: &[Method]) -> Self {
        let allow = methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        self.with_header(header::ALLOW, &allow)
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    /// Streams the body without a `Content-Length`.
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> Option<&str> {
        self.status_text.as_deref()
    }

    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn content_type(&self) -> Option<String> {
        match &self.entity {
            Some(entity) => Some(entity.content_type(self.format)),
            None => self.header("content-type").map(str::to_string),
        }
    }

    /// Serialized entity, computed once.
    pub fn body(&self) -> Result<Bytes, ProtocolError> {
        let memo = self.body.get_or_init(|| match &self.entity {
            Some(entity) => entity.serialize(self.format).map_err(|e| format!("{e:#}")),
            None => Ok(Bytes::new()),
        });
        memo.clone().map_err(|msg| ProtocolError::internal(anyhow::anyhow!(msg)))
    }

    /// Explicit length if set, nothing when chunked, otherwise the length of
    /// the serialized entity.
    pub fn content_length(&self) -> Option<u64> {
        if self.content_length.is_some() {
            return self.content_length;
        }
        if self.chunked {
            return None;
        }
        self.body().ok().map(|b| b.len() as u64)
    }

    /// Drops the entity for a HEAD response while keeping its `Content-Type`
    /// and `Content-Length`.
    pub fn into_head(mut self) -> Self {
        if let Some(content_type) = self.content_type() {
            self = self.with_header(header::CONTENT_TYPE, &content_type);
        }
        if let Some(length) = self.content_length() {
            self.content_length = Some(length);
        }
        self.entity = None;
        self.body = OnceLock::new();
        self
    }

    /// Final HTTP response: headers, `Content-Type`, `Content-Length` and body.
    ///
    /// A body that fails to serialize turns into a 500 error body.
    pub fn into_http(self, debug: bool) -> http::Response<Bytes> {
        let body = match self.body() {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(status = %self.status, error = %err, "Failed to serialize response body");
                return ResponseContext::error(&err, debug).into_http(debug);
            }
        };

        let mut headers = self.headers.clone();
        if let Some(content_type) = self.entity.as_ref().map(|e| e.content_type(self.format)) {
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        if !self.chunked && self.status != StatusCode::NOT_MODIFIED && self.status != StatusCode::NO_CONTENT {
            let length = self.content_length.unwrap_or(body.len() as u64);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }

        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        if let Some(text) = self.status_text {
            response.extensions_mut().insert(StatusText(text));
        }
        response
    }
}

impl HeaderAccess for ResponseContext {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Custom reason phrase carried to the server through response extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText(pub String);
