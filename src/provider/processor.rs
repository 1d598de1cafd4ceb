use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;

use super::Provider;
use crate::adapter::{CollectionAdapter, MediaAdapter, MediaResource};
use crate::model::{Content, Entry, Feed, Link, Page};
use crate::protocol::{
    evaluate, BodyAccess, ConditionalHeaders, Entity, EntityTag, Format, MediaType, Outcome, ProtocolError,
    RequestContext, ResourceType, ResponseContext, Target, Validators,
};

// ============================================================================
// Dispatch context
// ============================================================================

/// Everything a processor sees for one request.
pub struct Dispatch<'a> {
    pub request: &'a RequestContext,
    pub target: &'a Target,
    pub provider: &'a Provider,
}

impl Dispatch<'_> {
    pub fn format(&self) -> Format {
        if self.request.accepts_json() {
            Format::Json
        } else {
            Format::Atom
        }
    }

    /// The addressed collection and its adapter.
    pub fn collection(&self) -> Result<(&str, Arc<dyn CollectionAdapter>), ProtocolError> {
        let name = self
            .target
            .collection()
            .ok_or_else(|| ProtocolError::not_found("no collection in request path"))?;
        let adapter = self
            .provider
            .adapters()
            .get(name)
            .ok_or_else(|| ProtocolError::not_found(format!("collection '{name}'")))?;
        Ok((name, adapter))
    }

    /// The addressed member id.
    pub fn member(&self) -> Result<&str, ProtocolError> {
        self.target
            .entry()
            .ok_or_else(|| ProtocolError::not_found("no entry in request path"))
    }

    /// Absolute URL for a resource, when some route can build it.
    pub fn url_for(&self, resource_type: &ResourceType, params: &[(&str, &str)]) -> Option<String> {
        self.provider
            .builder()
            .url_for(resource_type, params)
            .map(|path| self.request.absolute(&path))
    }

    /// Points the entry's `edit` link (and, for media-link entries, its
    /// `edit-media` link and content `src`) at this server.
    pub fn decorate(&self, collection: &str, entry: &mut Entry) {
        let id = entry.id.clone();
        let params = [("collection", collection), ("entry", id.as_str())];
        let edit = self
            .url_for(&ResourceType::EntryEdit, &params)
            .or_else(|| self.url_for(&ResourceType::Entry, &params));
        if let Some(edit) = edit {
            entry.set_link(Link::new("edit", edit));
        }
        if let Some(Content::OutOfLine { src, .. }) = &mut entry.content {
            let media = self
                .url_for(&ResourceType::MediaEdit, &params)
                .or_else(|| self.url_for(&ResourceType::Media, &params));
            if let Some(media) = media {
                *src = media.clone();
                entry.set_link(Link::new("edit-media", media));
            }
        }
    }

    fn precondition(&self, current: Option<&Validators>) -> Result<(), ProtocolError> {
        match evaluate(self.request.method(), &self.request.preconditions(), current) {
            Outcome::Proceed => Ok(()),
            Outcome::NotModified => Err(ProtocolError::NotModified),
            Outcome::PreconditionFailed => Err(ProtocolError::PreconditionFailed(
                "the resource does not match the request preconditions".to_string(),
            )),
        }
    }

    /// Finishes a GET/HEAD: 304 when the client copy is current, otherwise
    /// `response` in the negotiated format. Both carry the validators and
    /// the cache policy.
    fn respond_read(&self, validators: Validators, response: ResponseContext) -> Result<ResponseContext, ProtocolError> {
        let response = match evaluate(self.request.method(), &self.request.preconditions(), Some(&validators)) {
            Outcome::Proceed => response.with_format(self.format()),
            Outcome::NotModified => ResponseContext::not_modified(),
            Outcome::PreconditionFailed => {
                return Err(ProtocolError::PreconditionFailed(
                    "the resource does not match the request preconditions".to_string(),
                ))
            }
        };
        Ok(with_validators(response, &validators).with_cache_control(&self.provider.settings().cache_control))
    }

    /// Read body validators for documents with no natural version: a hash of
    /// the serialized representation.
    fn body_validators(&self, entity: &Entity) -> Result<Validators, ProtocolError> {
        let body = entity.serialize(self.format())?;
        Ok(Validators {
            etag: Some(EntityTag::generate([String::from_utf8_lossy(&body)])),
            last_modified: None,
        })
    }
}

fn with_validators(mut response: ResponseContext, validators: &Validators) -> ResponseContext {
    if let Some(etag) = &validators.etag {
        response = response.with_etag(etag);
    }
    if let Some(modified) = &validators.last_modified {
        response = response.with_last_modified(modified);
    }
    response
}

fn entry_validators(entry: &Entry) -> Validators {
    let modified = entry.modified();
    Validators::new(EntityTag::for_entry(&entry.id, &modified.unwrap_or_default()), modified)
}

fn media_validators(id: &str, updated: &DateTime<Utc>) -> Validators {
    let stamp = updated.to_rfc3339();
    Validators::new(EntityTag::generate(["media", id, stamp.as_str()]), Some(*updated))
}

/// Tag for one page of a collection. Built only from the feed id, its
/// update time, the paging position and each entry's id and modification
/// time, so an unchanged collection always yields the same tag.
fn collection_etag(feed: &Feed, page: Page, has_next: bool) -> EntityTag {
    let stamp = |d: Option<DateTime<Utc>>| d.map(|d| d.to_rfc3339()).unwrap_or_default();
    let mut parts = vec![
        feed.id.clone(),
        stamp(feed.updated),
        page.number.to_string(),
        page.size.to_string(),
        has_next.to_string(),
    ];
    for entry in &feed.entries {
        parts.push(entry.id.clone());
        parts.push(stamp(entry.modified()));
    }
    EntityTag::generate(parts)
}

/// Collections with no accepted media ranges take no writes at all.
fn require_writable(name: &str, adapter: &dyn CollectionAdapter) -> Result<Vec<MediaType>, ProtocolError> {
    let accepts = adapter.accepts();
    if accepts.is_empty() {
        return Err(ProtocolError::Forbidden(format!("collection '{name}' is read-only")));
    }
    Ok(accepts)
}

fn request_content_type(request: &RequestContext) -> Result<MediaType, ProtocolError> {
    request
        .content_type()
        .ok_or_else(|| ProtocolError::UnsupportedMediaType("missing or invalid Content-Type".to_string()))
}

fn is_entry_type(content_type: &MediaType) -> bool {
    content_type.is_atom_entry() || content_type.is_json()
}

/// Whether an entry body of `content_type` is admitted by one of `accepts`.
/// A bare `application/atom+xml` body counts as `type=entry`.
fn accepts_entry(accepts: &[MediaType], content_type: &MediaType) -> bool {
    let entry_type = if content_type.is_atom_entry() && content_type.param("type").is_none() {
        content_type.clone().with_param("type", "entry")
    } else {
        content_type.clone()
    };
    accepts
        .iter()
        .any(|range| content_type.matches(range) || entry_type.matches(range))
}

/// The 415 check for an entry replacement, run before any lookup.
fn require_entry_type(name: &str, adapter: &dyn CollectionAdapter, request: &RequestContext) -> Result<(), ProtocolError> {
    let accepts = require_writable(name, adapter)?;
    let content_type = request_content_type(request)?;
    if !is_entry_type(&content_type) || !accepts_entry(&accepts, &content_type) {
        return Err(ProtocolError::UnsupportedMediaType(content_type.to_string()));
    }
    Ok(())
}

/// Parses and validates the entry carried by the request body.
fn submitted_entry(request: &RequestContext) -> Result<Entry, ProtocolError> {
    let entry = request.entry()?.clone();
    entry.validate()?;
    Ok(entry)
}

// ============================================================================
// Processor trait
// ============================================================================

/// Handles every request addressed to one kind of resource.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Methods this resource supports; anything else is 405.
    fn allowed_methods(&self) -> &[Method];

    async fn process(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError>;
}

fn methods(list: &[Method]) -> Vec<Method> {
    list.to_vec()
}

// ============================================================================
// Service
// ============================================================================

pub struct ServiceProcessor {
    allowed: Vec<Method>,
}

impl ServiceProcessor {
    pub fn new() -> Self {
        Self {
            allowed: methods(&[Method::GET, Method::HEAD, Method::OPTIONS]),
        }
    }
}

impl Default for ServiceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestProcessor for ServiceProcessor {
    fn allowed_methods(&self) -> &[Method] {
        &self.allowed
    }

    async fn process(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let service = dispatch.provider.service_document(dispatch.request).await?;
        let entity = Entity::Service(service);
        let validators = dispatch.body_validators(&entity)?;
        dispatch.respond_read(validators, ResponseContext::ok(entity))
    }
}

// ============================================================================
// Categories
// ============================================================================

pub struct CategoriesProcessor {
    allowed: Vec<Method>,
}

impl CategoriesProcessor {
    pub fn new() -> Self {
        Self {
            allowed: methods(&[Method::GET, Method::HEAD, Method::OPTIONS]),
        }
    }
}

impl Default for CategoriesProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestProcessor for CategoriesProcessor {
    fn allowed_methods(&self) -> &[Method] {
        &self.allowed
    }

    async fn process(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let categories = adapter
            .categories(dispatch.request)
            .await?
            .ok_or_else(|| ProtocolError::not_found(format!("categories of collection '{name}'")))?;
        let entity = Entity::Categories(categories);
        let validators = dispatch.body_validators(&entity)?;
        dispatch.respond_read(validators, ResponseContext::ok(entity))
    }
}

// ============================================================================
// Collection
// ============================================================================

pub struct CollectionProcessor {
    allowed: Vec<Method>,
}

impl CollectionProcessor {
    pub fn new() -> Self {
        Self {
            allowed: methods(&[Method::GET, Method::POST, Method::HEAD, Method::OPTIONS]),
        }
    }

    async fn get(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let page = Page::from_query(dispatch.request.query(), dispatch.provider.settings().page_size);
        let crate::adapter::FeedPage { mut feed, has_next } = adapter.get_feed(dispatch.request, page).await?;

        let href = dispatch
            .url_for(&ResourceType::Collection, &[("collection", name)])
            .unwrap_or_else(|| dispatch.request.absolute(dispatch.request.path()));
        feed.add_paging_links(&href, page, has_next);
        for entry in &mut feed.entries {
            dispatch.decorate(name, entry);
        }

        let validators = Validators::new(collection_etag(&feed, page, has_next), feed.last_modified());
        dispatch.respond_read(validators, ResponseContext::ok(feed))
    }

    async fn post(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let accepts = require_writable(name, adapter.as_ref())?;
        let content_type = request_content_type(dispatch.request)?;

        let stored = if is_entry_type(&content_type) {
            if !accepts_entry(&accepts, &content_type) {
                return Err(ProtocolError::UnsupportedMediaType(format!(
                    "collection '{name}' does not accept {content_type} entries"
                )));
            }
            let entry = submitted_entry(dispatch.request)?;
            adapter.post_entry(entry, dispatch.request).await?
        } else {
            let media = adapter
                .media()
                .filter(|_| accepts.iter().any(|range| content_type.matches(range)))
                .ok_or_else(|| ProtocolError::UnsupportedMediaType(content_type.to_string()))?;
            let slug = dispatch.request.slug();
            media
                .post_media(
                    &content_type.to_string(),
                    dispatch.request.body().clone(),
                    slug.as_deref(),
                    dispatch.request,
                )
                .await?
        };

        Ok(created(dispatch, name, stored))
    }
}

impl Default for CollectionProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// 201 for a new member, located at its edit URL.
fn created(dispatch: &Dispatch<'_>, collection: &str, mut entry: Entry) -> ResponseContext {
    dispatch.decorate(collection, &mut entry);
    let location = entry
        .edit_link()
        .map(str::to_string)
        .unwrap_or_else(|| dispatch.request.absolute(dispatch.request.path()));
    let validators = entry_validators(&entry);
    tracing::info!(collection = %collection, id = %entry.id, "Member created");
    with_validators(ResponseContext::created(entry, &location), &validators).with_format(dispatch.format())
}

#[async_trait]
impl RequestProcessor for CollectionProcessor {
    fn allowed_methods(&self) -> &[Method] {
        &self.allowed
    }

    async fn process(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        match *dispatch.request.method() {
            Method::POST => self.post(dispatch).await,
            _ => self.get(dispatch).await,
        }
    }
}

// ============================================================================
// Entry
// ============================================================================

/// Serves both `Entry` and `EntryEdit` targets.
pub struct EntryProcessor {
    allowed: Vec<Method>,
}

impl EntryProcessor {
    pub fn new() -> Self {
        Self {
            allowed: methods(&[Method::GET, Method::PUT, Method::DELETE, Method::HEAD, Method::OPTIONS]),
        }
    }

    async fn current(
        adapter: &dyn CollectionAdapter,
        id: &str,
        request: &RequestContext,
    ) -> Result<Option<Entry>, ProtocolError> {
        match adapter.get_entry(id, request).await {
            Ok(entry) => Ok(Some(entry)),
            Err(ProtocolError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let id = dispatch.member()?;
        let mut entry = adapter.get_entry(id, dispatch.request).await?;
        dispatch.decorate(name, &mut entry);
        let validators = entry_validators(&entry);
        dispatch.respond_read(validators, ResponseContext::ok(entry))
    }

    async fn put(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let id = dispatch.member()?;
        require_entry_type(name, adapter.as_ref(), dispatch.request)?;
        let _guard = dispatch.provider.locks().lock(name, id).await;

        let current = Self::current(adapter.as_ref(), id, dispatch.request).await?;
        dispatch.precondition(current.as_ref().map(entry_validators).as_ref())?;
        if current.is_none() {
            return Err(ProtocolError::not_found(format!("entry '{id}' in collection '{name}'")));
        }

        let entry = submitted_entry(dispatch.request)?;
        let stored = adapter.put_entry(id, entry, dispatch.request).await?;
        tracing::info!(collection = %name, id = %id, "Entry updated");
        Ok(with_validators(ResponseContext::no_content(), &entry_validators(&stored)))
    }

    async fn delete(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let id = dispatch.member()?;
        let _guard = dispatch.provider.locks().lock(name, id).await;

        let current = Self::current(adapter.as_ref(), id, dispatch.request).await?;
        dispatch.precondition(current.as_ref().map(entry_validators).as_ref())?;
        if current.is_none() {
            return Err(ProtocolError::not_found(format!("entry '{id}' in collection '{name}'")));
        }

        adapter.delete_entry(id, dispatch.request).await?;
        tracing::info!(collection = %name, id = %id, "Entry deleted");
        Ok(ResponseContext::no_content())
    }
}

impl Default for EntryProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestProcessor for EntryProcessor {
    fn allowed_methods(&self) -> &[Method] {
        &self.allowed
    }

    async fn process(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        match *dispatch.request.method() {
            Method::PUT => self.put(dispatch).await,
            Method::DELETE => self.delete(dispatch).await,
            _ => self.get(dispatch).await,
        }
    }
}

// ============================================================================
// Media
// ============================================================================

/// Serves both `Media` and `MediaEdit` targets.
pub struct MediaProcessor {
    allowed: Vec<Method>,
}

impl MediaProcessor {
    pub fn new() -> Self {
        Self {
            allowed: methods(&[Method::GET, Method::PUT, Method::DELETE, Method::HEAD, Method::OPTIONS]),
        }
    }

    fn media<'a>(name: &str, adapter: &'a dyn CollectionAdapter) -> Result<&'a dyn MediaAdapter, ProtocolError> {
        adapter
            .media()
            .ok_or_else(|| ProtocolError::not_found(format!("collection '{name}' holds no media")))
    }

    async fn current(
        media: &dyn MediaAdapter,
        id: &str,
        request: &RequestContext,
    ) -> Result<Option<MediaResource>, ProtocolError> {
        match media.get_media(id, request).await {
            Ok(resource) => Ok(Some(resource)),
            Err(ProtocolError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let id = dispatch.member()?;
        let media = Self::media(name, adapter.as_ref())?;
        let resource = media.get_media(id, dispatch.request).await?;
        let validators = media_validators(id, &resource.updated);
        let entity = Entity::Media {
            content_type: resource.content_type,
            bytes: resource.bytes,
        };
        dispatch.respond_read(validators, ResponseContext::ok(entity))
    }

    async fn put(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let id = dispatch.member()?;
        let media = Self::media(name, adapter.as_ref())?;
        let accepts = require_writable(name, adapter.as_ref())?;
        let content_type = request_content_type(dispatch.request)?;
        if is_entry_type(&content_type) || !accepts.iter().any(|range| content_type.matches(range)) {
            return Err(ProtocolError::UnsupportedMediaType(content_type.to_string()));
        }
        let _guard = dispatch.provider.locks().lock(name, id).await;

        let current = Self::current(media, id, dispatch.request).await?;
        let validators = current.as_ref().map(|r| media_validators(id, &r.updated));
        dispatch.precondition(validators.as_ref())?;
        if current.is_none() {
            return Err(ProtocolError::not_found(format!("media '{id}' in collection '{name}'")));
        }

        let entry = media
            .put_media(
                id,
                &content_type.to_string(),
                dispatch.request.body().clone(),
                dispatch.request,
            )
            .await?;
        tracing::info!(collection = %name, id = %id, content_type = %content_type, "Media updated");
        let response = ResponseContext::no_content();
        Ok(match entry.modified() {
            Some(updated) => with_validators(response, &media_validators(id, &updated)),
            None => response,
        })
    }

    async fn delete(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        let (name, adapter) = dispatch.collection()?;
        let id = dispatch.member()?;
        let media = Self::media(name, adapter.as_ref())?;
        let _guard = dispatch.provider.locks().lock(name, id).await;

        let current = Self::current(media, id, dispatch.request).await?;
        let validators = current.as_ref().map(|r| media_validators(id, &r.updated));
        dispatch.precondition(validators.as_ref())?;
        if current.is_none() {
            return Err(ProtocolError::not_found(format!("media '{id}' in collection '{name}'")));
        }

        media.delete_media(id, dispatch.request).await?;
        tracing::info!(collection = %name, id = %id, "Media deleted");
        Ok(ResponseContext::no_content())
    }
}

impl Default for MediaProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestProcessor for MediaProcessor {
    fn allowed_methods(&self) -> &[Method] {
        &self.allowed
    }

    async fn process(&self, dispatch: &Dispatch<'_>) -> Result<ResponseContext, ProtocolError> {
        match *dispatch.request.method() {
            Method::PUT => self.put(dispatch).await,
            Method::DELETE => self.delete(dispatch).await,
            _ => self.get(dispatch).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feed(ids: &[(&str, u32)]) -> Feed {
        let mut feed = Feed::new("urn:feed", "Feed");
        feed.updated = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        feed.entries = ids
            .iter()
            .map(|(id, minute)| {
                Entry::new(*id, "t").with_updated(Utc.with_ymd_and_hms(2024, 1, 1, 0, *minute, 0).unwrap())
            })
            .collect();
        feed
    }

    #[test]
    fn test_collection_etag_is_stable() {
        let page = Page::new(1, 10);
        let a = collection_etag(&feed(&[("a", 1), ("b", 2)]), page, false);
        let b = collection_etag(&feed(&[("a", 1), ("b", 2)]), page, false);
        assert_eq!(a, b);
        assert!(!a.is_weak());
    }

    #[test]
    fn test_collection_etag_tracks_changes() {
        let page = Page::new(1, 10);
        let base = collection_etag(&feed(&[("a", 1)]), page, false);
        assert_ne!(base, collection_etag(&feed(&[("a", 2)]), page, false));
        assert_ne!(base, collection_etag(&feed(&[("a", 1), ("b", 1)]), page, false));
        assert_ne!(base, collection_etag(&feed(&[("a", 1)]), Page::new(2, 10), false));
        assert_ne!(base, collection_etag(&feed(&[("a", 1)]), page, true));
    }

    #[test]
    fn test_entry_validators_follow_modification() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut entry = Entry::new("x", "t").with_updated(at);
        let before = entry_validators(&entry);
        assert_eq!(before.last_modified, Some(at));

        entry.edited = Some(at + chrono::Duration::seconds(1));
        assert_ne!(entry_validators(&entry).etag, before.etag);
    }

    fn media_types(values: &[&str]) -> Vec<MediaType> {
        values.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn test_accepts_entry_checks_the_body_type() {
        let atom_only = media_types(&["application/atom+xml;type=entry"]);
        let json_only = media_types(&["application/json"]);

        let json: MediaType = "application/json".parse().unwrap();
        assert!(!accepts_entry(&atom_only, &json));
        assert!(accepts_entry(&json_only, &json));

        let typed: MediaType = "application/atom+xml;type=entry".parse().unwrap();
        assert!(accepts_entry(&atom_only, &typed));
        assert!(!accepts_entry(&json_only, &typed));
    }

    #[test]
    fn test_bare_atom_counts_as_entry() {
        let bare: MediaType = "application/atom+xml".parse().unwrap();
        assert!(accepts_entry(&media_types(&["application/atom+xml;type=entry"]), &bare));
        assert!(accepts_entry(&media_types(&["application/*"]), &bare));
        assert!(!accepts_entry(&media_types(&["image/*"]), &bare));
    }
}
