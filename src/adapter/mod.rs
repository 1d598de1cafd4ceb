//! Collection adapters: the storage-facing side of the protocol.
//!
//! Every collection served by the provider is backed by one
//! [`CollectionAdapter`]. Adapters return [`ProtocolError`] for the failures
//! clients should see (missing entries, id conflicts, read-only
//! collections); the provider maps each to its HTTP status.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;

use crate::model::{Categories, Entry, Feed, Page};
use crate::protocol::{media_type, MediaType, ProtocolError, RequestContext};
use crate::util::slugify;

mod memory;
mod registry;
mod sqlite;

pub use memory::MemoryAdapter;
pub use registry::{AdapterFactories, AdapterFactory, AdapterRegistry};
pub use sqlite::SqliteAdapter;

/// One page of a collection feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub feed: Feed,
    /// Whether entries exist beyond this page.
    pub has_next: bool,
}

/// A media resource body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaResource {
    pub content_type: String,
    pub bytes: Bytes,
    pub updated: DateTime<Utc>,
}

#[async_trait]
pub trait CollectionAdapter: Send + Sync + 'static {
    fn title(&self) -> &str;

    fn author(&self) -> &str;

    /// Atom id of the collection feed.
    fn feed_id(&self) -> &str;

    /// Media ranges accepted on POST/PUT. Atom entries by default.
    fn accepts(&self) -> Vec<MediaType> {
        vec![atom_entry_type()]
    }

    async fn get_feed(&self, request: &RequestContext, page: Page) -> Result<FeedPage, ProtocolError>;

    async fn get_entry(&self, id: &str, request: &RequestContext) -> Result<Entry, ProtocolError>;

    /// Stores a new entry under an adapter-assigned id and returns it as stored.
    async fn post_entry(&self, entry: Entry, request: &RequestContext) -> Result<Entry, ProtocolError>;

    /// Replaces entry `id`. Changing the id is a `Conflict`.
    async fn put_entry(
        &self,
        id: &str,
        entry: Entry,
        request: &RequestContext,
    ) -> Result<Entry, ProtocolError>;

    async fn delete_entry(&self, id: &str, request: &RequestContext) -> Result<(), ProtocolError>;

    /// Category document for the collection, if it has one.
    async fn categories(&self, _request: &RequestContext) -> Result<Option<Categories>, ProtocolError> {
        Ok(None)
    }

    /// Media support, for collections that accept non-Atom payloads.
    fn media(&self) -> Option<&dyn MediaAdapter> {
        None
    }
}

#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// Stores a media resource and returns its media-link entry.
    async fn post_media(
        &self,
        content_type: &str,
        bytes: Bytes,
        slug: Option<&str>,
        request: &RequestContext,
    ) -> Result<Entry, ProtocolError>;

    async fn get_media(&self, id: &str, request: &RequestContext) -> Result<MediaResource, ProtocolError>;

    /// Replaces the media resource and returns the updated media-link entry.
    async fn put_media(
        &self,
        id: &str,
        content_type: &str,
        bytes: Bytes,
        request: &RequestContext,
    ) -> Result<Entry, ProtocolError>;

    /// Removes the media resource together with its media-link entry.
    async fn delete_media(&self, id: &str, request: &RequestContext) -> Result<(), ProtocolError>;
}

// ============================================================================
// Helpers shared by the built-in adapters
// ============================================================================

pub fn atom_entry_type() -> MediaType {
    MediaType::new("application", "atom+xml").with_param("type", "entry")
}

/// Parses configured accept ranges, skipping (and logging) invalid ones.
pub(crate) fn parse_accepts(collection: &str, accepts: &[String]) -> Vec<MediaType> {
    if accepts.is_empty() {
        return vec![atom_entry_type()];
    }
    accepts
        .iter()
        .filter_map(|raw| match raw.parse::<MediaType>() {
            Ok(range) => Some(range),
            Err(e) => {
                tracing::warn!(collection = %collection, range = %raw, error = %e, "Ignoring invalid accept range");
                None
            }
        })
        .collect()
}

/// True when any range admits something other than Atom entries.
pub(crate) fn accepts_media(accepts: &[MediaType]) -> bool {
    accepts.iter().any(|r| {
        !(r.kind() == "application" && r.subtype() == "atom+xml") && r.essence() != media_type::JSON
    })
}

/// The current time at microsecond precision, the resolution the SQLite
/// store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Modification stamp for a write: now, but always later than `previous` so
/// consecutive writes never share a validator.
pub(crate) fn next_edited(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now();
    match previous {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// Chooses an id for a new member: the slug (made unique with `-2`, `-3`,
/// ...) when one is given, otherwise a fresh `urn:uuid:`.
pub(crate) async fn assign_id<F, Fut>(slug: Option<&str>, taken: F) -> Result<String, ProtocolError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<bool, ProtocolError>>,
{
    let Some(base) = slug.and_then(slugify) else {
        return Ok(format!("urn:uuid:{}", uuid::Uuid::new_v4()));
    };
    if !taken(base.clone()).await? {
        return Ok(base);
    }
    for n in 2..1000 {
        let candidate = format!("{base}-{n}");
        if !taken(candidate.clone()).await? {
            return Ok(candidate);
        }
    }
    Ok(format!("{base}-{}", uuid::Uuid::new_v4().simple()))
}

/// Prepares a client-submitted entry for storage under `id`.
pub(crate) fn stamp_new_entry(mut entry: Entry, id: String) -> Entry {
    let now = now();
    entry.id = id;
    entry.edited = Some(now);
    entry.published.get_or_insert(now);
    entry.updated.get_or_insert(now);
    entry
}

/// Media-link entry for a freshly stored media resource.
pub(crate) fn media_link_entry(
    id: String,
    author: &str,
    slug: Option<&str>,
    content_type: &str,
    stamp: DateTime<Utc>,
) -> Entry {
    let title = slug.map(str::to_string).unwrap_or_else(|| id.clone());
    let mut entry = Entry::new(id, title).with_author(author).with_updated(stamp);
    entry.published = Some(stamp);
    entry.edited = Some(stamp);
    entry.content = Some(crate::model::Content::OutOfLine {
        src: String::new(),
        media_type: content_type.to_string(),
    });
    entry
}

/// Checks a replacement entry against the stored one.
pub(crate) fn prepare_update(id: &str, mut entry: Entry, existing: &Entry) -> Result<Entry, ProtocolError> {
    if entry.id != id {
        return Err(ProtocolError::Conflict(format!(
            "entry id cannot change from '{id}' to '{}'",
            entry.id
        )));
    }
    if entry.published.is_none() {
        entry.published = existing.published;
    }
    if matches!(existing.content, Some(crate::model::Content::OutOfLine { .. })) {
        entry.content = existing.content.clone();
    }
    entry.edited = Some(next_edited(existing.edited));
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Content;

    #[tokio::test]
    async fn test_assign_id_uniques_slugs() {
        let taken = |id: String| async move { Ok(id == "the-beach" || id == "the-beach-2") };
        assert_eq!(assign_id(Some("The Beach"), taken).await.unwrap(), "the-beach-3");

        let free = |_: String| async { Ok(false) };
        assert!(assign_id(None, free).await.unwrap().starts_with("urn:uuid:"));
        assert!(assign_id(Some("!!!"), free).await.unwrap().starts_with("urn:uuid:"));
    }

    #[test]
    fn test_next_edited_is_monotonic() {
        let future = Utc::now() + Duration::hours(1);
        assert!(next_edited(Some(future)) > future);
        assert!(next_edited(None) <= Utc::now());
    }

    #[test]
    fn test_prepare_update_rejects_id_change() {
        let existing = Entry::new("a", "A");
        let err = prepare_update("a", Entry::new("b", "B"), &existing).unwrap_err();
        assert_eq!(err.status(), http::StatusCode::CONFLICT);
    }

    #[test]
    fn test_prepare_update_keeps_media_content() {
        let existing = media_link_entry("m".into(), "ann", None, "image/png", Utc::now());
        let update = Entry::new("m", "Renamed").with_content(Content::text("ignored"));
        let stored = prepare_update("m", update, &existing).unwrap();
        assert_eq!(stored.content, existing.content);
        assert!(stored.edited > existing.edited);
    }

    #[test]
    fn test_accepts_media() {
        assert!(!accepts_media(&[atom_entry_type()]));
        assert!(accepts_media(&["image/*".parse().unwrap()]));
        assert!(!accepts_media(&parse_accepts("c", &[])));
    }
}
