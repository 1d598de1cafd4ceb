use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

use super::{
    accepts_media, assign_id, media_link_entry, next_edited, parse_accepts, prepare_update,
    stamp_new_entry, CollectionAdapter, FeedPage, MediaAdapter, MediaResource,
};
use crate::config::CollectionConfig;
use crate::model::{Categories, Category, Content, Entry, Feed, Page, Person};
use crate::protocol::{MediaType, ProtocolError, RequestContext};

/// A collection held entirely in process memory.
///
/// Entries live in a `BTreeMap` keyed by id behind a tokio `RwLock`; media
/// bodies sit in a second map under the same id. Lock order is always
/// entries before media.
pub struct MemoryAdapter {
    name: String,
    title: String,
    author: String,
    feed_id: String,
    accepts: Vec<MediaType>,
    read_only: bool,
    fixed_categories: Vec<String>,
    created: DateTime<Utc>,
    entries: RwLock<BTreeMap<String, Entry>>,
    media: RwLock<HashMap<String, MediaResource>>,
}

impl MemoryAdapter {
    /// A writable collection accepting Atom entries only.
    pub fn new(name: &str) -> Self {
        Self::from_config(&CollectionConfig::new(name, "memory"))
    }

    pub fn from_config(config: &CollectionConfig) -> Self {
        Self {
            name: config.name.clone(),
            title: config.title.clone(),
            author: config.author.clone(),
            feed_id: format!("urn:abdera:collection:{}", config.name),
            accepts: parse_accepts(&config.name, &config.accepts),
            read_only: config.read_only,
            fixed_categories: config.categories.clone(),
            created: Utc::now(),
            entries: RwLock::new(BTreeMap::new()),
            media: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_accepts(mut self, accepts: &[&str]) -> Self {
        let raw: Vec<String> = accepts.iter().map(|s| s.to_string()).collect();
        self.accepts = parse_accepts(&self.name, &raw);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Stores `entry` exactly as given, bypassing id assignment.
    pub async fn seed(&self, entry: Entry) {
        self.entries.write().await.insert(entry.id.clone(), entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_writable(&self) -> Result<(), ProtocolError> {
        if self.read_only {
            return Err(ProtocolError::Forbidden(format!(
                "collection '{}' is read-only",
                self.name
            )));
        }
        Ok(())
    }

    fn missing(&self, id: &str) -> ProtocolError {
        ProtocolError::not_found(format!("entry '{id}' in collection '{}'", self.name))
    }
}

#[async_trait]
impl CollectionAdapter for MemoryAdapter {
    fn title(&self) -> &str {
        &self.title
    }

    fn author(&self) -> &str {
        &self.author
    }

    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn accepts(&self) -> Vec<MediaType> {
        if self.read_only {
            Vec::new()
        } else {
            self.accepts.clone()
        }
    }

    async fn get_feed(&self, _request: &RequestContext, page: Page) -> Result<FeedPage, ProtocolError> {
        let entries = self.entries.read().await;
        let mut sorted: Vec<&Entry> = entries.values().collect();
        sorted.sort_by(|a, b| b.modified().cmp(&a.modified()).then_with(|| a.id.cmp(&b.id)));

        let has_next = sorted.len() > page.offset() + page.size;
        let mut feed = Feed::new(&self.feed_id, &self.title);
        feed.authors = vec![Person::new(&self.author)];
        feed.updated = Some(sorted.first().and_then(|e| e.modified()).unwrap_or(self.created));
        feed.entries = sorted
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .cloned()
            .collect();

        tracing::trace!(
            collection = %self.name,
            page = page.number,
            entries = feed.entries.len(),
            "Listed collection"
        );
        Ok(FeedPage { feed, has_next })
    }

    async fn get_entry(&self, id: &str, _request: &RequestContext) -> Result<Entry, ProtocolError> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| self.missing(id))
    }

    async fn post_entry(&self, entry: Entry, request: &RequestContext) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        let mut entries = self.entries.write().await;
        let slug = request.slug();
        let id = assign_id(slug.as_deref(), |candidate| {
            let taken = entries.contains_key(&candidate);
            async move { Ok(taken) }
        })
        .await?;

        let stored = stamp_new_entry(entry, id);
        entries.insert(stored.id.clone(), stored.clone());
        tracing::debug!(collection = %self.name, id = %stored.id, "Entry created");
        Ok(stored)
    }

    async fn put_entry(
        &self,
        id: &str,
        entry: Entry,
        _request: &RequestContext,
    ) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        let mut entries = self.entries.write().await;
        let existing = entries.get(id).ok_or_else(|| self.missing(id))?;
        let stored = prepare_update(id, entry, existing)?;
        entries.insert(id.to_string(), stored.clone());
        tracing::debug!(collection = %self.name, id = %id, "Entry replaced");
        Ok(stored)
    }

    async fn delete_entry(&self, id: &str, _request: &RequestContext) -> Result<(), ProtocolError> {
        self.check_writable()?;
        let mut entries = self.entries.write().await;
        if entries.remove(id).is_none() {
            return Err(self.missing(id));
        }
        self.media.write().await.remove(id);
        tracing::debug!(collection = %self.name, id = %id, "Entry deleted");
        Ok(())
    }

    async fn categories(&self, _request: &RequestContext) -> Result<Option<Categories>, ProtocolError> {
        if !self.fixed_categories.is_empty() {
            return Ok(Some(Categories {
                fixed: true,
                scheme: None,
                categories: self.fixed_categories.iter().map(Category::new).collect(),
            }));
        }
        let entries = self.entries.read().await;
        let terms: BTreeSet<&str> = entries
            .values()
            .flat_map(|e| e.categories.iter().map(|c| c.term.as_str()))
            .collect();
        Ok(Some(Categories {
            fixed: false,
            scheme: None,
            categories: terms.into_iter().map(Category::new).collect(),
        }))
    }

    fn media(&self) -> Option<&dyn MediaAdapter> {
        accepts_media(&self.accepts).then_some(self as &dyn MediaAdapter)
    }
}

#[async_trait]
impl MediaAdapter for MemoryAdapter {
    async fn post_media(
        &self,
        content_type: &str,
        bytes: Bytes,
        slug: Option<&str>,
        _request: &RequestContext,
    ) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        let mut entries = self.entries.write().await;
        let id = assign_id(slug, |candidate| {
            let taken = entries.contains_key(&candidate);
            async move { Ok(taken) }
        })
        .await?;

        let stamp = super::now();
        let entry = media_link_entry(id.clone(), &self.author, slug, content_type, stamp);
        entries.insert(id.clone(), entry.clone());
        self.media.write().await.insert(
            id.clone(),
            MediaResource {
                content_type: content_type.to_string(),
                bytes,
                updated: stamp,
            },
        );
        tracing::debug!(collection = %self.name, id = %id, content_type = %content_type, "Media created");
        Ok(entry)
    }

    async fn get_media(&self, id: &str, _request: &RequestContext) -> Result<MediaResource, ProtocolError> {
        self.media
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::not_found(format!("media '{id}' in collection '{}'", self.name)))
    }

    async fn put_media(
        &self,
        id: &str,
        content_type: &str,
        bytes: Bytes,
        _request: &RequestContext,
    ) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        let mut entries = self.entries.write().await;
        let mut media = self.media.write().await;
        let entry = match entries.get_mut(id) {
            Some(entry) if media.contains_key(id) => entry,
            _ => return Err(ProtocolError::not_found(format!("media '{id}' in collection '{}'", self.name))),
        };

        let stamp = next_edited(entry.edited);
        entry.edited = Some(stamp);
        entry.updated = Some(stamp);
        if let Some(Content::OutOfLine { media_type, .. }) = &mut entry.content {
            *media_type = content_type.to_string();
        }
        media.insert(
            id.to_string(),
            MediaResource {
                content_type: content_type.to_string(),
                bytes,
                updated: stamp,
            },
        );
        Ok(entry.clone())
    }

    async fn delete_media(&self, id: &str, _request: &RequestContext) -> Result<(), ProtocolError> {
        self.check_writable()?;
        let mut entries = self.entries.write().await;
        let mut media = self.media.write().await;
        if media.remove(id).is_none() {
            return Err(ProtocolError::not_found(format!("media '{id}' in collection '{}'", self.name)));
        }
        entries.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http::{Method, StatusCode};
    use pretty_assertions::assert_eq;

    fn request(method: Method) -> RequestContext {
        RequestContext::new(method, "/atom/blog")
    }

    fn entry(title: &str, minute: u32) -> Entry {
        Entry::new("urn:client:ignored", title)
            .with_author("Ada")
            .with_updated(Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap())
            .with_content(Content::text("body"))
    }

    #[tokio::test]
    async fn test_post_assigns_id_and_stamps() {
        let adapter = MemoryAdapter::new("blog");
        let stored = adapter.post_entry(entry("Hello", 0), &request(Method::POST)).await.unwrap();

        assert!(stored.id.starts_with("urn:uuid:"));
        assert!(stored.edited.is_some());
        assert!(stored.published.is_some());
        assert_eq!(
            adapter.get_entry(&stored.id, &request(Method::GET)).await.unwrap(),
            stored
        );
    }

    #[tokio::test]
    async fn test_slug_ids_are_uniqued() {
        let adapter = MemoryAdapter::new("blog");
        let req = request(Method::POST).with_header("Slug", "The Beach");
        let first = adapter.post_entry(entry("a", 0), &req).await.unwrap();
        let second = adapter.post_entry(entry("b", 0), &req).await.unwrap();
        assert_eq!(first.id, "the-beach");
        assert_eq!(second.id, "the-beach-2");
    }

    #[tokio::test]
    async fn test_put_and_delete() {
        let adapter = MemoryAdapter::new("blog");
        let stored = adapter.post_entry(entry("Hello", 0), &request(Method::POST)).await.unwrap();

        let mut update = stored.clone();
        update.title = "Renamed".to_string();
        let replaced = adapter
            .put_entry(&stored.id, update, &request(Method::PUT))
            .await
            .unwrap();
        assert_eq!(replaced.title, "Renamed");
        assert_eq!(replaced.published, stored.published);
        assert!(replaced.edited > stored.edited);

        let mut moved = replaced.clone();
        moved.id = "urn:other".to_string();
        let err = adapter
            .put_entry(&stored.id, moved, &request(Method::PUT))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        adapter.delete_entry(&stored.id, &request(Method::DELETE)).await.unwrap();
        let err = adapter
            .delete_entry(&stored.id, &request(Method::DELETE))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_feed_pages_newest_first() {
        let adapter = MemoryAdapter::new("blog");
        for (id, minute) in [("a", 1), ("b", 3), ("c", 2)] {
            let mut e = entry(id, minute);
            e.id = id.to_string();
            adapter.seed(e).await;
        }

        let first = adapter.get_feed(&request(Method::GET), Page::new(1, 2)).await.unwrap();
        let ids: Vec<&str> = first.feed.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(first.has_next);
        assert_eq!(
            first.feed.updated,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 3, 0).unwrap())
        );

        let second = adapter.get_feed(&request(Method::GET), Page::new(2, 2)).await.unwrap();
        assert_eq!(second.feed.entries.len(), 1);
        assert!(!second.has_next);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let adapter = MemoryAdapter::new("blog").read_only();
        assert!(adapter.accepts().is_empty());
        let err = adapter
            .post_entry(entry("x", 0), &request(Method::POST))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_categories_fixed_or_in_use() {
        let mut config = CollectionConfig::new("blog", "memory");
        config.categories = vec!["rust".to_string()];
        let fixed = MemoryAdapter::from_config(&config);
        let doc = fixed.categories(&request(Method::GET)).await.unwrap().unwrap();
        assert!(doc.fixed);
        assert_eq!(doc.categories, vec![Category::new("rust")]);

        let open = MemoryAdapter::new("blog");
        let mut e = entry("x", 0);
        e.categories = vec![Category::new("b"), Category::new("a")];
        open.seed(e).await;
        let doc = open.categories(&request(Method::GET)).await.unwrap().unwrap();
        assert!(!doc.fixed);
        assert_eq!(doc.categories, vec![Category::new("a"), Category::new("b")]);
    }

    #[tokio::test]
    async fn test_media_lifecycle() {
        let adapter = MemoryAdapter::new("pics").with_accepts(&["image/*"]);
        assert!(MemoryAdapter::new("blog").media().is_none());
        let media = adapter.media().unwrap();
        let req = request(Method::POST);

        let link_entry = media
            .post_media("image/png", Bytes::from_static(b"png"), Some("Cat"), &req)
            .await
            .unwrap();
        assert_eq!(link_entry.id, "cat");
        assert_eq!(link_entry.title, "Cat");

        let stored = media.get_media("cat", &req).await.unwrap();
        assert_eq!(stored.bytes, Bytes::from_static(b"png"));
        assert_eq!(Some(stored.updated), link_entry.edited);

        let updated = media
            .put_media("cat", "image/gif", Bytes::from_static(b"gif"), &req)
            .await
            .unwrap();
        assert_eq!(updated.content.as_ref().map(Content::kind), Some("image/gif"));
        assert_eq!(media.get_media("cat", &req).await.unwrap().content_type, "image/gif");

        media.delete_media("cat", &req).await.unwrap();
        assert!(adapter.is_empty().await);
        assert_eq!(
            media.get_media("cat", &req).await.unwrap_err().status(),
            StatusCode::NOT_FOUND
        );
    }
}
