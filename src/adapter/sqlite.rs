use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{
    accepts_media, assign_id, media_link_entry, next_edited, parse_accepts, prepare_update,
    stamp_new_entry, CollectionAdapter, FeedPage, MediaAdapter, MediaResource,
};
use crate::config::CollectionConfig;
use crate::model::{Categories, Category, Content, Entry, Feed, Page, Person};
use crate::protocol::{MediaType, ProtocolError, RequestContext};
use crate::storage::Database;

/// Id assignment retries when a concurrent insert takes the chosen id.
const INSERT_ATTEMPTS: usize = 3;

/// A collection persisted in SQLite through [`Database`].
///
/// Several adapters may share one database; rows are scoped by the
/// collection name.
pub struct SqliteAdapter {
    db: Database,
    name: String,
    title: String,
    author: String,
    feed_id: String,
    accepts: Vec<MediaType>,
    read_only: bool,
    fixed_categories: Vec<String>,
    created: DateTime<Utc>,
}

impl SqliteAdapter {
    pub fn new(db: Database, name: &str) -> Self {
        Self::from_config(db, &CollectionConfig::new(name, "sqlite"))
    }

    pub fn from_config(db: Database, config: &CollectionConfig) -> Self {
        Self {
            db,
            name: config.name.clone(),
            title: config.title.clone(),
            author: config.author.clone(),
            feed_id: format!("urn:abdera:collection:{}", config.name),
            accepts: parse_accepts(&config.name, &config.accepts),
            read_only: config.read_only,
            fixed_categories: config.categories.clone(),
            created: Utc::now(),
        }
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

    fn missing(&self, what: &str, id: &str) -> ProtocolError {
        ProtocolError::not_found(format!("{what} '{id}' in collection '{}'", self.name))
    }

    async fn id_taken(&self, id: String) -> Result<bool, ProtocolError> {
        Ok(self.db.get_entry(&self.name, &id).await?.is_some())
    }
}

#[async_trait]
impl CollectionAdapter for SqliteAdapter {
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
        // One extra row tells whether a next page exists.
        let mut entries = self
            .db
            .list_entries(&self.name, page.size + 1, page.offset())
            .await?;
        let has_next = entries.len() > page.size;
        entries.truncate(page.size);

        let newest = if page.number == 1 {
            entries.first().and_then(Entry::modified)
        } else {
            self.db
                .list_entries(&self.name, 1, 0)
                .await?
                .first()
                .and_then(Entry::modified)
        };

        let mut feed = Feed::new(&self.feed_id, &self.title);
        feed.authors = vec![Person::new(&self.author)];
        feed.updated = Some(newest.unwrap_or(self.created));
        feed.entries = entries;
        Ok(FeedPage { feed, has_next })
    }

    async fn get_entry(&self, id: &str, _request: &RequestContext) -> Result<Entry, ProtocolError> {
        self.db
            .get_entry(&self.name, id)
            .await?
            .ok_or_else(|| self.missing("entry", id))
    }

    async fn post_entry(&self, entry: Entry, request: &RequestContext) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        let slug = request.slug();
        for _ in 0..INSERT_ATTEMPTS {
            let id = assign_id(slug.as_deref(), |candidate| self.id_taken(candidate)).await?;
            let stored = stamp_new_entry(entry.clone(), id);
            if self.db.insert_entry(&self.name, &stored).await? {
                tracing::debug!(collection = %self.name, id = %stored.id, "Entry created");
                return Ok(stored);
            }
            tracing::debug!(collection = %self.name, id = %stored.id, "Id taken concurrently, retrying");
        }
        Err(ProtocolError::Conflict("could not assign a unique entry id".to_string()))
    }

    async fn put_entry(
        &self,
        id: &str,
        entry: Entry,
        request: &RequestContext,
    ) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        let existing = self.get_entry(id, request).await?;
        let stored = prepare_update(id, entry, &existing)?;
        if !self.db.update_entry(&self.name, &stored).await? {
            return Err(self.missing("entry", id));
        }
        tracing::debug!(collection = %self.name, id = %id, "Entry replaced");
        Ok(stored)
    }

    async fn delete_entry(&self, id: &str, _request: &RequestContext) -> Result<(), ProtocolError> {
        self.check_writable()?;
        if !self.db.delete_entry(&self.name, id).await? {
            return Err(self.missing("entry", id));
        }
        tracing::debug!(collection = %self.name, id = %id, "Entry deleted");
        Ok(())
    }

    async fn categories(&self, _request: &RequestContext) -> Result<Option<Categories>, ProtocolError> {
        let (fixed, terms) = if self.fixed_categories.is_empty() {
            (false, self.db.category_terms(&self.name).await?)
        } else {
            (true, self.fixed_categories.clone())
        };
        Ok(Some(Categories {
            fixed,
            scheme: None,
            categories: terms.into_iter().map(Category::new).collect(),
        }))
    }

    fn media(&self) -> Option<&dyn MediaAdapter> {
        accepts_media(&self.accepts).then_some(self as &dyn MediaAdapter)
    }
}

#[async_trait]
impl MediaAdapter for SqliteAdapter {
    async fn post_media(
        &self,
        content_type: &str,
        bytes: Bytes,
        slug: Option<&str>,
        _request: &RequestContext,
    ) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        for _ in 0..INSERT_ATTEMPTS {
            let id = assign_id(slug, |candidate| self.id_taken(candidate)).await?;
            let entry = media_link_entry(id, &self.author, slug, content_type, super::now());
            if self
                .db
                .insert_media_entry(&self.name, &entry, content_type, &bytes)
                .await?
            {
                tracing::debug!(collection = %self.name, id = %entry.id, content_type = %content_type, "Media created");
                return Ok(entry);
            }
        }
        Err(ProtocolError::Conflict("could not assign a unique entry id".to_string()))
    }

    async fn get_media(&self, id: &str, _request: &RequestContext) -> Result<MediaResource, ProtocolError> {
        let stored = self
            .db
            .get_media(&self.name, id)
            .await?
            .ok_or_else(|| self.missing("media", id))?;
        Ok(MediaResource {
            content_type: stored.content_type,
            bytes: Bytes::from(stored.data),
            updated: stored.updated,
        })
    }

    async fn put_media(
        &self,
        id: &str,
        content_type: &str,
        bytes: Bytes,
        _request: &RequestContext,
    ) -> Result<Entry, ProtocolError> {
        self.check_writable()?;
        if self.db.get_media(&self.name, id).await?.is_none() {
            return Err(self.missing("media", id));
        }
        let mut entry = self
            .db
            .get_entry(&self.name, id)
            .await?
            .ok_or_else(|| self.missing("media", id))?;

        let stamp = next_edited(entry.edited);
        entry.edited = Some(stamp);
        entry.updated = Some(stamp);
        if let Some(Content::OutOfLine { media_type, .. }) = &mut entry.content {
            *media_type = content_type.to_string();
        }
        if !self
            .db
            .update_media_entry(&self.name, &entry, content_type, &bytes)
            .await?
        {
            return Err(self.missing("media", id));
        }
        Ok(entry)
    }

    async fn delete_media(&self, id: &str, _request: &RequestContext) -> Result<(), ProtocolError> {
        self.check_writable()?;
        if self.db.get_media(&self.name, id).await?.is_none() {
            return Err(self.missing("media", id));
        }
        self.db.delete_entry(&self.name, id).await?;
        Ok(())
    }
}
