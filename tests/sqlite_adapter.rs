//! Integration tests for the SQLite-backed collection adapter.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use abdera::adapter::{CollectionAdapter, SqliteAdapter};
use abdera::config::CollectionConfig;
use abdera::model::{Category, Content, Entry, Page};
use abdera::protocol::{ProtocolError, RequestContext};
use abdera::storage::Database;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http::Method;
use pretty_assertions::assert_eq;
use std::time::Duration;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn post_request(slug: Option<&str>) -> RequestContext {
    let request = RequestContext::new(Method::POST, "/atom/blog");
    match slug {
        Some(slug) => request.with_header("Slug", slug),
        None => request,
    }
}

fn test_entry(title: &str) -> Entry {
    Entry::new("urn:client:ignored", title)
        .with_author("Ada")
        .with_updated(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        .with_content(Content::text("body"))
}

fn media_collection(db: Database) -> SqliteAdapter {
    let mut config = CollectionConfig::new("pics", "sqlite");
    config.accepts = vec!["image/*".to_string()];
    SqliteAdapter::from_config(db, &config)
}

// ============================================================================
// Entries
// ============================================================================

#[tokio::test]
async fn test_post_assigns_id_and_persists() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let request = post_request(None);

    let created = adapter.post_entry(test_entry("Hello"), &request).await.unwrap();
    assert!(created.id.starts_with("urn:uuid:"));
    assert!(created.edited.is_some());
    assert!(created.published.is_some());

    let fetched = adapter.get_entry(&created.id, &request).await.unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn test_slug_collisions_get_suffixes() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let request = post_request(Some("Hello World"));

    let first = adapter.post_entry(test_entry("a"), &request).await.unwrap();
    let second = adapter.post_entry(test_entry("b"), &request).await.unwrap();
    assert_eq!(first.id, "hello-world");
    assert_eq!(second.id, "hello-world-2");
}

#[tokio::test]
async fn test_put_replaces_and_bumps_edited() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let request = post_request(Some("post"));
    let created = adapter.post_entry(test_entry("Draft"), &request).await.unwrap();

    let mut replacement = created.clone();
    replacement.title = "Final".to_string();
    replacement.published = None;
    let stored = adapter.put_entry("post", replacement, &request).await.unwrap();

    assert_eq!(stored.title, "Final");
    assert_eq!(stored.published, created.published);
    assert!(stored.edited > created.edited);
    assert_eq!(adapter.get_entry("post", &request).await.unwrap().title, "Final");
}

#[tokio::test]
async fn test_put_with_changed_id_conflicts() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let request = post_request(Some("post"));
    let mut created = adapter.post_entry(test_entry("x"), &request).await.unwrap();
    created.id = "other".to_string();

    let err = adapter.put_entry("post", created, &request).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Conflict(_)));
}

#[tokio::test]
async fn test_missing_entries_are_not_found() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let request = post_request(None);

    let err = adapter.get_entry("nope", &request).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));
    let err = adapter.delete_entry("nope", &request).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));
    let err = adapter
        .put_entry("nope", test_entry("x"), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_removes_entry() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let request = post_request(Some("gone"));
    adapter.post_entry(test_entry("x"), &request).await.unwrap();

    adapter.delete_entry("gone", &request).await.unwrap();
    assert!(adapter.get_entry("gone", &request).await.is_err());
}

#[tokio::test]
async fn test_collections_share_a_database_without_mixing() {
    let db = test_db().await;
    let blog = SqliteAdapter::new(db.clone(), "blog");
    let news = SqliteAdapter::new(db.clone(), "news");
    let request = post_request(Some("same"));

    blog.post_entry(test_entry("blog"), &request).await.unwrap();
    news.post_entry(test_entry("news"), &request).await.unwrap();

    assert_eq!(blog.get_entry("same", &request).await.unwrap().title, "blog");
    assert_eq!(news.get_entry("same", &request).await.unwrap().title, "news");
    assert_eq!(db.count_entries("blog").await.unwrap(), 1);
}

#[tokio::test]
async fn test_read_only_collection_rejects_writes() {
    let mut config = CollectionConfig::new("archive", "sqlite");
    config.read_only = true;
    let adapter = SqliteAdapter::from_config(test_db().await, &config);

    assert!(adapter.accepts().is_empty());
    let err = adapter
        .post_entry(test_entry("x"), &post_request(None))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Forbidden(_)));
}

// ============================================================================
// Feed paging
// ============================================================================

#[tokio::test]
async fn test_feed_pages_newest_first() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    for title in ["one", "two", "three"] {
        adapter
            .post_entry(test_entry(title), &post_request(Some(title)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let request = RequestContext::new(Method::GET, "/atom/blog");

    let first = adapter.get_feed(&request, Page::new(1, 2)).await.unwrap();
    let titles: Vec<&str> = first.feed.entries.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["three", "two"]);
    assert!(first.has_next);
    assert_eq!(first.feed.id, "urn:abdera:collection:blog");
    assert_eq!(first.feed.updated, first.feed.entries[0].modified());

    let second = adapter.get_feed(&request, Page::new(2, 2)).await.unwrap();
    assert_eq!(second.feed.entries.len(), 1);
    assert_eq!(second.feed.entries[0].title, "one");
    assert!(!second.has_next);
    assert_eq!(second.feed.updated, first.feed.updated);
}

#[tokio::test]
async fn test_empty_feed_still_has_updated() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    let page = adapter
        .get_feed(&RequestContext::new(Method::GET, "/atom/blog"), Page::new(1, 10))
        .await
        .unwrap();
    assert!(page.feed.entries.is_empty());
    assert!(page.feed.updated.is_some());
    assert!(!page.has_next);
}

// ============================================================================
// Categories
// ============================================================================

#[tokio::test]
async fn test_categories_collect_terms_in_use() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    for (slug, terms) in [("a", vec!["rust", "atom"]), ("b", vec!["rust"])] {
        let mut entry = test_entry(slug);
        entry.categories = terms.into_iter().map(Category::new).collect();
        adapter.post_entry(entry, &post_request(Some(slug))).await.unwrap();
    }

    let categories = adapter
        .categories(&post_request(None))
        .await
        .unwrap()
        .unwrap();
    assert!(!categories.fixed);
    let terms: Vec<&str> = categories.categories.iter().map(|c| c.term.as_str()).collect();
    assert_eq!(terms, vec!["atom", "rust"]);
}

#[tokio::test]
async fn test_configured_categories_are_fixed() {
    let mut config = CollectionConfig::new("blog", "sqlite");
    config.categories = vec!["news".to_string(), "tech".to_string()];
    let adapter = SqliteAdapter::from_config(test_db().await, &config);

    let categories = adapter
        .categories(&post_request(None))
        .await
        .unwrap()
        .unwrap();
    assert!(categories.fixed);
    assert_eq!(categories.categories.len(), 2);
}

// ============================================================================
// Media
// ============================================================================

#[tokio::test]
async fn test_entry_only_collection_has_no_media() {
    let adapter = SqliteAdapter::new(test_db().await, "blog");
    assert!(adapter.media().is_none());
}

#[tokio::test]
async fn test_media_lifecycle() {
    let adapter = media_collection(test_db().await);
    let request = post_request(None);
    let media = adapter.media().unwrap();

    let entry = media
        .post_media("image/png", Bytes::from_static(b"png"), Some("cat"), &request)
        .await
        .unwrap();
    assert_eq!(entry.id, "cat");
    assert_eq!(entry.title, "cat");
    assert!(matches!(
        &entry.content,
        Some(Content::OutOfLine { media_type, .. }) if media_type == "image/png"
    ));

    let stored = media.get_media("cat", &request).await.unwrap();
    assert_eq!(stored.content_type, "image/png");
    assert_eq!(stored.bytes, Bytes::from_static(b"png"));
    assert_eq!(Some(stored.updated), entry.edited);

    let updated = media
        .put_media("cat", "image/gif", Bytes::from_static(b"gif"), &request)
        .await
        .unwrap();
    assert!(updated.edited > entry.edited);
    let stored = media.get_media("cat", &request).await.unwrap();
    assert_eq!(stored.content_type, "image/gif");
    assert_eq!(Some(stored.updated), updated.edited);

    // The media-link entry follows the new content type.
    let link = adapter.get_entry("cat", &request).await.unwrap();
    assert!(matches!(
        &link.content,
        Some(Content::OutOfLine { media_type, .. }) if media_type == "image/gif"
    ));

    media.delete_media("cat", &request).await.unwrap();
    assert!(matches!(
        media.get_media("cat", &request).await.unwrap_err(),
        ProtocolError::NotFound(_)
    ));
    assert!(adapter.get_entry("cat", &request).await.is_err());
}

#[tokio::test]
async fn test_deleting_media_link_entry_removes_media() {
    let adapter = media_collection(test_db().await);
    let request = post_request(None);
    let media = adapter.media().unwrap();
    media
        .post_media("image/png", Bytes::from_static(b"png"), Some("dog"), &request)
        .await
        .unwrap();

    adapter.delete_entry("dog", &request).await.unwrap();
    assert!(media.get_media("dog", &request).await.is_err());
}

#[tokio::test]
async fn test_put_media_on_plain_entry_is_not_found() {
    let adapter = media_collection(test_db().await);
    let request = post_request(Some("plain"));
    adapter.post_entry(test_entry("plain"), &request).await.unwrap();

    let err = adapter
        .media()
        .unwrap()
        .put_media("plain", "image/png", Bytes::from_static(b"x"), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));
}
