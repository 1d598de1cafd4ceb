use super::schema::Database;
use super::types::{DatabaseError, EntryRow, MediaRow, StoredMedia};
use crate::model::Entry;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

fn modified_micros(entry: &Entry) -> i64 {
    entry.modified().map(|m| m.timestamp_micros()).unwrap_or(0)
}

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// Inserts a new entry. Returns `false` when the id is already taken in
    /// this collection; the stored entry is left untouched in that case.
    pub async fn insert_entry(&self, collection: &str, entry: &Entry) -> Result<bool, DatabaseError> {
        let document = serde_json::to_string(entry)?;
        let result = sqlx::query(
            r#"
            INSERT INTO entries (collection, id, title, modified, document)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO NOTHING
        "#,
        )
        .bind(collection)
        .bind(&entry.id)
        .bind(&entry.title)
        .bind(modified_micros(entry))
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    /// Replaces a stored entry. Returns `false` if it does not exist.
    pub async fn update_entry(&self, collection: &str, entry: &Entry) -> Result<bool, DatabaseError> {
        let document = serde_json::to_string(entry)?;
        let result = sqlx::query(
            "UPDATE entries SET title = ?, modified = ?, document = ? WHERE collection = ? AND id = ?",
        )
        .bind(&entry.title)
        .bind(modified_micros(entry))
        .bind(&document)
        .bind(collection)
        .bind(&entry.id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_entry(&self, collection: &str, id: &str) -> Result<Option<Entry>, DatabaseError> {
        let row: Option<EntryRow> =
            sqlx::query_as("SELECT document FROM entries WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

        row.map(EntryRow::into_entry).transpose()
    }

    /// Deletes an entry and, through the foreign key, its media resource.
    pub async fn delete_entry(&self, collection: &str, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM entries WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    /// One page of a collection, most recently modified first.
    pub async fn list_entries(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT document FROM entries
            WHERE collection = ?
            ORDER BY modified DESC, id
            LIMIT ? OFFSET ?
        "#,
        )
        .bind(collection)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    pub async fn count_entries(&self, collection: &str) -> Result<usize, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(count.max(0) as usize)
    }

    /// Distinct category terms used by a collection's entries.
    pub async fn category_terms(&self, collection: &str) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT json_extract(c.value, '$.term') AS term
            FROM entries e, json_each(e.document, '$.categories') c
            WHERE e.collection = ? AND term IS NOT NULL
            ORDER BY term
        "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    // ========================================================================
    // Media Operations
    // ========================================================================

    /// Inserts a media-link entry and its media resource in one transaction.
    /// Returns `false`, storing nothing, when the id is already taken.
    pub async fn insert_media_entry(
        &self,
        collection: &str,
        entry: &Entry,
        content_type: &str,
        data: &[u8],
    ) -> Result<bool, DatabaseError> {
        let document = serde_json::to_string(entry)?;
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO entries (collection, id, title, modified, document)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO NOTHING
        "#,
        )
        .bind(collection)
        .bind(&entry.id)
        .bind(&entry.title)
        .bind(modified_micros(entry))
        .bind(&document)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .rows_affected()
            > 0;
        if !inserted {
            return Ok(false);
        }

        upsert_media(&mut tx, collection, &entry.id, content_type, data, media_stamp(entry)).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(true)
    }

    /// Replaces a media-link entry and its media resource together. Returns
    /// `false` if the entry does not exist.
    pub async fn update_media_entry(
        &self,
        collection: &str,
        entry: &Entry,
        content_type: &str,
        data: &[u8],
    ) -> Result<bool, DatabaseError> {
        let document = serde_json::to_string(entry)?;
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let updated = sqlx::query(
            "UPDATE entries SET title = ?, modified = ?, document = ? WHERE collection = ? AND id = ?",
        )
        .bind(&entry.title)
        .bind(modified_micros(entry))
        .bind(&document)
        .bind(collection)
        .bind(&entry.id)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .rows_affected()
            > 0;
        if !updated {
            return Ok(false);
        }

        upsert_media(&mut tx, collection, &entry.id, content_type, data, media_stamp(entry)).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(true)
    }

    pub async fn get_media(&self, collection: &str, id: &str) -> Result<Option<StoredMedia>, DatabaseError> {
        let row: Option<MediaRow> = sqlx::query_as(
            "SELECT content_type, data, updated FROM media WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(MediaRow::into_media))
    }
}

/// The media resource shares its media-link entry's modification stamp.
fn media_stamp(entry: &Entry) -> DateTime<Utc> {
    entry.modified().unwrap_or_else(Utc::now)
}

async fn upsert_media(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
    content_type: &str,
    data: &[u8],
    updated: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO media (collection, id, content_type, data, updated)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(collection, id) DO UPDATE SET
            content_type = excluded.content_type,
            data = excluded.data,
            updated = excluded.updated
    "#,
    )
    .bind(collection)
    .bind(id)
    .bind(content_type)
    .bind(data)
    .bind(updated.timestamp_micros())
    .execute(conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::model::{Category, Content, Entry};
    use crate::storage::Database;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn entry(id: &str, minute: u32) -> Entry {
        Entry::new(id, format!("Entry {id}"))
            .with_author("Ada")
            .with_updated(Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap())
            .with_content(Content::text("body"))
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let db = test_db().await;
        let e = entry("urn:1", 0);
        assert!(db.insert_entry("blog", &e).await.unwrap());
        assert_eq!(db.get_entry("blog", "urn:1").await.unwrap(), Some(e));
        assert_eq!(db.get_entry("other", "urn:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_duplicate_id_reports_false() {
        let db = test_db().await;
        assert!(db.insert_entry("blog", &entry("urn:1", 0)).await.unwrap());
        let mut dup = entry("urn:1", 5);
        dup.title = "changed".into();
        assert!(!db.insert_entry("blog", &dup).await.unwrap());
        let stored = db.get_entry("blog", "urn:1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Entry urn:1");
        // Same id in another collection is fine.
        assert!(db.insert_entry("news", &dup).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let db = test_db().await;
        let mut e = entry("urn:1", 0);
        assert!(!db.update_entry("blog", &e).await.unwrap());
        db.insert_entry("blog", &e).await.unwrap();
        e.title = "Renamed".into();
        assert!(db.update_entry("blog", &e).await.unwrap());
        assert_eq!(
            db.get_entry("blog", "urn:1").await.unwrap().map(|e| e.title),
            Some("Renamed".to_string())
        );
        assert!(db.delete_entry("blog", "urn:1").await.unwrap());
        assert!(!db.delete_entry("blog", "urn:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_orders_by_modified_desc() {
        let db = test_db().await;
        for (id, minute) in [("a", 1), ("b", 3), ("c", 2)] {
            db.insert_entry("blog", &entry(id, minute)).await.unwrap();
        }
        let ids: Vec<String> = db
            .list_entries("blog", 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let page: Vec<String> = db
            .list_entries("blog", 1, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(page, vec!["c"]);
        assert_eq!(db.count_entries("blog").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_category_terms() {
        let db = test_db().await;
        let mut a = entry("a", 0);
        a.categories = vec![Category::new("rust"), Category::new("atom")];
        let mut b = entry("b", 1);
        b.categories = vec![Category::new("rust")];
        db.insert_entry("blog", &a).await.unwrap();
        db.insert_entry("blog", &b).await.unwrap();
        db.insert_entry("blog", &entry("c", 2)).await.unwrap();
        db.insert_entry("news", &a).await.unwrap();

        assert_eq!(db.category_terms("blog").await.unwrap(), vec!["atom", "rust"]);
        assert!(db.category_terms("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_media_follows_entry_lifecycle() {
        let db = test_db().await;
        let mut link = entry("m1", 0);
        link.edited = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(db.insert_media_entry("pics", &link, "image/png", b"\x89PNG").await.unwrap());
        assert!(!db.insert_media_entry("pics", &link, "image/png", b"dup").await.unwrap());

        let second = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        link.edited = Some(second);
        assert!(db.update_media_entry("pics", &link, "image/gif", b"GIF8").await.unwrap());

        let media = db.get_media("pics", "m1").await.unwrap().unwrap();
        assert_eq!(media.content_type, "image/gif");
        assert_eq!(media.data, b"GIF8".to_vec());
        assert_eq!(media.updated, second);

        db.delete_entry("pics", "m1").await.unwrap();
        assert!(db.get_media("pics", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_media_requires_entry() {
        let db = test_db().await;
        assert!(!db
            .update_media_entry("pics", &entry("ghost", 0), "image/png", b"x")
            .await
            .unwrap());
        assert!(db.get_media("pics", "ghost").await.unwrap().is_none());
    }
}
