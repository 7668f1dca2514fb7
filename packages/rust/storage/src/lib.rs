//! libSQL storage layer for worldbooks, history, and rolls.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the current
//! worldbook per book, the append-only merge history, and the append-only
//! re-generation (roll) log.
//!
//! History and roll records are never updated or deleted in the hot path;
//! the `clear_*` operations are administrative.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use uuid::Uuid;

use loresmith_shared::{HistoryRecord, LoresmithError, Result, RollRecord, Worldbook};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LoresmithError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LoresmithError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Worldbook operations
    // -----------------------------------------------------------------------

    /// Insert or update the current state of a worldbook.
    pub async fn save_worldbook(&self, book_id: &str, name: &str, book: &Worldbook) -> Result<()> {
        let book_json = serde_json::to_string(book)
            .map_err(|e| LoresmithError::Storage(format!("serialize worldbook: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO worldbooks (id, name, book_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   book_json = excluded.book_json,
                   updated_at = excluded.updated_at",
                params![book_id, name, book_json.as_str(), now.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load a worldbook by ID. Returns `(name, book)`.
    pub async fn load_worldbook(&self, book_id: &str) -> Result<Option<(String, Worldbook)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, book_json FROM worldbooks WHERE id = ?1",
                params![book_id],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let name: String = row
                    .get(0)
                    .map_err(|e| LoresmithError::Storage(e.to_string()))?;
                let book_json: String = row
                    .get(1)
                    .map_err(|e| LoresmithError::Storage(e.to_string()))?;
                let book: Worldbook = serde_json::from_str(&book_json)
                    .map_err(|e| LoresmithError::Storage(format!("invalid book_json: {e}")))?;
                Ok(Some((name, book)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LoresmithError::Storage(e.to_string())),
        }
    }

    /// List all worldbooks. Returns `Vec<(id, name, updated_at)>`.
    pub async fn list_worldbooks(&self) -> Result<Vec<(String, String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, updated_at FROM worldbooks ORDER BY name",
                params![],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0)
                    .map_err(|e| LoresmithError::Storage(e.to_string()))?,
                row.get::<String>(1)
                    .map_err(|e| LoresmithError::Storage(e.to_string()))?,
                row.get::<String>(2)
                    .map_err(|e| LoresmithError::Storage(e.to_string()))?,
            ));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // History operations (append-only)
    // -----------------------------------------------------------------------

    /// Append one merge record. Returns the generated record ID.
    pub async fn append_history(&self, book_id: &str, record: &HistoryRecord) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let previous_json = serde_json::to_string(&record.previous)
            .map_err(|e| LoresmithError::Storage(format!("serialize snapshot: {e}")))?;
        let changed_json = serde_json::to_string(&record.changed)
            .map_err(|e| LoresmithError::Storage(format!("serialize changes: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO history_records
                   (id, book_id, memory_index, memory_title, previous_json, changed_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    book_id,
                    record.memory_index as i64,
                    record.memory_title.as_str(),
                    previous_json.as_str(),
                    changed_json.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// List all merge records for a book, newest first.
    pub async fn list_history(&self, book_id: &str) -> Result<Vec<HistoryRecord>> {
        self.query_history(
            "SELECT memory_index, memory_title, previous_json, changed_json, created_at
             FROM history_records WHERE book_id = ?1 ORDER BY id DESC",
            params![book_id],
        )
        .await
    }

    /// List merge records for one chunk index, newest first.
    pub async fn list_history_by_index(
        &self,
        book_id: &str,
        memory_index: usize,
    ) -> Result<Vec<HistoryRecord>> {
        self.query_history(
            "SELECT memory_index, memory_title, previous_json, changed_json, created_at
             FROM history_records WHERE book_id = ?1 AND memory_index = ?2 ORDER BY id DESC",
            params![book_id, memory_index as i64],
        )
        .await
    }

    async fn query_history(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<HistoryRecord>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_history(&row)?);
        }
        Ok(results)
    }

    /// Delete every merge record for a book. Administrative only.
    pub async fn clear_history(&self, book_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM history_records WHERE book_id = ?1",
                params![book_id],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Roll operations (append-only)
    // -----------------------------------------------------------------------

    /// Append one re-generation record. Returns the generated record ID.
    pub async fn append_roll(&self, book_id: &str, record: &RollRecord) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let result_json = serde_json::to_string(&record.result)
            .map_err(|e| LoresmithError::Storage(format!("serialize roll result: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO roll_records
                   (id, book_id, chunk_index, prompt_hash, prompt, response, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    book_id,
                    record.chunk_index as i64,
                    record.prompt_hash.as_str(),
                    record.prompt.as_str(),
                    record.response.as_str(),
                    result_json.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// List re-generation attempts for one chunk, newest first.
    pub async fn list_rolls_by_chunk(
        &self,
        book_id: &str,
        chunk_index: usize,
    ) -> Result<Vec<RollRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT chunk_index, prompt_hash, prompt, response, result_json, created_at
                 FROM roll_records WHERE book_id = ?1 AND chunk_index = ?2 ORDER BY id DESC",
                params![book_id, chunk_index as i64],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_roll(&row)?);
        }
        Ok(results)
    }

    /// Delete every roll record for a book. Administrative only.
    pub async fn clear_rolls(&self, book_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM roll_records WHERE book_id = ?1",
                params![book_id],
            )
            .await
            .map_err(|e| LoresmithError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Convert a database row to a [`HistoryRecord`].
fn row_to_history(row: &libsql::Row) -> Result<HistoryRecord> {
    let previous_json: String = row
        .get(2)
        .map_err(|e| LoresmithError::Storage(e.to_string()))?;
    let changed_json: String = row
        .get(3)
        .map_err(|e| LoresmithError::Storage(e.to_string()))?;

    Ok(HistoryRecord {
        memory_index: row
            .get::<i64>(0)
            .map_err(|e| LoresmithError::Storage(e.to_string()))? as usize,
        memory_title: row
            .get::<String>(1)
            .map_err(|e| LoresmithError::Storage(e.to_string()))?,
        previous: serde_json::from_str(&previous_json)
            .map_err(|e| LoresmithError::Storage(format!("invalid previous_json: {e}")))?,
        changed: serde_json::from_str(&changed_json)
            .map_err(|e| LoresmithError::Storage(format!("invalid changed_json: {e}")))?,
        created_at: parse_timestamp(row, 4)?,
    })
}

/// Convert a database row to a [`RollRecord`].
fn row_to_roll(row: &libsql::Row) -> Result<RollRecord> {
    let result_json: String = row
        .get(4)
        .map_err(|e| LoresmithError::Storage(e.to_string()))?;

    Ok(RollRecord {
        chunk_index: row
            .get::<i64>(0)
            .map_err(|e| LoresmithError::Storage(e.to_string()))? as usize,
        prompt_hash: row
            .get::<String>(1)
            .map_err(|e| LoresmithError::Storage(e.to_string()))?,
        prompt: row
            .get::<String>(2)
            .map_err(|e| LoresmithError::Storage(e.to_string()))?,
        response: row
            .get::<String>(3)
            .map_err(|e| LoresmithError::Storage(e.to_string()))?,
        result: serde_json::from_str(&result_json)
            .map_err(|e| LoresmithError::Storage(format!("invalid result_json: {e}")))?,
        created_at: parse_timestamp(row, 5)?,
    })
}

fn parse_timestamp(row: &libsql::Row, index: i32) -> Result<chrono::DateTime<chrono::Utc>> {
    let s: String = row
        .get(index)
        .map_err(|e| LoresmithError::Storage(e.to_string()))?;
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| LoresmithError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loresmith_shared::{Category, ChangeKind, ChangedEntry, Entry};

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ls_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn sample_book() -> Worldbook {
        let mut book = Worldbook::new();
        let mut cat = Category::new();
        cat.insert(
            "Aria".into(),
            Entry {
                keywords: vec!["aria".into()],
                content: "captain".into(),
            },
        );
        book.insert("角色".into(), cat);
        book
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ls_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn worldbook_save_load_roundtrip() {
        let storage = test_storage().await;
        let book = sample_book();

        storage
            .save_worldbook("book-1", "my novel", &book)
            .await
            .expect("save");

        let (name, loaded) = storage
            .load_worldbook("book-1")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(name, "my novel");
        assert_eq!(loaded, book);

        // Upsert with new content
        let mut updated = book.clone();
        updated
            .get_mut("角色")
            .unwrap()
            .get_mut("Aria")
            .unwrap()
            .content = "promoted".into();
        storage
            .save_worldbook("book-1", "my novel", &updated)
            .await
            .expect("save again");

        let (_, loaded) = storage.load_worldbook("book-1").await.unwrap().unwrap();
        assert_eq!(loaded["角色"]["Aria"].content, "promoted");

        let books = storage.list_worldbooks().await.expect("list");
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].1, "my novel");
    }

    #[tokio::test]
    async fn missing_worldbook_is_none() {
        let storage = test_storage().await;
        assert!(storage.load_worldbook("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_append_and_list() {
        let storage = test_storage().await;
        storage
            .save_worldbook("book-1", "novel", &sample_book())
            .await
            .unwrap();

        for index in [0usize, 1, 1] {
            let record = HistoryRecord {
                memory_index: index,
                memory_title: format!("chapter {index}"),
                previous: sample_book(),
                changed: vec![ChangedEntry {
                    kind: ChangeKind::Add,
                    category: "角色".into(),
                    entry_name: "Aria".into(),
                }],
                created_at: Utc::now(),
            };
            let id = storage
                .append_history("book-1", &record)
                .await
                .expect("append");
            assert!(!id.is_empty());
        }

        let all = storage.list_history("book-1").await.expect("list");
        assert_eq!(all.len(), 3);
        // Newest first
        assert_eq!(all[0].memory_index, 1);
        assert_eq!(all[2].memory_index, 0);

        let for_one = storage
            .list_history_by_index("book-1", 1)
            .await
            .expect("list by index");
        assert_eq!(for_one.len(), 2);
        assert!(for_one.iter().all(|r| r.memory_index == 1));
        assert_eq!(for_one[0].changed.len(), 1);

        storage.clear_history("book-1").await.expect("clear");
        assert!(storage.list_history("book-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rolls_append_and_list_newest_first() {
        let storage = test_storage().await;
        storage
            .save_worldbook("book-1", "novel", &sample_book())
            .await
            .unwrap();

        for attempt in 0..2 {
            let record = RollRecord {
                chunk_index: 4,
                prompt_hash: "abc123".into(),
                prompt: "extract entries".into(),
                response: format!("response {attempt}"),
                result: sample_book(),
                created_at: Utc::now(),
            };
            storage.append_roll("book-1", &record).await.expect("append");
        }

        let rolls = storage
            .list_rolls_by_chunk("book-1", 4)
            .await
            .expect("list");
        assert_eq!(rolls.len(), 2);
        assert_eq!(rolls[0].response, "response 1");
        assert_eq!(rolls[1].response, "response 0");

        assert!(
            storage
                .list_rolls_by_chunk("book-1", 99)
                .await
                .unwrap()
                .is_empty()
        );

        storage.clear_rolls("book-1").await.expect("clear");
        assert!(
            storage
                .list_rolls_by_chunk("book-1", 4)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
