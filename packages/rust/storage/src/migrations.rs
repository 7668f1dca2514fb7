//! SQL migration definitions for the Loresmith database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: worldbooks, history_records, roll_records",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Current worldbook state per book
CREATE TABLE IF NOT EXISTS worldbooks (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    book_json  TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Append-only merge audit log
CREATE TABLE IF NOT EXISTS history_records (
    id            TEXT PRIMARY KEY,
    book_id       TEXT NOT NULL REFERENCES worldbooks(id) ON DELETE CASCADE,
    memory_index  INTEGER NOT NULL,
    memory_title  TEXT NOT NULL,
    previous_json TEXT NOT NULL,
    changed_json  TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_book ON history_records(book_id);
CREATE INDEX IF NOT EXISTS idx_history_book_index ON history_records(book_id, memory_index);

-- Append-only re-generation log keyed by chunk index
CREATE TABLE IF NOT EXISTS roll_records (
    id          TEXT PRIMARY KEY,
    book_id     TEXT NOT NULL REFERENCES worldbooks(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    prompt_hash TEXT NOT NULL,
    prompt      TEXT NOT NULL,
    response    TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rolls_book_chunk ON roll_records(book_id, chunk_index);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
