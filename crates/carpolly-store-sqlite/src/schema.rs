//! SQL schema for the Carpolly SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
///
/// Every document of every collection lives in one table, keyed by its full
/// path. `seq` records creation order and survives overwrites, so children
/// enumerate in the order they were first written.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    path        TEXT NOT NULL UNIQUE,
    parent      TEXT NOT NULL,   -- path of the containing collection
    fields_json TEXT NOT NULL,   -- JSON object of tagged field values
    create_time TEXT NOT NULL,   -- RFC 3339 UTC; store-assigned
    update_time TEXT NOT NULL    -- RFC 3339 UTC; store-assigned
);

CREATE INDEX IF NOT EXISTS documents_parent_idx ON documents(parent, seq);

PRAGMA user_version = 1;
";
