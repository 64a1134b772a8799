//! Database schemas for the catalog and the per-owner shards
//!
//! One shared catalog (`shared.db`) plus one shard file per user or role
//! mailbox. Schema installation is idempotent and versioned through
//! SQLite's `user_version`; a file carrying any other version is rejected
//! (no migration support).

use rusqlite::Connection;

use crate::errors::{StoreError, StoreResult};

/// Version stamped into `user_version` after install
const SCHEMA_VERSION: i64 = 1;

/// Catalog tables: cross-owner registries
const CATALOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    domain_id INTEGER NOT NULL REFERENCES domains(id),
    enabled INTEGER NOT NULL DEFAULT 1,
    password_initialized INTEGER NOT NULL DEFAULT 0,
    UNIQUE (username, domain_id)
);
CREATE INDEX IF NOT EXISTS idx_users_domain ON users (domain_id);

CREATE TABLE IF NOT EXISTS role_mailboxes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    domain_id INTEGER NOT NULL REFERENCES domains(id),
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS user_role_assignments (
    user_id INTEGER NOT NULL REFERENCES users(id),
    role_mailbox_id INTEGER NOT NULL REFERENCES role_mailboxes(id),
    assigned_by TEXT NOT NULL DEFAULT '',
    assigned_at INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    UNIQUE (user_id, role_mailbox_id)
);
CREATE INDEX IF NOT EXISTS idx_assignments_role
    ON user_role_assignments (role_mailbox_id, is_active);
";

/// Per-owner shard tables: mailboxes, messages, parts, blobs, queues
///
/// Headers, addresses, parts, and links cascade off their message row;
/// blob references stay logical because decref must run before delete.
const SHARD_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mailboxes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    parent_id INTEGER REFERENCES mailboxes(id),
    uid_validity INTEGER NOT NULL,
    uid_next INTEGER NOT NULL DEFAULT 1,
    special_use TEXT NOT NULL DEFAULT '',
    UNIQUE (owner_id, name)
);

CREATE TABLE IF NOT EXISTS blobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sha256 TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    inline_bytes BLOB,
    external_id TEXT,
    storage TEXT NOT NULL DEFAULT 'LOCAL',
    refcount INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL DEFAULT '',
    in_reply_to TEXT NOT NULL DEFAULT '',
    refs TEXT NOT NULL DEFAULT '',
    date INTEGER NOT NULL,
    size INTEGER NOT NULL,
    received_at INTEGER NOT NULL,
    thread_id INTEGER
);

CREATE TABLE IF NOT EXISTS message_headers (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    sequence INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_headers_message
    ON message_headers (message_id, sequence);

CREATE TABLE IF NOT EXISTS addresses (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    email TEXT NOT NULL,
    sequence INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_addresses_message
    ON addresses (message_id, kind, sequence);

CREATE TABLE IF NOT EXISTS message_parts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    part_number INTEGER NOT NULL,
    parent_part_id INTEGER REFERENCES message_parts(id),
    content_type TEXT NOT NULL DEFAULT 'text/plain',
    content_disposition TEXT NOT NULL DEFAULT '',
    content_transfer_encoding TEXT NOT NULL DEFAULT '',
    charset TEXT NOT NULL DEFAULT '',
    filename TEXT,
    content_id TEXT NOT NULL DEFAULT '',
    blob_id INTEGER,
    inline_text TEXT,
    size INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_parts_message ON message_parts (message_id, id);

CREATE TABLE IF NOT EXISTS message_mailbox (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id),
    uid INTEGER NOT NULL,
    flags TEXT NOT NULL DEFAULT '',
    internal_date INTEGER NOT NULL,
    added_at INTEGER NOT NULL,
    UNIQUE (mailbox_id, uid)
);
CREATE INDEX IF NOT EXISTS idx_links_message ON message_mailbox (message_id);

CREATE TABLE IF NOT EXISTS subscriptions (
    user_id INTEGER NOT NULL,
    mailbox_name TEXT NOT NULL,
    UNIQUE (user_id, mailbox_name)
);

CREATE TABLE IF NOT EXISTS delivery_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL,
    recipient TEXT NOT NULL,
    sender TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    user_id INTEGER,
    delivered_at INTEGER NOT NULL,
    response TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS outbound_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 5,
    next_retry_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    last_error TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    sent_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_outbound_due
    ON outbound_queue (status, next_retry_at);
";

/// Apply per-connection settings
///
/// Referential-integrity checks are on for every connection; the busy
/// timeout keeps concurrent writers queued instead of failing fast.
pub fn configure_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// Install the catalog schema if absent
pub fn install_catalog(conn: &Connection) -> StoreResult<()> {
    install(conn, CATALOG_SCHEMA)
}

/// Install the per-owner shard schema if absent
pub fn install_shard(conn: &Connection) -> StoreResult<()> {
    install(conn, SHARD_SCHEMA)
}

fn install(conn: &Connection, ddl: &str) -> StoreResult<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version != 0 {
        return Err(StoreError::internal(format!(
            "unrecognized schema version {version} (expected {SCHEMA_VERSION})"
        )));
    }
    conn.execute_batch(ddl)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
