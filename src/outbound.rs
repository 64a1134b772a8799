//! Outbound relay queue
//!
//! Per-shard queue of messages awaiting dispatch by the (out-of-crate)
//! SMTP relay. The core only tracks state: an entry is eligible when it
//! is `PENDING` and its `next_retry_at` has passed; the relay decides
//! backoff and reports outcomes back.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::clock::from_epoch;
use crate::errors::{StoreError, StoreResult};
use crate::models::{OutboundEntry, OutboundStatus};

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundEntry> {
    let status: String = row.get(8)?;
    let sent_at: Option<i64> = row.get(10)?;
    Ok(OutboundEntry {
        id: row.get(0)?,
        message_id: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        next_retry_at: from_epoch(row.get(6)?),
        status: OutboundStatus::parse(&status).unwrap_or(OutboundStatus::Failed),
        last_error: row.get(7)?,
        created_at: from_epoch(row.get(9)?),
        sent_at: sent_at.map(from_epoch),
    })
}

const ENTRY_COLUMNS: &str = "id, message_id, sender, recipient, retry_count, max_retries, \
                             next_retry_at, last_error, status, created_at, sent_at";

/// Queue a message for relay
///
/// The entry becomes eligible immediately (`next_retry_at = now`).
pub fn enqueue(
    conn: &Connection,
    message_id: i64,
    sender: &str,
    recipient: &str,
    max_retries: u32,
    now: DateTime<Utc>,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO outbound_queue
             (message_id, sender, recipient, max_retries, next_retry_at, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?5)",
        params![message_id, sender, recipient, max_retries, now.timestamp()],
    )?;
    let id = conn.last_insert_rowid();
    debug!(entry = id, recipient, "outbound entry queued");
    Ok(id)
}

/// Load one queue entry
pub fn get_entry(conn: &Connection, id: i64) -> StoreResult<OutboundEntry> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM outbound_queue WHERE id = ?1"),
        params![id],
        entry_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("outbound entry {id}")))
}

/// Entries eligible for dispatch, oldest retry first
pub fn due(conn: &Connection, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<OutboundEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM outbound_queue
         WHERE status = 'PENDING' AND next_retry_at <= ?1
         ORDER BY next_retry_at LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![now.timestamp(), limit as i64], entry_from_row)?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Record a successful relay
pub fn mark_sent(conn: &Connection, id: i64, now: DateTime<Utc>) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE outbound_queue SET status = 'SENT', sent_at = ?2, last_error = ''
         WHERE id = ?1",
        params![id, now.timestamp()],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!("outbound entry {id}")));
    }
    Ok(())
}

/// Record a failed relay attempt
///
/// Increments the retry counter and reschedules; once the counter
/// reaches `max_retries` the entry goes terminal `FAILED` and stops
/// matching the eligibility query.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    next_retry_at: DateTime<Utc>,
) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE outbound_queue SET
             retry_count = retry_count + 1,
             last_error = ?2,
             next_retry_at = ?3,
             status = CASE WHEN retry_count + 1 >= max_retries
                           THEN 'FAILED' ELSE 'PENDING' END
         WHERE id = ?1",
        params![id, error, next_retry_at.timestamp()],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!("outbound entry {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rusqlite::Connection;

    use crate::models::OutboundStatus;
    use crate::schema;

    use super::{due, enqueue, get_entry, mark_failed, mark_sent};

    fn shard() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        schema::configure_connection(&conn).expect("configure");
        schema::install_shard(&conn).expect("install");
        conn
    }

    fn now() -> chrono::DateTime<chrono::Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fresh_entries_are_immediately_due() {
        let conn = shard();
        let id = enqueue(&conn, 1, "a@example.com", "b@example.org", 3, now()).expect("enqueue");
        let eligible = due(&conn, now(), 10).expect("due");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, id);
        assert_eq!(eligible[0].status, OutboundStatus::Pending);
    }

    #[test]
    fn sent_entries_leave_the_queue() {
        let conn = shard();
        let id = enqueue(&conn, 1, "a@example.com", "b@example.org", 3, now()).expect("enqueue");
        mark_sent(&conn, id, now()).expect("sent");
        assert!(due(&conn, now(), 10).expect("due").is_empty());
        let entry = get_entry(&conn, id).expect("entry");
        assert_eq!(entry.status, OutboundStatus::Sent);
        assert!(entry.sent_at.is_some());
    }

    #[test]
    fn failures_reschedule_until_retries_run_out() {
        let conn = shard();
        let id = enqueue(&conn, 1, "a@example.com", "b@example.org", 2, now()).expect("enqueue");

        let later = now() + Duration::minutes(5);
        mark_failed(&conn, id, "451 greylisted", later).expect("first failure");
        assert!(due(&conn, now(), 10).expect("due").is_empty());
        let eligible = due(&conn, later, 10).expect("due later");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].retry_count, 1);

        mark_failed(&conn, id, "451 greylisted", later + Duration::minutes(5))
            .expect("second failure");
        let entry = get_entry(&conn, id).expect("entry");
        assert_eq!(entry.status, OutboundStatus::Failed);
        assert!(due(&conn, later + Duration::hours(1), 10).expect("due").is_empty());
    }
}
