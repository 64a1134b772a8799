//! Message persistence: rows for headers, addresses, and parts
//!
//! The store half of the codec (§ parse → store → reconstruct): a parsed
//! message becomes one message row plus ordered header, address, and part
//! rows in the owner's shard. Large or named part bodies are delegated to
//! the blob store; small text stays inline on the part row.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::blobs::{self, BlobBackend};
use crate::clock::from_epoch;
use crate::errors::{StoreError, StoreResult};
use crate::mime::{ParsedBody, ParsedMessage};
use crate::models::{AddressField, AddressKind, HeaderField, MessageMeta, PartRow, StoredBody};

/// Store a parsed message into an owner's shard
///
/// Everything lands in one transaction: a part-store failure aborts the
/// whole message. Part bodies over `inline_limit` bytes, and any part
/// carrying a filename, go to the blob store; the rest are kept inline.
///
/// # Errors
///
/// Surfaces database failures; blob decode issues never fail (the blob
/// store falls back to raw-byte fingerprinting).
pub fn store_message(
    conn: &mut Connection,
    parsed: &ParsedMessage,
    received_at: DateTime<Utc>,
    inline_limit: usize,
    backend: Option<&dyn BlobBackend>,
) -> StoreResult<i64> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO messages (subject, in_reply_to, refs, date, size, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            parsed.subject,
            parsed.in_reply_to,
            parsed.references,
            parsed.date.timestamp(),
            parsed.size as i64,
            received_at.timestamp(),
        ],
    )?;
    let message_id = tx.last_insert_rowid();

    for (sequence, header) in parsed.headers.iter().enumerate() {
        tx.execute(
            "INSERT INTO message_headers (message_id, name, value, sequence)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, header.name, header.value, sequence as i64],
        )?;
    }

    let lists = [
        (AddressKind::From, &parsed.from),
        (AddressKind::To, &parsed.to),
        (AddressKind::Cc, &parsed.cc),
        (AddressKind::Bcc, &parsed.bcc),
    ];
    for (kind, list) in lists {
        for (sequence, addr) in list.iter().enumerate() {
            tx.execute(
                "INSERT INTO addresses (message_id, kind, name, email, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![message_id, kind.as_str(), addr.name, addr.email, sequence as i64],
            )?;
        }
    }

    // Flat order is the canonical storage order; containers precede their
    // children, so every parent id is known by the time a child inserts.
    let mut part_ids: Vec<i64> = Vec::with_capacity(parsed.parts.len());
    for part in &parsed.parts {
        let parent_id = match part.parent {
            Some(index) => Some(*part_ids.get(index).ok_or_else(|| {
                StoreError::internal(format!("part parent index {index} out of range"))
            })?),
            None => None,
        };

        let (blob_id, inline_text, size) = match &part.body {
            ParsedBody::Container => (None, None, 0_i64),
            ParsedBody::Data(body) => {
                if body.len() > inline_limit || part.filename.is_some() {
                    let id = blobs::put(&tx, body, &part.transfer_encoding, backend)?;
                    (Some(id), None, body.len() as i64)
                } else {
                    let text = String::from_utf8_lossy(body).into_owned();
                    (None, Some(text), body.len() as i64)
                }
            }
        };

        tx.execute(
            "INSERT INTO message_parts
                 (message_id, part_number, parent_part_id, content_type,
                  content_disposition, content_transfer_encoding, charset,
                  filename, content_id, blob_id, inline_text, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message_id,
                part.part_number,
                parent_id,
                part.content_type,
                part.content_disposition,
                part.transfer_encoding,
                part.charset,
                part.filename,
                part.content_id,
                blob_id,
                inline_text,
                size,
            ],
        )?;
        part_ids.push(tx.last_insert_rowid());
    }

    tx.commit()?;
    debug!(message_id, parts = parsed.parts.len(), "message stored");
    Ok(message_id)
}

/// Load a message row
pub fn get_message(conn: &Connection, message_id: i64) -> StoreResult<MessageMeta> {
    conn.query_row(
        "SELECT id, subject, in_reply_to, refs, date, size, received_at, thread_id
         FROM messages WHERE id = ?1",
        params![message_id],
        |row| {
            Ok(MessageMeta {
                id: row.get(0)?,
                subject: row.get(1)?,
                in_reply_to: row.get(2)?,
                references: row.get(3)?,
                date: from_epoch(row.get(4)?),
                size: row.get(5)?,
                received_at: from_epoch(row.get(6)?),
                thread_id: row.get(7)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))
}

/// Load a message's headers in stored order
pub fn load_headers(conn: &Connection, message_id: i64) -> StoreResult<Vec<HeaderField>> {
    let mut stmt = conn.prepare(
        "SELECT name, value FROM message_headers WHERE message_id = ?1 ORDER BY sequence",
    )?;
    let rows = stmt.query_map(params![message_id], |row| {
        Ok(HeaderField {
            name: row.get(0)?,
            value: row.get(1)?,
        })
    })?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Load one ordered address list of a message
pub fn load_addresses(
    conn: &Connection,
    message_id: i64,
    kind: AddressKind,
) -> StoreResult<Vec<AddressField>> {
    let mut stmt = conn.prepare(
        "SELECT name, email FROM addresses
         WHERE message_id = ?1 AND kind = ?2 ORDER BY sequence",
    )?;
    let rows = stmt.query_map(params![message_id, kind.as_str()], |row| {
        Ok(AddressField {
            name: row.get(0)?,
            email: row.get(1)?,
        })
    })?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Load a message's parts in canonical (flat, depth-first) order
///
/// The schema lets `parent_part_id` point at any part row; the loader
/// rejects self- and forward-references so the flat list always encodes
/// a tree.
pub fn load_parts(conn: &Connection, message_id: i64) -> StoreResult<Vec<PartRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, part_number, parent_part_id, content_type,
                content_disposition, content_transfer_encoding, charset,
                filename, content_id, blob_id, inline_text, size
         FROM message_parts WHERE message_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![message_id], |row| {
        let blob_id: Option<i64> = row.get(10)?;
        let inline_text: Option<String> = row.get(11)?;
        let content_type: String = row.get(4)?;
        let body = match (blob_id, inline_text) {
            (Some(id), _) => StoredBody::Blob(id),
            (None, Some(text)) => StoredBody::Inline(text),
            (None, None) => StoredBody::Container,
        };
        Ok(PartRow {
            id: row.get(0)?,
            message_id: row.get(1)?,
            part_number: row.get(2)?,
            parent_part_id: row.get(3)?,
            content_type,
            content_disposition: row.get(5)?,
            transfer_encoding: row.get(6)?,
            charset: row.get(7)?,
            filename: row.get(8)?,
            content_id: row.get(9)?,
            body,
            size: row.get(12)?,
        })
    })?;
    let parts: Vec<PartRow> = rows.collect::<Result<_, _>>()?;

    let mut seen: Vec<i64> = Vec::with_capacity(parts.len());
    for part in &parts {
        if let Some(parent) = part.parent_part_id
            && !seen.contains(&parent)
        {
            return Err(StoreError::internal(format!(
                "part {} references parent {parent} outside the preceding list",
                part.id
            )));
        }
        seen.push(part.id);
    }
    Ok(parts)
}

/// Delete a message row and everything hanging off it
///
/// Blob references are decremented first, then the row delete cascades
/// through headers, addresses, parts, and links. Callers invoke this
/// only once the last mailbox link is gone.
pub fn delete_message(conn: &mut Connection, message_id: i64) -> StoreResult<()> {
    let tx = conn.transaction()?;
    delete_message_rows(&tx, message_id)?;
    tx.commit()?;
    Ok(())
}

/// Non-transactional delete body, for callers holding their own transaction
pub(crate) fn delete_message_rows(conn: &Connection, message_id: i64) -> StoreResult<()> {
    let mut stmt = conn.prepare(
        "SELECT blob_id FROM message_parts
         WHERE message_id = ?1 AND blob_id IS NOT NULL",
    )?;
    let blob_ids: Vec<i64> = stmt
        .query_map(params![message_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    for blob_id in blob_ids {
        blobs::decref(conn, blob_id)?;
    }
    let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
    if deleted == 0 {
        return Err(StoreError::not_found(format!("message {message_id}")));
    }
    debug!(message_id, "message deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;

    use crate::mime::parse_message;
    use crate::models::{AddressKind, StoredBody};
    use crate::schema;

    use super::{
        delete_message, get_message, load_addresses, load_headers, load_parts, store_message,
    };

    fn shard() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        schema::configure_connection(&conn).expect("configure");
        schema::install_shard(&conn).expect("install");
        conn
    }

    fn now() -> chrono::DateTime<chrono::Utc> {
        Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap()
    }

    fn mixed_message() -> Vec<u8> {
        let attachment = "QUJD".repeat(600);
        format!(
            concat!(
                "From: Alice <alice@example.com>\r\n",
                "To: bob@example.com, Carol <carol@example.com>\r\n",
                "Subject: report attached\r\n",
                "MIME-Version: 1.0\r\n",
                "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                "\r\n",
                "--b\r\n",
                "Content-Type: text/plain; charset=utf-8\r\n",
                "\r\n",
                "see attached\r\n",
                "--b\r\n",
                "Content-Type: application/octet-stream\r\n",
                "Content-Disposition: attachment; filename=\"data.bin\"\r\n",
                "Content-Transfer-Encoding: base64\r\n",
                "\r\n",
                "{attachment}\r\n",
                "--b--\r\n",
            ),
            attachment = attachment
        )
        .into_bytes()
    }

    #[test]
    fn stores_rows_in_canonical_order() {
        let mut conn = shard();
        let parsed = parse_message(&mixed_message(), now()).expect("parse");
        let id = store_message(&mut conn, &parsed, now(), 1024, None).expect("store");

        let meta = get_message(&conn, id).expect("meta");
        assert_eq!(meta.subject, "report attached");
        assert_eq!(meta.size as usize, mixed_message().len());

        let headers = load_headers(&conn, id).expect("headers");
        assert_eq!(headers[0].name, "From");
        assert_eq!(headers[2].name, "Subject");

        let to = load_addresses(&conn, id, AddressKind::To).expect("to list");
        assert_eq!(to.len(), 2);
        assert_eq!(to[1].name, "Carol");

        let parts = load_parts(&conn, id).expect("parts");
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0].body, StoredBody::Container));
        assert!(matches!(parts[1].body, StoredBody::Inline(_)));
        assert!(matches!(parts[2].body, StoredBody::Blob(_)));
        assert_eq!(parts[1].parent_part_id, Some(parts[0].id));
        assert_eq!(parts[2].parent_part_id, Some(parts[0].id));
        assert_eq!(parts[2].filename.as_deref(), Some("data.bin"));
    }

    #[test]
    fn small_named_parts_still_go_to_the_blob_store() {
        let mut conn = shard();
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"tiny.txt\"\r\n",
            "\r\n",
            "tiny\r\n",
            "--b--\r\n",
        )
        .as_bytes();
        let parsed = parse_message(raw, now()).expect("parse");
        let id = store_message(&mut conn, &parsed, now(), 1024, None).expect("store");

        let parts = load_parts(&conn, id).expect("parts");
        assert!(matches!(parts[1].body, StoredBody::Blob(_)));
    }

    #[test]
    fn delete_message_releases_blob_references() {
        let mut conn = shard();
        let parsed = parse_message(&mixed_message(), now()).expect("parse");
        let id = store_message(&mut conn, &parsed, now(), 1024, None).expect("store");

        let blob_count = |conn: &Connection| -> i64 {
            conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))
                .expect("count")
        };
        assert_eq!(blob_count(&conn), 1);

        delete_message(&mut conn, id).expect("delete");
        assert_eq!(blob_count(&conn), 0);
        assert!(get_message(&conn, id).is_err());

        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_parts", [], |row| row.get(0))
            .expect("count");
        assert_eq!(orphans, 0);
    }

    #[test]
    fn load_parts_rejects_forward_parent_references() {
        let mut conn = shard();
        let parsed = parse_message(b"Subject: x\r\n\r\nbody", now()).expect("parse");
        let id = store_message(&mut conn, &parsed, now(), 1024, None).expect("store");

        // Corrupt the row so the single part claims itself as parent.
        conn.execute(
            "UPDATE message_parts SET parent_part_id = id WHERE message_id = ?1",
            [id],
        )
        .expect("corrupt");
        let err = load_parts(&conn, id).expect_err("cycle must be rejected");
        assert!(err.to_string().contains("parent"));
    }
}
