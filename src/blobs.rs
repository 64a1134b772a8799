//! Content-addressed, reference-counted blob store
//!
//! Large or attachment part bodies are stored once per fingerprint and
//! shared by reference count. The fingerprint is the SHA-256 of the
//! *decoded* bytes, so the same attachment re-wrapped at a different
//! base64 line length, or sent `7bit`, lands on the same row. The row
//! keeps the *original encoded* bytes so the on-the-wire form can be
//! returned verbatim at FETCH time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::{StoreError, StoreResult, is_unique_violation};
use crate::models::{BlobInfo, BlobStorage};

/// External object store the blob table can point into
///
/// The core never embeds the backend's transport semantics (retries,
/// timeouts) into its own contracts; implementations wrap their own.
pub trait BlobBackend: Send + Sync {
    /// Persist bytes externally, returning the backend's identifier
    fn store(&self, bytes: &[u8]) -> StoreResult<String>;

    /// Fetch bytes previously stored under `external_id`
    fn fetch(&self, external_id: &str) -> StoreResult<Vec<u8>>;
}

/// Compute the content fingerprint of an encoded body
///
/// Decodes according to the declared transfer encoding: base64 with all
/// whitespace stripped, quoted-printable in robust mode, everything else
/// (`7bit`, `8bit`, `binary`, empty, unknown) hashed as-is. Decode
/// failure falls back to hashing the raw bytes so malformed input never
/// fails a round trip.
pub fn fingerprint(raw: &[u8], transfer_encoding: &str) -> String {
    let decoded = decode_body(raw, transfer_encoding);
    let digest = Sha256::digest(decoded.as_deref().unwrap_or(raw));
    hex::encode(digest)
}

/// Decode an encoded body for fingerprinting
///
/// Returns `None` when the encoding keeps the bytes as-is or when the
/// decode fails.
fn decode_body(raw: &[u8], transfer_encoding: &str) -> Option<Vec<u8>> {
    match transfer_encoding.trim().to_ascii_lowercase().as_str() {
        "base64" => {
            let stripped: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            match BASE64.decode(&stripped) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(error = %e, "base64 decode failed, fingerprinting raw bytes");
                    None
                }
            }
        }
        "quoted-printable" => {
            match quoted_printable::decode(raw, quoted_printable::ParseMode::Robust) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(error = %e, "quoted-printable decode failed, fingerprinting raw bytes");
                    None
                }
            }
        }
        _ => None,
    }
}

/// Store an encoded body, deduplicating by fingerprint
///
/// On a fingerprint hit the refcount is incremented and the existing id
/// returned. On a miss a new row is inserted holding the original
/// encoded bytes; when a backend is supplied the bytes go there first,
/// falling back silently to local storage if the backend write fails.
pub fn put(
    conn: &Connection,
    raw: &[u8],
    transfer_encoding: &str,
    backend: Option<&dyn BlobBackend>,
) -> StoreResult<i64> {
    let digest = fingerprint(raw, transfer_encoding);
    if let Some(id) = incref_existing(conn, &digest)? {
        debug!(blob_id = id, "blob deduplicated");
        return Ok(id);
    }

    let (storage, external_id) = match backend {
        Some(backend) => match backend.store(raw) {
            Ok(external_id) => (BlobStorage::Remote, Some(external_id)),
            Err(e) => {
                warn!(error = %e, "remote blob store failed, falling back to local");
                (BlobStorage::Local, None)
            }
        },
        None => (BlobStorage::Local, None),
    };
    let inline: Option<&[u8]> = match storage {
        BlobStorage::Local => Some(raw),
        BlobStorage::Remote => None,
    };

    match conn.execute(
        "INSERT INTO blobs (sha256, size, inline_bytes, external_id, storage, refcount)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        params![digest, raw.len() as i64, inline, external_id, storage.as_str()],
    ) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        // A concurrent writer won the insert race; share its row.
        Err(e) if is_unique_violation(&e) => incref_existing(conn, &digest)?
            .ok_or_else(|| StoreError::Conflict(format!("blob {digest}"))),
        Err(e) => Err(e.into()),
    }
}

/// Increment the refcount of the row holding `digest`, if present
fn incref_existing(conn: &Connection, digest: &str) -> StoreResult<Option<i64>> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM blobs WHERE sha256 = ?1",
            params![digest],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        conn.execute(
            "UPDATE blobs SET refcount = refcount + 1 WHERE id = ?1",
            params![id],
        )?;
        return Ok(Some(id));
    }
    Ok(None)
}

/// Fetch the stored (encoded) bytes of a blob
///
/// Local rows read from the table; remote rows go through the supplied
/// backend.
///
/// # Errors
///
/// - `NotFound` if the row is absent
/// - `BackendUnavailable` if the row is remote and no backend was given
pub fn get(
    conn: &Connection,
    blob_id: i64,
    backend: Option<&dyn BlobBackend>,
) -> StoreResult<Vec<u8>> {
    let row: Option<(Option<Vec<u8>>, Option<String>, String)> = conn
        .query_row(
            "SELECT inline_bytes, external_id, storage FROM blobs WHERE id = ?1",
            params![blob_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (inline, external_id, storage) =
        row.ok_or_else(|| StoreError::not_found(format!("blob {blob_id}")))?;

    match BlobStorage::parse(&storage) {
        Some(BlobStorage::Local) => {
            inline.ok_or_else(|| StoreError::internal(format!("blob {blob_id} has no local bytes")))
        }
        Some(BlobStorage::Remote) => {
            let external_id = external_id.ok_or_else(|| {
                StoreError::internal(format!("blob {blob_id} is remote without an external id"))
            })?;
            let backend = backend.ok_or_else(|| {
                StoreError::BackendUnavailable(format!(
                    "blob {blob_id} is remote and no backend is configured"
                ))
            })?;
            backend.fetch(&external_id)
        }
        None => Err(StoreError::internal(format!(
            "blob {blob_id} has unknown storage '{storage}'"
        ))),
    }
}

/// Report where a blob's bytes live without fetching them
pub fn locate(conn: &Connection, blob_id: i64) -> StoreResult<(Option<String>, BlobStorage)> {
    let row: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT external_id, storage FROM blobs WHERE id = ?1",
            params![blob_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (external_id, storage) =
        row.ok_or_else(|| StoreError::not_found(format!("blob {blob_id}")))?;
    let storage = BlobStorage::parse(&storage)
        .ok_or_else(|| StoreError::internal(format!("blob {blob_id} has unknown storage")))?;
    Ok((external_id, storage))
}

/// Decrement a blob's refcount, deleting the row at zero
///
/// External storage deletion is the backend's responsibility and out of
/// core scope.
pub fn decref(conn: &Connection, blob_id: i64) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE blobs SET refcount = refcount - 1 WHERE id = ?1",
        params![blob_id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!("blob {blob_id}")));
    }
    conn.execute(
        "DELETE FROM blobs WHERE id = ?1 AND refcount <= 0",
        params![blob_id],
    )?;
    Ok(())
}

/// Row metadata by id, mainly for assertions and admin tooling
pub fn info(conn: &Connection, blob_id: i64) -> StoreResult<Option<BlobInfo>> {
    conn.query_row(
        "SELECT id, sha256, size, storage, external_id, refcount FROM blobs WHERE id = ?1",
        params![blob_id],
        |row| {
            let storage: String = row.get(3)?;
            Ok(BlobInfo {
                id: row.get(0)?,
                sha256: row.get(1)?,
                size: row.get(2)?,
                storage: BlobStorage::parse(&storage).unwrap_or(BlobStorage::Local),
                external_id: row.get(4)?,
                refcount: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}
