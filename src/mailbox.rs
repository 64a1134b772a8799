//! Mailbox engine: folders, UID assignment, flags, subscriptions
//!
//! Per-shard folder tree with `/`-separated hierarchy, strictly monotonic
//! UID assignment through a serialized read-modify-write of `uid_next`,
//! and the RFC 3501 special cases: INBOX cannot be deleted or shadowed,
//! renaming INBOX moves its contents, and subscriptions are keyed by name
//! so they survive folder deletion.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::clock::{Clock, from_epoch};
use crate::errors::{StoreError, StoreResult, is_unique_violation};
use crate::message;
use crate::models::{Mailbox, MailboxCounts, MailboxLink};

/// Folders every fresh shard starts with, in fixed insertion order
const DEFAULT_MAILBOXES: [(&str, &str); 5] = [
    ("INBOX", "\\Inbox"),
    ("Sent", "\\Sent"),
    ("Drafts", "\\Drafts"),
    ("Trash", "\\Trash"),
    ("Spam", "\\Junk"),
];

/// Folders that refuse deletion (case-insensitive)
const PROTECTED: [&str; 4] = ["INBOX", "Sent", "Drafts", "Trash"];

/// Seed the default mailboxes into a fresh shard
///
/// A shard that already has mailboxes for the owner is left untouched,
/// so a crash between schema install and seeding heals on the next open.
pub fn seed_default_mailboxes(
    conn: &Connection,
    owner_id: i64,
    clock: &dyn Clock,
) -> StoreResult<()> {
    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mailboxes WHERE owner_id = ?1",
        params![owner_id],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Ok(());
    }
    for (name, special_use) in DEFAULT_MAILBOXES {
        conn.execute(
            "INSERT INTO mailboxes (owner_id, name, uid_validity, uid_next, special_use)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![owner_id, name, clock.now().timestamp(), special_use],
        )?;
    }
    debug!(owner_id, "default mailboxes seeded");
    Ok(())
}

fn mailbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mailbox> {
    Ok(Mailbox {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        uid_validity: row.get(4)?,
        uid_next: row.get(5)?,
        special_use: row.get(6)?,
    })
}

const MAILBOX_COLUMNS: &str = "id, owner_id, name, parent_id, uid_validity, uid_next, special_use";

/// Look up a mailbox by name
pub fn find_mailbox(conn: &Connection, owner_id: i64, name: &str) -> StoreResult<Option<Mailbox>> {
    conn.query_row(
        &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE owner_id = ?1 AND name = ?2"),
        params![owner_id, name],
        mailbox_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Look up a mailbox by name, failing if absent
pub fn get_mailbox(conn: &Connection, owner_id: i64, name: &str) -> StoreResult<Mailbox> {
    find_mailbox(conn, owner_id, name)?
        .ok_or_else(|| StoreError::not_found(format!("mailbox '{name}'")))
}

/// List an owner's mailboxes in creation order
pub fn list_mailboxes(conn: &Connection, owner_id: i64) -> StoreResult<Vec<Mailbox>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE owner_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![owner_id], mailbox_from_row)?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Create a mailbox
///
/// `uid_validity` is fixed to the current wallclock epoch seconds and
/// never changes afterwards; `uid_next` starts at 1. If the name nests
/// under an existing folder the parent link is recorded.
///
/// # Errors
///
/// - `Forbidden` for an empty name
/// - `AlreadyExists` if the owner already has the name
pub fn create_mailbox(
    conn: &Connection,
    owner_id: i64,
    name: &str,
    special_use: &str,
    clock: &dyn Clock,
) -> StoreResult<Mailbox> {
    if name.is_empty() {
        return Err(StoreError::Forbidden("mailbox name cannot be empty".to_owned()));
    }
    let parent_id = match name.rsplit_once('/') {
        Some((prefix, _)) => find_mailbox(conn, owner_id, prefix)?.map(|m| m.id),
        None => None,
    };
    let uid_validity = clock.now().timestamp();
    match conn.execute(
        "INSERT INTO mailboxes (owner_id, name, parent_id, uid_validity, uid_next, special_use)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![owner_id, name, parent_id, uid_validity, special_use],
    ) {
        Ok(_) => Ok(Mailbox {
            id: conn.last_insert_rowid(),
            owner_id,
            name: name.to_owned(),
            parent_id,
            uid_validity,
            uid_next: 1,
            special_use: special_use.to_owned(),
        }),
        Err(e) if is_unique_violation(&e) => {
            Err(StoreError::AlreadyExists(format!("mailbox '{name}'")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Look up a mailbox by name, creating it if absent
pub fn find_or_create_mailbox(
    conn: &Connection,
    owner_id: i64,
    name: &str,
    special_use: &str,
    clock: &dyn Clock,
) -> StoreResult<Mailbox> {
    if let Some(mailbox) = find_mailbox(conn, owner_id, name)? {
        return Ok(mailbox);
    }
    match create_mailbox(conn, owner_id, name, special_use, clock) {
        Ok(mailbox) => Ok(mailbox),
        Err(StoreError::AlreadyExists(_)) => get_mailbox(conn, owner_id, name),
        Err(e) => Err(e),
    }
}

/// Delete a mailbox and its message links
///
/// INBOX and the Sent/Drafts/Trash defaults refuse deletion; so does any
/// folder with descendants. Links are removed in the same transaction as
/// the folder row. Messages orphaned by this operation are left for an
/// out-of-core background sweep.
///
/// # Errors
///
/// - `Forbidden` for protected folders
/// - `HasChildren` when descendants exist
/// - `NotFound` if the folder is absent
pub fn delete_mailbox(conn: &mut Connection, owner_id: i64, name: &str) -> StoreResult<()> {
    if PROTECTED.iter().any(|p| p.eq_ignore_ascii_case(name)) {
        return Err(StoreError::Forbidden(format!("cannot delete '{name}'")));
    }
    let mailbox = get_mailbox(conn, owner_id, name)?;

    let children: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mailboxes
         WHERE owner_id = ?1 AND (parent_id = ?2 OR name LIKE ?3)",
        params![owner_id, mailbox.id, format!("{name}/%")],
        |row| row.get(0),
    )?;
    if children > 0 {
        return Err(StoreError::HasChildren(name.to_owned()));
    }

    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM message_mailbox WHERE mailbox_id = ?1",
        params![mailbox.id],
    )?;
    tx.execute("DELETE FROM mailboxes WHERE id = ?1", params![mailbox.id])?;
    tx.commit()?;
    debug!(owner_id, mailbox = name, "mailbox deleted");
    Ok(())
}

/// Rename a mailbox
///
/// Renaming INBOX follows RFC 3501 §6.3.5: the target is created, every
/// link moves over, and INBOX itself stays in place empty. A general
/// rename creates missing intermediate prefixes of the target and
/// rewrites descendant names in the same transaction.
///
/// # Errors
///
/// - `Forbidden` when `new` is INBOX
/// - `NotFound` / `AlreadyExists` for missing source or taken target
pub fn rename_mailbox(
    conn: &mut Connection,
    owner_id: i64,
    old: &str,
    new: &str,
    clock: &dyn Clock,
) -> StoreResult<()> {
    if new.eq_ignore_ascii_case("INBOX") {
        return Err(StoreError::Forbidden("cannot rename to INBOX".to_owned()));
    }
    if old.eq_ignore_ascii_case("INBOX") {
        return rename_inbox(conn, owner_id, new, clock);
    }

    let mailbox = get_mailbox(conn, owner_id, old)?;
    if find_mailbox(conn, owner_id, new)?.is_some() {
        return Err(StoreError::AlreadyExists(format!("mailbox '{new}'")));
    }

    let tx = conn.transaction()?;
    let parent_id = ensure_hierarchy(&tx, owner_id, new, clock)?;
    tx.execute(
        "UPDATE mailboxes SET name = ?1, parent_id = ?2 WHERE id = ?3",
        params![new, parent_id, mailbox.id],
    )?;

    let descendants: Vec<(i64, String)> = {
        let mut stmt = tx.prepare(
            "SELECT id, name FROM mailboxes WHERE owner_id = ?1 AND name LIKE ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, format!("{old}/%")], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };
    for (id, name) in descendants {
        let renamed = format!("{new}{}", &name[old.len()..]);
        tx.execute(
            "UPDATE mailboxes SET name = ?1 WHERE id = ?2",
            params![renamed, id],
        )?;
    }
    tx.commit()?;
    debug!(owner_id, from = old, to = new, "mailbox renamed");
    Ok(())
}

/// Semantic INBOX rename: move contents, leave the folder
fn rename_inbox(
    conn: &mut Connection,
    owner_id: i64,
    new: &str,
    clock: &dyn Clock,
) -> StoreResult<()> {
    let inbox = get_mailbox(conn, owner_id, "INBOX")?;
    if find_mailbox(conn, owner_id, new)?.is_some() {
        return Err(StoreError::AlreadyExists(format!("mailbox '{new}'")));
    }

    let tx = conn.transaction()?;
    let parent_id = ensure_hierarchy(&tx, owner_id, new, clock)?;
    tx.execute(
        "INSERT INTO mailboxes (owner_id, name, parent_id, uid_validity, uid_next, special_use)
         VALUES (?1, ?2, ?3, ?4, 1, '')",
        params![owner_id, new, parent_id, clock.now().timestamp()],
    )?;
    let new_id = tx.last_insert_rowid();
    tx.execute(
        "UPDATE message_mailbox SET mailbox_id = ?1 WHERE mailbox_id = ?2",
        params![new_id, inbox.id],
    )?;
    tx.execute(
        "UPDATE mailboxes SET uid_next = COALESCE(
             (SELECT MAX(uid) + 1 FROM message_mailbox WHERE mailbox_id = ?1), 1)
         WHERE id = ?1",
        params![new_id],
    )?;
    tx.commit()?;
    debug!(owner_id, to = new, "INBOX contents moved");
    Ok(())
}

/// Create every missing intermediate prefix of a `/`-separated name
///
/// Returns the id of the immediate parent, if the name nests at all.
fn ensure_hierarchy(
    conn: &Connection,
    owner_id: i64,
    name: &str,
    clock: &dyn Clock,
) -> StoreResult<Option<i64>> {
    let mut parent_id: Option<i64> = None;
    let mut prefix = String::new();
    let segments: Vec<&str> = name.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        let existing = find_mailbox(conn, owner_id, &prefix)?;
        let id = match existing {
            Some(mailbox) => mailbox.id,
            None => {
                conn.execute(
                    "INSERT INTO mailboxes
                         (owner_id, name, parent_id, uid_validity, uid_next, special_use)
                     VALUES (?1, ?2, ?3, ?4, 1, '')",
                    params![owner_id, prefix, parent_id, clock.now().timestamp()],
                )?;
                conn.last_insert_rowid()
            }
        };
        parent_id = Some(id);
    }
    Ok(parent_id)
}

/// Link a message into a mailbox with the next UID
///
/// The UID read and the `uid_next` increment run in one transaction on
/// the shard's single connection, so assignment is serialized per
/// mailbox and UIDs are strictly monotonic in commit order.
pub fn append_message(
    conn: &mut Connection,
    mailbox_id: i64,
    message_id: i64,
    flags: &str,
    internal_date: DateTime<Utc>,
    clock: &dyn Clock,
) -> StoreResult<i64> {
    let tx = conn.transaction()?;
    let uid: Option<i64> = tx
        .query_row(
            "SELECT uid_next FROM mailboxes WHERE id = ?1",
            params![mailbox_id],
            |row| row.get(0),
        )
        .optional()?;
    let uid = uid.ok_or_else(|| StoreError::not_found(format!("mailbox {mailbox_id}")))?;

    tx.execute(
        "INSERT INTO message_mailbox
             (message_id, mailbox_id, uid, flags, internal_date, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message_id,
            mailbox_id,
            uid,
            flags,
            internal_date.timestamp(),
            clock.now().timestamp(),
        ],
    )?;
    tx.execute(
        "UPDATE mailboxes SET uid_next = uid_next + 1 WHERE id = ?1",
        params![mailbox_id],
    )?;
    tx.commit()?;
    Ok(uid)
}

fn link_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxLink> {
    Ok(MailboxLink {
        message_id: row.get(0)?,
        mailbox_id: row.get(1)?,
        uid: row.get(2)?,
        flags: row.get(3)?,
        internal_date: from_epoch(row.get(4)?),
        added_at: from_epoch(row.get(5)?),
    })
}

const LINK_COLUMNS: &str = "message_id, mailbox_id, uid, flags, internal_date, added_at";

/// List a mailbox's links in UID order
pub fn list_links(conn: &Connection, mailbox_id: i64) -> StoreResult<Vec<MailboxLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINK_COLUMNS} FROM message_mailbox WHERE mailbox_id = ?1 ORDER BY uid"
    ))?;
    let rows = stmt.query_map(params![mailbox_id], link_from_row)?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Look up one link by UID
pub fn find_link(conn: &Connection, mailbox_id: i64, uid: i64) -> StoreResult<Option<MailboxLink>> {
    conn.query_row(
        &format!("SELECT {LINK_COLUMNS} FROM message_mailbox WHERE mailbox_id = ?1 AND uid = ?2"),
        params![mailbox_id, uid],
        link_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Replace the flag string on a link
pub fn set_flags(
    conn: &Connection,
    mailbox_id: i64,
    message_id: i64,
    flags: &str,
) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE message_mailbox SET flags = ?3 WHERE mailbox_id = ?1 AND message_id = ?2",
        params![mailbox_id, message_id, flags],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!(
            "message {message_id} in mailbox {mailbox_id}"
        )));
    }
    Ok(())
}

/// Total and unseen counts for a mailbox
pub fn counts(conn: &Connection, mailbox_id: i64) -> StoreResult<MailboxCounts> {
    conn.query_row(
        "SELECT COUNT(*),
                COUNT(CASE WHEN flags NOT LIKE '%\\Seen%' THEN 1 END)
         FROM message_mailbox WHERE mailbox_id = ?1",
        params![mailbox_id],
        |row| {
            Ok(MailboxCounts {
                total: row.get(0)?,
                unseen: row.get(1)?,
            })
        },
    )
    .map_err(Into::into)
}

/// Remove one link, destroying the message if it was the last
///
/// The expunge path: the message's blob references decrement and the
/// message row disappears once no mailbox in the shard links it.
pub fn remove_link(conn: &mut Connection, mailbox_id: i64, uid: i64) -> StoreResult<()> {
    let tx = conn.transaction()?;
    let message_id: Option<i64> = tx
        .query_row(
            "SELECT message_id FROM message_mailbox WHERE mailbox_id = ?1 AND uid = ?2",
            params![mailbox_id, uid],
            |row| row.get(0),
        )
        .optional()?;
    let message_id = message_id
        .ok_or_else(|| StoreError::not_found(format!("uid {uid} in mailbox {mailbox_id}")))?;

    tx.execute(
        "DELETE FROM message_mailbox WHERE mailbox_id = ?1 AND uid = ?2",
        params![mailbox_id, uid],
    )?;
    let remaining: i64 = tx.query_row(
        "SELECT COUNT(*) FROM message_mailbox WHERE message_id = ?1",
        params![message_id],
        |row| row.get(0),
    )?;
    if remaining == 0 {
        message::delete_message_rows(&tx, message_id)?;
    }
    tx.commit()?;
    Ok(())
}

/// Copy a link into another mailbox of the same owner
///
/// The destination gets a fresh UID; the source link, its UID, and its
/// flags are untouched.
pub fn copy_link(
    conn: &mut Connection,
    src_mailbox_id: i64,
    uid: i64,
    dst_mailbox_id: i64,
    clock: &dyn Clock,
) -> StoreResult<i64> {
    let link = find_link(conn, src_mailbox_id, uid)?
        .ok_or_else(|| StoreError::not_found(format!("uid {uid} in mailbox {src_mailbox_id}")))?;
    append_message(
        conn,
        dst_mailbox_id,
        link.message_id,
        &link.flags,
        link.internal_date,
        clock,
    )
}

/// Move a link into another mailbox of the same owner
///
/// Copy plus source-link removal; the message row survives because the
/// destination link exists before the source one is dropped.
pub fn move_link(
    conn: &mut Connection,
    src_mailbox_id: i64,
    uid: i64,
    dst_mailbox_id: i64,
    clock: &dyn Clock,
) -> StoreResult<i64> {
    let new_uid = copy_link(conn, src_mailbox_id, uid, dst_mailbox_id, clock)?;
    conn.execute(
        "DELETE FROM message_mailbox WHERE mailbox_id = ?1 AND uid = ?2",
        params![src_mailbox_id, uid],
    )?;
    Ok(new_uid)
}

/// Subscribe a user to a mailbox name
///
/// Keyed by name, not id: subscriptions intentionally survive mailbox
/// deletion (RFC 3501).
pub fn subscribe(conn: &Connection, user_id: i64, mailbox_name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO subscriptions (user_id, mailbox_name) VALUES (?1, ?2)
         ON CONFLICT (user_id, mailbox_name) DO NOTHING",
        params![user_id, mailbox_name],
    )?;
    Ok(())
}

/// Drop a subscription
pub fn unsubscribe(conn: &Connection, user_id: i64, mailbox_name: &str) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM subscriptions WHERE user_id = ?1 AND mailbox_name = ?2",
        params![user_id, mailbox_name],
    )?;
    Ok(())
}

/// List a user's subscriptions sorted by name
pub fn list_subscriptions(conn: &Connection, user_id: i64) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT mailbox_name FROM subscriptions WHERE user_id = ?1 ORDER BY mailbox_name",
    )?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}
