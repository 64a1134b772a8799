//! Inbound delivery pipeline
//!
//! Resolves a recipient address to its shard (role mailbox first, then
//! user with automatic provisioning), routes spam-flagged messages to the
//! spam folder, stores the parsed message, links it with a fresh UID, and
//! records a best-effort audit row. Delivery is not idempotent at the
//! message level; upstream retry must guarantee exactly-once. Blobs still
//! deduplicate across repeated deliveries.

use std::collections::BTreeMap;

use rusqlite::params;
use tracing::{info, warn};

use crate::blobs::BlobBackend;
use crate::catalog;
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::errors::{StoreError, StoreResult};
use crate::mailbox;
use crate::message;
use crate::mime::{self, ParsedMessage};
use crate::models::{DeliveryOutcome, HeaderField, Owner};
use crate::shards::ShardManager;

/// Spam verdict values of `X-Rspamd-Action` that divert a delivery
const RSPAMD_SPAM_ACTIONS: [&str; 3] = ["reject", "add header", "rewrite subject"];

/// Split an address into local part and domain
///
/// # Errors
///
/// Returns `InvalidAddress` when there is no `@` or either side is
/// empty.
pub fn split_address(address: &str) -> StoreResult<(String, String)> {
    let trimmed = address.trim();
    let Some((local, domain)) = trimmed.split_once('@') else {
        return Err(StoreError::InvalidAddress(format!("'{address}' has no '@'")));
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(StoreError::InvalidAddress(format!(
            "'{address}' has empty or malformed parts"
        )));
    }
    Ok((local.to_ascii_lowercase(), domain.to_ascii_lowercase()))
}

/// Check the spam verdict headers stamped by the upstream filter
///
/// `X-Rspamd-Action` with a diverting action, or `X-Spam-Status`
/// starting with `yes`, routes the message to the spam folder. Value
/// comparison is case-insensitive.
pub fn is_spam(headers: &[HeaderField]) -> bool {
    for header in headers {
        if header.name.eq_ignore_ascii_case("X-Rspamd-Action") {
            let action = header.value.trim().to_ascii_lowercase();
            if RSPAMD_SPAM_ACTIONS.contains(&action.as_str()) {
                return true;
            }
        }
        if header.name.eq_ignore_ascii_case("X-Spam-Status")
            && header.value.trim().to_ascii_lowercase().starts_with("yes")
        {
            return true;
        }
    }
    false
}

/// Deliver one raw message to one recipient
///
/// `folder` overrides the configured default target; spam routing wins
/// over both and creates the spam folder on demand.
///
/// # Errors
///
/// - `InvalidAddress` for a malformed recipient
/// - `MalformedMessage` when the outer envelope does not parse
/// - storage errors from the target shard
pub fn deliver(
    shards: &ShardManager,
    config: &StoreConfig,
    clock: &dyn Clock,
    backend: Option<&dyn BlobBackend>,
    recipient: &str,
    raw: &[u8],
    folder: Option<&str>,
) -> StoreResult<DeliveryOutcome> {
    let (local, domain) = split_address(recipient)?;
    let normalized = format!("{local}@{domain}");

    let (owner, audit_user) = {
        let catalog = shards.catalog()?;
        let conn = catalog.lock()?;
        let domain_id = catalog::get_or_create_domain(&conn, &domain)?;
        match catalog::find_role_mailbox(&conn, &normalized)? {
            Some(role) => (Owner::Role(role.id), None),
            None => {
                let user = catalog::get_or_create_user(&conn, &local, domain_id)?;
                (Owner::User(user.id), Some(user.id))
            }
        }
    };

    let parsed = mime::parse_message(raw, clock.now())?;
    let spam = is_spam(&parsed.headers);

    let shard = shards.shard(owner)?;
    let mut conn = shard.lock()?;

    let folder_name = if spam {
        config.spam_folder.as_str()
    } else {
        folder.unwrap_or(config.default_folder.as_str())
    };
    let special_use = if spam { "\\Junk" } else { "" };
    let target = mailbox::find_or_create_mailbox(
        &conn,
        owner.owner_id(),
        folder_name,
        special_use,
        clock,
    )?;

    let message_id = message::store_message(
        &mut conn,
        &parsed,
        clock.now(),
        config.inline_blob_limit,
        backend,
    )?;
    let uid = mailbox::append_message(&mut conn, target.id, message_id, "", parsed.date, clock)?;

    record_audit(&conn, message_id, &normalized, &parsed, audit_user, &target.name, clock);
    info!(
        recipient = %normalized,
        mailbox = %target.name,
        uid,
        spam,
        "message delivered"
    );

    Ok(DeliveryOutcome {
        owner,
        message_id,
        mailbox_id: target.id,
        mailbox_name: target.name,
        uid,
    })
}

/// Deliver one raw message to many recipients independently
///
/// Partial failure is the norm; each address gets its own result.
pub fn deliver_many(
    shards: &ShardManager,
    config: &StoreConfig,
    clock: &dyn Clock,
    backend: Option<&dyn BlobBackend>,
    recipients: &[String],
    raw: &[u8],
) -> BTreeMap<String, StoreResult<DeliveryOutcome>> {
    let mut results = BTreeMap::new();
    for recipient in recipients {
        let outcome = deliver(shards, config, clock, backend, recipient, raw, None);
        results.insert(recipient.clone(), outcome);
    }
    results
}

/// Write the delivery audit row, best-effort
///
/// Audit failure never fails the delivery; it is logged and swallowed.
fn record_audit(
    conn: &rusqlite::Connection,
    message_id: i64,
    recipient: &str,
    parsed: &ParsedMessage,
    user_id: Option<i64>,
    folder: &str,
    clock: &dyn Clock,
) {
    let sender = parsed
        .from
        .first()
        .map(|a| a.email.clone())
        .unwrap_or_default();
    let result = conn.execute(
        "INSERT INTO delivery_audit
             (message_id, recipient, sender, status, user_id, delivered_at, response)
         VALUES (?1, ?2, ?3, 'delivered', ?4, ?5, ?6)",
        params![
            message_id,
            recipient,
            sender,
            user_id,
            clock.now().timestamp(),
            format!("250 2.0.0 delivered to {folder}"),
        ],
    );
    if let Err(e) = result {
        warn!(message_id, error = %e, "delivery audit write failed");
    }
}
