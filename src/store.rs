//! Store facade
//!
//! `MailStore` ties the shard manager, catalog, codec, mailbox engine,
//! and delivery pipeline together behind the operations the IMAP and
//! LMTP front-ends consume. Every method is blocking-synchronous; the
//! session layer wraps calls in its own tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::blobs::BlobBackend;
use crate::clock::{SharedClock, SystemClock};
use crate::config::StoreConfig;
use crate::delivery;
use crate::errors::{StoreError, StoreResult};
use crate::mailbox;
use crate::message;
use crate::models::{
    DeliveryOutcome, Mailbox, MailboxCounts, MailboxLink, MessageMeta, OutboundEntry, Owner,
};
use crate::outbound;
use crate::reconstruct;
use crate::shards::ShardManager;

/// The mail store core
///
/// One instance per base directory. Cheap to share behind an `Arc`;
/// internal handles do their own locking.
pub struct MailStore {
    config: StoreConfig,
    shards: ShardManager,
    clock: SharedClock,
    backend: Option<Arc<dyn BlobBackend>>,
}

impl MailStore {
    /// Open a store with the system clock and no remote blob backend
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::open_with(config, Arc::new(SystemClock::new()), None)
    }

    /// Open a store with an injected clock and optional blob backend
    pub fn open_with(
        config: StoreConfig,
        clock: SharedClock,
        backend: Option<Arc<dyn BlobBackend>>,
    ) -> StoreResult<Self> {
        let shards = ShardManager::open(&config.base_dir, clock.clone())?;
        Ok(Self {
            config,
            shards,
            clock,
            backend,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shard manager, for callers that need raw handle access
    pub fn shards(&self) -> &ShardManager {
        &self.shards
    }

    /// Close every cached database handle; idempotent
    pub fn close(&self) -> StoreResult<()> {
        self.shards.close()
    }

    fn backend_ref(&self) -> Option<&dyn BlobBackend> {
        self.backend.as_deref()
    }

    // --- delivery ---

    /// Deliver a raw message to a recipient's default folder
    pub fn deliver(&self, recipient: &str, raw: &[u8]) -> StoreResult<DeliveryOutcome> {
        delivery::deliver(
            &self.shards,
            &self.config,
            self.clock.as_ref(),
            self.backend_ref(),
            recipient,
            raw,
            None,
        )
    }

    /// Deliver a raw message to a named folder (spam routing still wins)
    pub fn deliver_to_folder(
        &self,
        recipient: &str,
        raw: &[u8],
        folder: &str,
    ) -> StoreResult<DeliveryOutcome> {
        delivery::deliver(
            &self.shards,
            &self.config,
            self.clock.as_ref(),
            self.backend_ref(),
            recipient,
            raw,
            Some(folder),
        )
    }

    /// Deliver to many recipients, reporting one result per address
    pub fn deliver_many(
        &self,
        recipients: &[String],
        raw: &[u8],
    ) -> BTreeMap<String, StoreResult<DeliveryOutcome>> {
        delivery::deliver_many(
            &self.shards,
            &self.config,
            self.clock.as_ref(),
            self.backend_ref(),
            recipients,
            raw,
        )
    }

    // --- fetch ---

    /// Reconstruct a stored message as wire-format bytes
    ///
    /// A conforming IMAP `FETCH BODY[]` returns this stream unchanged.
    pub fn fetch_message(&self, owner: Owner, message_id: i64) -> StoreResult<Vec<u8>> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        reconstruct::reconstruct_message(&conn, message_id, self.clock.as_ref(), self.backend_ref())
    }

    /// Load a message's row metadata
    pub fn message_meta(&self, owner: Owner, message_id: i64) -> StoreResult<MessageMeta> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        message::get_message(&conn, message_id)
    }

    // --- mailboxes ---

    /// Create a folder for an owner
    pub fn create_mailbox(
        &self,
        owner: Owner,
        name: &str,
        special_use: &str,
    ) -> StoreResult<Mailbox> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        mailbox::create_mailbox(&conn, owner.owner_id(), name, special_use, self.clock.as_ref())
    }

    /// Delete a folder and its links
    pub fn delete_mailbox(&self, owner: Owner, name: &str) -> StoreResult<()> {
        let shard = self.shards.shard(owner)?;
        let mut conn = shard.lock()?;
        mailbox::delete_mailbox(&mut conn, owner.owner_id(), name)
    }

    /// Rename a folder (INBOX renames semantically per RFC 3501)
    pub fn rename_mailbox(&self, owner: Owner, old: &str, new: &str) -> StoreResult<()> {
        let shard = self.shards.shard(owner)?;
        let mut conn = shard.lock()?;
        mailbox::rename_mailbox(&mut conn, owner.owner_id(), old, new, self.clock.as_ref())
    }

    /// List an owner's folders
    pub fn list_mailboxes(&self, owner: Owner) -> StoreResult<Vec<Mailbox>> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        mailbox::list_mailboxes(&conn, owner.owner_id())
    }

    /// Look up one folder by name
    pub fn get_mailbox(&self, owner: Owner, name: &str) -> StoreResult<Mailbox> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        mailbox::get_mailbox(&conn, owner.owner_id(), name)
    }

    /// Message totals for a folder
    pub fn mailbox_counts(&self, owner: Owner, name: &str) -> StoreResult<MailboxCounts> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        let mailbox = mailbox::get_mailbox(&conn, owner.owner_id(), name)?;
        mailbox::counts(&conn, mailbox.id)
    }

    /// A folder's links in UID order
    pub fn list_messages(&self, owner: Owner, name: &str) -> StoreResult<Vec<MailboxLink>> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        let mailbox = mailbox::get_mailbox(&conn, owner.owner_id(), name)?;
        mailbox::list_links(&conn, mailbox.id)
    }

    /// Replace the flags of the link at `uid`
    pub fn set_flags(&self, owner: Owner, name: &str, uid: i64, flags: &str) -> StoreResult<()> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        let mailbox_row = mailbox::get_mailbox(&conn, owner.owner_id(), name)?;
        let link = mailbox::find_link(&conn, mailbox_row.id, uid)?
            .ok_or_else(|| StoreError::not_found(format!("uid {uid} in '{name}'")))?;
        mailbox::set_flags(&conn, mailbox_row.id, link.message_id, flags)
    }

    /// Remove the link at `uid`, destroying the message if it was last
    pub fn expunge(&self, owner: Owner, name: &str, uid: i64) -> StoreResult<()> {
        let shard = self.shards.shard(owner)?;
        let mut conn = shard.lock()?;
        let mailbox_row = mailbox::get_mailbox(&conn, owner.owner_id(), name)?;
        mailbox::remove_link(&mut conn, mailbox_row.id, uid)
    }

    /// Copy the link at `uid` into another folder of the same owner
    pub fn copy_message(
        &self,
        owner: Owner,
        src: &str,
        uid: i64,
        dst: &str,
    ) -> StoreResult<i64> {
        let shard = self.shards.shard(owner)?;
        let mut conn = shard.lock()?;
        let src_row = mailbox::get_mailbox(&conn, owner.owner_id(), src)?;
        let dst_row = mailbox::get_mailbox(&conn, owner.owner_id(), dst)?;
        mailbox::copy_link(&mut conn, src_row.id, uid, dst_row.id, self.clock.as_ref())
    }

    /// Move the link at `uid` into another folder of the same owner
    pub fn move_message(
        &self,
        owner: Owner,
        src: &str,
        uid: i64,
        dst: &str,
    ) -> StoreResult<i64> {
        let shard = self.shards.shard(owner)?;
        let mut conn = shard.lock()?;
        let src_row = mailbox::get_mailbox(&conn, owner.owner_id(), src)?;
        let dst_row = mailbox::get_mailbox(&conn, owner.owner_id(), dst)?;
        mailbox::move_link(&mut conn, src_row.id, uid, dst_row.id, self.clock.as_ref())
    }

    // --- subscriptions ---

    /// Subscribe a user to a folder name
    pub fn subscribe(&self, user_id: i64, mailbox_name: &str) -> StoreResult<()> {
        let shard = self.shards.user_shard(user_id)?;
        let conn = shard.lock()?;
        mailbox::subscribe(&conn, user_id, mailbox_name)
    }

    /// Drop a user's subscription
    pub fn unsubscribe(&self, user_id: i64, mailbox_name: &str) -> StoreResult<()> {
        let shard = self.shards.user_shard(user_id)?;
        let conn = shard.lock()?;
        mailbox::unsubscribe(&conn, user_id, mailbox_name)
    }

    /// A user's subscribed folder names
    pub fn subscriptions(&self, user_id: i64) -> StoreResult<Vec<String>> {
        let shard = self.shards.user_shard(user_id)?;
        let conn = shard.lock()?;
        mailbox::list_subscriptions(&conn, user_id)
    }

    // --- outbound queue ---

    /// Queue a stored message for relay
    pub fn queue_outbound(
        &self,
        owner: Owner,
        message_id: i64,
        sender: &str,
        recipient: &str,
    ) -> StoreResult<i64> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        outbound::enqueue(
            &conn,
            message_id,
            sender,
            recipient,
            self.config.outbound_max_retries,
            self.clock.now(),
        )
    }

    /// Queue entries eligible for dispatch now
    pub fn outbound_due(&self, owner: Owner, limit: usize) -> StoreResult<Vec<OutboundEntry>> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        outbound::due(&conn, self.clock.now(), limit)
    }

    /// Record a successful relay
    pub fn outbound_sent(&self, owner: Owner, entry_id: i64) -> StoreResult<()> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        outbound::mark_sent(&conn, entry_id, self.clock.now())
    }

    /// Record a failed relay attempt and its retry schedule
    pub fn outbound_failed(
        &self,
        owner: Owner,
        entry_id: i64,
        error: &str,
        next_retry_at: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<()> {
        let shard = self.shards.shard(owner)?;
        let conn = shard.lock()?;
        outbound::mark_failed(&conn, entry_id, error, next_retry_at)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::config::StoreConfig;

    use super::MailStore;

    fn store(dir: &std::path::Path) -> MailStore {
        MailStore::open(StoreConfig::new(dir)).expect("open store")
    }

    fn inline_image_message(to: &str) -> Vec<u8> {
        format!(
            concat!(
                "From: sender@origin.net\r\n",
                "To: {to}\r\n",
                "Subject: logo inside\r\n",
                "MIME-Version: 1.0\r\n",
                "Content-Type: multipart/alternative; boundary=\"alt\"\r\n",
                "\r\n",
                "--alt\r\n",
                "Content-Type: text/plain; charset=utf-8\r\n",
                "\r\n",
                "see the logo\r\n",
                "--alt\r\n",
                "Content-Type: multipart/related; boundary=\"rel\"\r\n",
                "\r\n",
                "--rel\r\n",
                "Content-Type: text/html; charset=utf-8\r\n",
                "\r\n",
                "<p><img src=\"cid:logo@x\"></p>\r\n",
                "--rel\r\n",
                "Content-Type: image/png\r\n",
                "Content-ID: <logo@x>\r\n",
                "Content-Transfer-Encoding: base64\r\n",
                "\r\n",
                "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==\r\n",
                "--rel--\r\n",
                "--alt--\r\n",
            ),
            to = to
        )
        .into_bytes()
    }

    #[test]
    fn delivered_messages_reconstruct_with_related_ordering() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let outcome = store
            .deliver("alice@example.com", &inline_image_message("alice@example.com"))
            .expect("deliver");
        let rebuilt = store
            .fetch_message(outcome.owner, outcome.message_id)
            .expect("fetch");
        let text = String::from_utf8(rebuilt).expect("utf8");

        let related = text.find("multipart/related").expect("related block");
        let html = text[related..].find("text/html").expect("html") + related;
        let image = text[related..].find("image/png").expect("image") + related;
        assert!(html < image);
        assert!(text.contains("src=\"cid:logo@x\""));
        assert!(text.contains("Content-ID: <logo@x>"));
    }

    #[test]
    fn parallel_appends_assign_every_uid_exactly_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store(tmp.path()));

        // Prime the user shard so all threads target the same owner.
        store
            .deliver("bob@example.com", b"Subject: prime\r\n\r\nfirst")
            .expect("prime");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let raw = format!("Subject: concurrent {i}\r\n\r\nline {i}");
                    store
                        .deliver("bob@example.com", raw.as_bytes())
                        .expect("deliver")
                })
            })
            .collect();
        let mut owner = None;
        for handle in handles {
            let outcome = handle.join().expect("thread");
            owner = Some(outcome.owner);
        }

        let links = store
            .list_messages(owner.expect("owner"), "INBOX")
            .expect("links");
        let uids: Vec<i64> = links.iter().map(|l| l.uid).collect();
        assert_eq!(uids, (1..=17).collect::<Vec<i64>>());
    }

    #[test]
    fn facade_flag_and_expunge_operate_by_uid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let outcome = store
            .deliver("carol@example.com", b"Subject: flagged\r\n\r\nbody")
            .expect("deliver");
        let owner = outcome.owner;

        store
            .set_flags(owner, "INBOX", outcome.uid, "\\Seen")
            .expect("flag");
        let counts = store.mailbox_counts(owner, "INBOX").expect("counts");
        assert_eq!(counts.total, 1);
        assert_eq!(counts.unseen, 0);

        store.expunge(owner, "INBOX", outcome.uid).expect("expunge");
        assert!(store.message_meta(owner, outcome.message_id).is_err());
    }

    #[test]
    fn copy_keeps_source_move_does_not() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let outcome = store
            .deliver("dave@example.com", b"Subject: travels\r\n\r\nbody")
            .expect("deliver");
        let owner = outcome.owner;
        store.create_mailbox(owner, "Archive", "").expect("create");

        let copied_uid = store
            .copy_message(owner, "INBOX", outcome.uid, "Archive")
            .expect("copy");
        assert_eq!(store.mailbox_counts(owner, "INBOX").expect("counts").total, 1);
        assert_eq!(
            store.mailbox_counts(owner, "Archive").expect("counts").total,
            1
        );

        store
            .move_message(owner, "Archive", copied_uid, "Trash")
            .expect("move");
        assert_eq!(
            store.mailbox_counts(owner, "Archive").expect("counts").total,
            0
        );
        assert_eq!(store.mailbox_counts(owner, "Trash").expect("counts").total, 1);
    }

    #[test]
    fn outbound_queue_round_trips_through_the_facade() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let outcome = store
            .deliver_to_folder("erin@example.com", b"Subject: out\r\n\r\nbody", "Drafts")
            .expect("deliver");
        let owner = outcome.owner;

        let entry = store
            .queue_outbound(owner, outcome.message_id, "erin@example.com", "x@example.org")
            .expect("queue");
        let due = store.outbound_due(owner, 10).expect("due");
        assert_eq!(due.len(), 1);
        store.outbound_sent(owner, entry).expect("sent");
        assert!(store.outbound_due(owner, 10).expect("due").is_empty());
    }

    #[test]
    fn close_makes_the_store_unusable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());
        store.close().expect("close");
        assert!(store.deliver("x@example.com", b"Subject: late\r\n\r\nbody").is_err());
    }
}
