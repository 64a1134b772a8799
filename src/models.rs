//! Entity and row types shared across the store
//!
//! Defines the catalog entities, the per-shard rows, and the small value
//! enums they carry. Types are `serde`-annotated so front-ends can expose
//! them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner of a shard: a user or a role mailbox
///
/// Role shards store their rows with `owner_id = 0`; user shards with the
/// user's catalog id. The variant also selects the shard file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Owner {
    /// A user's private shard, by catalog user id
    User(i64),
    /// A role mailbox's shared shard, by catalog role-mailbox id
    Role(i64),
}

impl Owner {
    /// The `owner_id` value stored on rows inside the shard
    pub fn owner_id(&self) -> i64 {
        match self {
            Self::User(id) => *id,
            Self::Role(_) => 0,
        }
    }
}

/// Mail domain registered in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    /// Domain name, unique in the catalog
    pub name: String,
    pub enabled: bool,
}

/// User account registered in the catalog
///
/// Identity is the pair `(username, domain_id)`. Each user owns exactly
/// one shard file derived from `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub domain_id: i64,
    pub enabled: bool,
    /// Whether the account has completed password setup; automated
    /// delivery provisioning sets this, admin provisioning does not
    pub password_initialized: bool,
}

/// Shared address (support@, sales@) backed by its own shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMailbox {
    pub id: i64,
    /// Full address, unique in the catalog
    pub email: String,
    pub domain_id: i64,
    pub description: String,
    pub enabled: bool,
}

/// Assignment of a user to a role mailbox
///
/// At most one row per role mailbox is active at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: i64,
    pub role_mailbox_id: i64,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Mailbox (folder) row in an owner's shard
///
/// `name` may contain `/` to denote hierarchy. `uid_validity` is fixed at
/// creation; `uid_next` only ever increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub uid_validity: i64,
    pub uid_next: i64,
    /// IMAP special-use attribute (`\Inbox`, `\Sent`, ...) or empty
    pub special_use: String,
}

/// Where a blob's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStorage {
    /// Bytes are in the `inline_bytes` column
    Local,
    /// Bytes are held by the external backend under `external_id`
    Remote,
}

impl BlobStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Remote => "REMOTE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LOCAL" => Some(Self::Local),
            "REMOTE" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Blob row metadata (bytes fetched separately)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: i64,
    /// Hex SHA-256 of the decoded bytes
    pub sha256: String,
    /// Size of the original encoded bytes as received
    pub size: i64,
    pub storage: BlobStorage,
    pub external_id: Option<String>,
    pub refcount: i64,
}

/// Message row in an owner's shard
///
/// Exists independently of any mailbox; destroyed when the last
/// message-mailbox link is removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: i64,
    pub subject: String,
    pub in_reply_to: String,
    /// Raw `References` header value
    pub references: String,
    pub date: DateTime<Utc>,
    /// Length of the raw message as delivered
    pub size: i64,
    pub received_at: DateTime<Utc>,
    pub thread_id: Option<i64>,
}

/// One stored header line, in original order
///
/// `value` preserves folded continuations verbatim (internal `\r\n ` or
/// `\r\n\t` sequences).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Which address list a row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressKind {
    From,
    To,
    Cc,
    Bcc,
}

impl AddressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "from" => Some(Self::From),
            "to" => Some(Self::To),
            "cc" => Some(Self::Cc),
            "bcc" => Some(Self::Bcc),
            _ => None,
        }
    }
}

/// One parsed mailbox address (display name plus addr-spec)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressField {
    pub name: String,
    pub email: String,
}

/// Body variant of a stored MIME part
///
/// Exactly one shape per part: multipart containers carry no body, small
/// text parts are stored inline, everything else points at a blob row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredBody {
    /// `multipart/*` container; children reference it by `parent_part_id`
    Container,
    /// Original encoded body text kept on the part row
    Inline(String),
    /// Reference into the blob table
    Blob(i64),
}

/// MIME part row in an owner's shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRow {
    pub id: i64,
    pub message_id: i64,
    /// 1-based position at the part's recursion level
    pub part_number: i64,
    pub parent_part_id: Option<i64>,
    pub content_type: String,
    /// Raw `Content-Disposition` value as parsed, or empty
    pub content_disposition: String,
    pub transfer_encoding: String,
    pub charset: String,
    pub filename: Option<String>,
    /// `Content-ID` verbatim including angle brackets, or empty
    pub content_id: String,
    pub body: StoredBody,
    /// Size of the encoded body bytes (0 for containers)
    pub size: i64,
}

impl PartRow {
    /// Whether this part is a `multipart/*` container
    pub fn is_container(&self) -> bool {
        self.content_type.starts_with("multipart/")
    }
}

/// Message-to-mailbox link bearing UID and flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxLink {
    pub message_id: i64,
    pub mailbox_id: i64,
    pub uid: i64,
    /// Space-joined IMAP flags, compared case-sensitively as stored
    pub flags: String,
    pub internal_date: DateTime<Utc>,
    pub added_at: DateTime<Utc>,
}

/// Message totals for a mailbox
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MailboxCounts {
    pub total: i64,
    /// Links whose flags do not contain `\Seen`
    pub unseen: i64,
}

/// Append-only delivery audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub message_id: i64,
    pub recipient: String,
    pub sender: String,
    pub status: String,
    pub user_id: Option<i64>,
    pub delivered_at: DateTime<Utc>,
    pub response: String,
}

/// Outbound queue entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outbound (relay) queue row
///
/// Eligible for dispatch when `status` is `PENDING` and `next_retry_at`
/// has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEntry {
    pub id: i64,
    pub message_id: i64,
    pub sender: String,
    pub recipient: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: DateTime<Utc>,
    pub status: OutboundStatus,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Result of a successful delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Shard that received the message
    pub owner: Owner,
    pub message_id: i64,
    pub mailbox_id: i64,
    /// Folder the link landed in (`INBOX`, `Spam`, or caller-supplied)
    pub mailbox_name: String,
    pub uid: i64,
}
