//! mail-store-rs: mail store core for a personal IMAP server
//!
//! Ingests RFC 5322 / MIME messages, decomposes them into a normalized
//! relational representation with content-addressed deduplication of
//! large parts, indexes them into per-user SQLite shards, and losslessly
//! reconstructs wire-format messages on demand. The IMAP session layer,
//! the LMTP front-end, and any external object store consume this crate
//! through the [`MailStore`] facade and the per-module operations.
//!
//! # Architecture
//!
//! - [`shards`]: one shared catalog plus per-owner shard files, cached handles
//! - [`catalog`]: domains, users, role mailboxes, role assignments
//! - [`blobs`]: content-addressed, reference-counted part bodies
//! - [`mime`]: lenient RFC 5322 / MIME parsing into the stored shape
//! - [`message`]: header/address/part row persistence
//! - [`reconstruct`]: deterministic wire-format rebuild for FETCH
//! - [`mailbox`]: folders, UID assignment, flags, subscriptions
//! - [`outbound`]: relay queue state
//! - [`delivery`]: recipient resolution, spam routing, audit
//! - [`store`]: the facade front-ends talk to
//! - [`config`], [`clock`], [`errors`], [`models`]: ambient pieces

pub mod blobs;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod mailbox;
pub mod message;
pub mod mime;
pub mod models;
pub mod outbound;
pub mod reconstruct;
mod schema;
pub mod shards;
pub mod store;

pub use blobs::BlobBackend;
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use config::StoreConfig;
pub use errors::{StoreError, StoreResult};
pub use models::{DeliveryOutcome, Owner};
pub use store::MailStore;
