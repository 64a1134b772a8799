//! Store error model
//!
//! Defines the typed error hierarchy using `thiserror`. Every fallible
//! operation in the crate returns [`StoreResult`], and front-ends map the
//! variants onto their own wire responses (tagged `NO`/`BAD` at the IMAP
//! boundary, LMTP status codes on delivery).

use thiserror::Error;

/// Store error type
///
/// Covers all error cases the mail store core may surface. Delivery-audit
/// failures and blob decode failures are swallowed internally and never
/// reach this type (see the delivery and blob modules).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed recipient or email address (no `@`, empty parts)
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Domain, user, mailbox, message, or blob absent
    #[error("not found: {0}")]
    NotFound(String),
    /// Unique-constraint violation the caller can act on
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Parse of the outer RFC 5322 envelope failed
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// Protected-mailbox deletion or a rename target that is reserved
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Delete of a mailbox that still has descendants
    #[error("mailbox has children: {0}")]
    HasChildren(String),
    /// Remote blob backend or database file is unreachable
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Unique-key race that survived a single retry
    #[error("conflict: {0}")]
    Conflict(String),
    /// Everything else; always carries the underlying cause
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Convenience constructor for `NotFound`
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Convenience constructor for `Internal`
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    /// Map driver errors onto the store taxonomy
    ///
    /// Unique-constraint races are handled explicitly at the call sites
    /// that retry them; everything else is an internal failure carrying
    /// the driver message.
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row".to_owned()),
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

/// Check whether a driver error is a unique-constraint violation
///
/// Used by the catalog get-or-create paths to distinguish the insert race
/// from other failures before retrying the lookup.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type StoreResult<T> = Result<T, StoreError>;
