//! Store configuration
//!
//! Configuration is loaded from environment variables following the pattern
//! `MAIL_STORE_<KEY>`, or built directly by embedders. Only the base
//! directory is required; every tuning knob has a default.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use crate::errors::{StoreError, StoreResult};

/// Store-wide configuration
///
/// Shared immutably by every component. Front-ends construct one per
/// store instance; the listener/session settings of the IMAP and LMTP
/// layers live outside this crate.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory holding `shared.db` and the per-owner shard files
    pub base_dir: PathBuf,
    /// Part bodies at or under this size (and without a filename) are
    /// stored inline on the part row instead of in the blob table
    pub inline_blob_limit: usize,
    /// Folder that receives ordinary deliveries when the caller does not
    /// name one
    pub default_folder: String,
    /// Folder that receives spam-routed deliveries (created on demand)
    pub spam_folder: String,
    /// Default `max_retries` for new outbound queue entries
    pub outbound_max_retries: u32,
}

impl StoreConfig {
    /// Build a configuration with defaults for everything but the base dir
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            inline_blob_limit: 1024,
            default_folder: "INBOX".to_owned(),
            spam_folder: "Spam".to_owned(),
            outbound_max_retries: 5,
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `MAIL_STORE_BASE_DIR` is missing or another
    /// variable is set to an unparseable value.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_STORE_BASE_DIR=/var/lib/mailstore
    /// MAIL_STORE_INLINE_BLOB_LIMIT=1024
    /// MAIL_STORE_SPAM_FOLDER=Spam
    /// MAIL_STORE_OUTBOUND_MAX_RETRIES=5
    /// ```
    pub fn load_from_env() -> StoreResult<Self> {
        let base_dir = required_env("MAIL_STORE_BASE_DIR")?;
        let mut config = Self::new(base_dir);
        config.inline_blob_limit =
            parse_usize_env("MAIL_STORE_INLINE_BLOB_LIMIT", config.inline_blob_limit)?;
        config.outbound_max_retries = u32::try_from(parse_usize_env(
            "MAIL_STORE_OUTBOUND_MAX_RETRIES",
            config.outbound_max_retries as usize,
        )?)
        .map_err(|_| StoreError::internal("MAIL_STORE_OUTBOUND_MAX_RETRIES out of range"))?;
        if let Some(folder) = optional_env("MAIL_STORE_DEFAULT_FOLDER")? {
            config.default_folder = folder;
        }
        if let Some(folder) = optional_env("MAIL_STORE_SPAM_FOLDER")? {
            config.spam_folder = folder;
        }
        Ok(config)
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> StoreResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(StoreError::internal(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable
///
/// Unset and empty values both read as absent.
fn optional_env(key: &str) -> StoreResult<Option<String>> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
        Ok(_) | Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(StoreError::internal(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `Internal` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> StoreResult<usize> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map_err(|_| {
            StoreError::internal(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::internal(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}
