//! Persistence seam for session keys, sub-accounts and audit entries.
//!
//! Stores are plain row storage. Invariants (spend caps, status
//! transitions) are enforced by the single writers in `session` and
//! `budget`; nothing else is expected to call the save methods.

mod json_file;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::AuditLogEntry;
use crate::budget::SubAccount;
use crate::session::SessionKey;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_session_key(&self, id: &str) -> StoreResult<Option<SessionKey>>;

    async fn save_session_key(&self, key: &SessionKey) -> StoreResult<()>;

    /// All session keys, or only those belonging to `wallet_id`.
    async fn list_session_keys(&self, wallet_id: Option<&str>) -> StoreResult<Vec<SessionKey>>;

    async fn load_sub_account(&self, id: &str) -> StoreResult<Option<SubAccount>>;

    async fn save_sub_account(&self, account: &SubAccount) -> StoreResult<()>;

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()>;

    /// Audit entries written at or after `since`, oldest first.
    async fn load_audit(&self, since: DateTime<Utc>) -> StoreResult<Vec<AuditLogEntry>>;

    /// Drops audit entries older than `before`; returns how many were removed.
    async fn prune_audit(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}
