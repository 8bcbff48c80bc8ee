use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{StateStore, StoreResult};
use crate::audit::AuditLogEntry;
use crate::budget::SubAccount;
use crate::session::SessionKey;

/// Ephemeral store; state is lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    session_keys: RwLock<HashMap<String, SessionKey>>,
    sub_accounts: RwLock<HashMap<String, SubAccount>>,
    audit: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_len(&self) -> usize {
        self.audit.lock().len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_session_key(&self, id: &str) -> StoreResult<Option<SessionKey>> {
        Ok(self.session_keys.read().get(id).cloned())
    }

    async fn save_session_key(&self, key: &SessionKey) -> StoreResult<()> {
        self.session_keys
            .write()
            .insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn list_session_keys(&self, wallet_id: Option<&str>) -> StoreResult<Vec<SessionKey>> {
        let guard = self.session_keys.read();
        let mut keys: Vec<SessionKey> = guard
            .values()
            .filter(|key| wallet_id.map_or(true, |wallet| key.wallet_id == wallet))
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(keys)
    }

    async fn load_sub_account(&self, id: &str) -> StoreResult<Option<SubAccount>> {
        Ok(self.sub_accounts.read().get(id).cloned())
    }

    async fn save_sub_account(&self, account: &SubAccount) -> StoreResult<()> {
        self.sub_accounts
            .write()
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        self.audit.lock().push(entry.clone());
        Ok(())
    }

    async fn load_audit(&self, since: DateTime<Utc>) -> StoreResult<Vec<AuditLogEntry>> {
        Ok(self
            .audit
            .lock()
            .iter()
            .filter(|entry| entry.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn prune_audit(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut audit = self.audit.lock();
        let original = audit.len();
        audit.retain(|entry| entry.timestamp >= before);
        Ok(original - audit.len())
    }
}
