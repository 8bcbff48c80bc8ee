use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::{StateStore, StoreResult};
use crate::audit::AuditLogEntry;
use crate::budget::SubAccount;
use crate::session::SessionKey;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    session_keys: BTreeMap<String, SessionKey>,
    #[serde(default)]
    sub_accounts: BTreeMap<String, SubAccount>,
    #[serde(default)]
    audit: Vec<AuditLogEntry>,
}

/// Durable store backed by a single JSON document.
///
/// Every mutation rewrites the whole snapshot to a sibling temp file and
/// renames it over the original, so a crash leaves either the old or the
/// new state on disk. A failed write rolls the in-memory change back.
///
/// The audit trail lives in the same document, so hosts should run
/// `AuditLog::prune_expired` periodically to keep rewrites small.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match fs::read_to_string(&path).await {
            Ok(data) if data.trim().is_empty() => Snapshot::default(),
            Ok(data) => serde_json::from_str(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(err) => return Err(err.into()),
        };
        debug!(
            target: "delegation::store",
            path = %path.display(),
            session_keys = snapshot.session_keys.len(),
            sub_accounts = snapshot.sub_accounts.len(),
            "opened state file"
        );
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &Snapshot) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let payload = serde_json::to_vec_pretty(snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_session_key(&self, id: &str) -> StoreResult<Option<SessionKey>> {
        Ok(self.snapshot.lock().await.session_keys.get(id).cloned())
    }

    async fn save_session_key(&self, key: &SessionKey) -> StoreResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        let previous = snapshot.session_keys.insert(key.id.clone(), key.clone());
        if let Err(err) = self.persist(&snapshot).await {
            match previous {
                Some(previous) => snapshot.session_keys.insert(key.id.clone(), previous),
                None => snapshot.session_keys.remove(&key.id),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn list_session_keys(&self, wallet_id: Option<&str>) -> StoreResult<Vec<SessionKey>> {
        let snapshot = self.snapshot.lock().await;
        let mut keys: Vec<SessionKey> = snapshot
            .session_keys
            .values()
            .filter(|key| wallet_id.map_or(true, |wallet| key.wallet_id == wallet))
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(keys)
    }

    async fn load_sub_account(&self, id: &str) -> StoreResult<Option<SubAccount>> {
        Ok(self.snapshot.lock().await.sub_accounts.get(id).cloned())
    }

    async fn save_sub_account(&self, account: &SubAccount) -> StoreResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        let previous = snapshot
            .sub_accounts
            .insert(account.id.clone(), account.clone());
        if let Err(err) = self.persist(&snapshot).await {
            match previous {
                Some(previous) => snapshot.sub_accounts.insert(account.id.clone(), previous),
                None => snapshot.sub_accounts.remove(&account.id),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.audit.push(entry.clone());
        if let Err(err) = self.persist(&snapshot).await {
            snapshot.audit.pop();
            return Err(err);
        }
        Ok(())
    }

    async fn load_audit(&self, since: DateTime<Utc>) -> StoreResult<Vec<AuditLogEntry>> {
        let snapshot = self.snapshot.lock().await;
        Ok(snapshot
            .audit
            .iter()
            .filter(|entry| entry.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn prune_audit(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut snapshot = self.snapshot.lock().await;
        let original = snapshot.audit.len();
        let kept: Vec<AuditLogEntry> = snapshot
            .audit
            .iter()
            .filter(|entry| entry.timestamp >= before)
            .cloned()
            .collect();
        let removed = original - kept.len();
        if removed > 0 {
            let previous = std::mem::replace(&mut snapshot.audit, kept);
            if let Err(err) = self.persist(&snapshot).await {
                snapshot.audit = previous;
                return Err(err);
            }
        }
        Ok(removed)
    }
}
