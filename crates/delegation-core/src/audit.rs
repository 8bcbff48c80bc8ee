//! Append-only trail of gated decisions.
//!
//! Entries are written through to the [`StateStore`] and indexed in memory
//! by session key, wallet and user. Each index keeps only the most recent
//! `index_capacity` entries and drops anything older than the retention
//! window. Store failures are logged and swallowed: the action being
//! audited is never failed or rolled back because of them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agent_handlers::{Action, AgentKind, Amount};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AuditSettings;
use crate::error::DelegationResult;
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_id: Option<String>,
    pub wallet_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditLogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        wallet_id: impl Into<String>,
        user_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            session_key_id: None,
            wallet_id: wallet_id.into(),
            user_id: user_id.into(),
            agent: None,
            action: action.into(),
            amount: None,
            success: true,
            error: None,
        }
    }

    pub fn with_session(mut self, session_key_id: Option<String>) -> Self {
        self.session_key_id = session_key_id;
        self
    }

    pub fn with_agent(mut self, agent: AgentKind, action: Action) -> Self {
        self.agent = Some(agent);
        self.action = action.as_str().to_string();
        self
    }

    pub fn with_amount(mut self, amount: Option<Amount>) -> Self {
        self.amount = amount;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

type Index = HashMap<String, VecDeque<Arc<AuditLogEntry>>>;

#[derive(Default)]
struct AuditIndexes {
    by_session: Index,
    by_wallet: Index,
    by_user: Index,
}

pub struct AuditLog {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    settings: AuditSettings,
    indexes: Mutex<AuditIndexes>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, settings: AuditSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            indexes: Mutex::new(AuditIndexes::default()),
        }
    }

    /// Rebuilds the in-memory indexes from entries still inside the
    /// retention window.
    pub async fn restore(&self) -> DelegationResult<usize> {
        let cutoff = self.cutoff();
        let entries = self.store.load_audit(cutoff).await?;
        let restored = entries.len();
        for entry in entries {
            self.index(Arc::new(entry), cutoff);
        }
        debug!(target: "delegation::audit", restored, "audit indexes restored");
        Ok(restored)
    }

    pub async fn record(&self, entry: AuditLogEntry) {
        if let Err(err) = self.store.append_audit(&entry).await {
            warn!(
                target: "delegation::audit",
                entry_id = %entry.id,
                wallet_id = %entry.wallet_id,
                action = %entry.action,
                error = %err,
                "audit write failed; entry kept in memory only"
            );
        }
        self.index(Arc::new(entry), self.cutoff());
    }

    /// Newest first.
    pub fn for_session(&self, session_key_id: &str) -> Vec<AuditLogEntry> {
        self.query(|indexes| indexes.by_session.get(session_key_id))
    }

    /// Newest first.
    pub fn for_wallet(&self, wallet_id: &str) -> Vec<AuditLogEntry> {
        self.query(|indexes| indexes.by_wallet.get(wallet_id))
    }

    /// Newest first.
    pub fn for_user(&self, user_id: &str) -> Vec<AuditLogEntry> {
        self.query(|indexes| indexes.by_user.get(user_id))
    }

    /// Ages out entries past retention from the indexes and the store.
    /// Returns how many rows the store dropped. Nothing calls this on a
    /// timer; hosts schedule it.
    pub async fn prune_expired(&self) -> usize {
        let cutoff = self.cutoff();
        {
            let mut guard = self.indexes.lock();
            let indexes = &mut *guard;
            for index in [
                &mut indexes.by_session,
                &mut indexes.by_wallet,
                &mut indexes.by_user,
            ] {
                index.retain(|_, entries| {
                    entries.retain(|entry| entry.timestamp >= cutoff);
                    !entries.is_empty()
                });
            }
        }

        match self.store.prune_audit(cutoff).await {
            Ok(removed) => {
                debug!(target: "delegation::audit", removed, "pruned expired audit entries");
                removed
            }
            Err(err) => {
                warn!(target: "delegation::audit", error = %err, "audit prune failed");
                0
            }
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_sub_signed(self.settings.retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn index(&self, entry: Arc<AuditLogEntry>, cutoff: DateTime<Utc>) {
        let capacity = self.settings.index_capacity;
        let mut indexes = self.indexes.lock();
        let AuditIndexes {
            by_session,
            by_wallet,
            by_user,
        } = &mut *indexes;

        if let Some(session_key_id) = &entry.session_key_id {
            push_capped(by_session, session_key_id, entry.clone(), capacity, cutoff);
        }
        push_capped(by_wallet, &entry.wallet_id, entry.clone(), capacity, cutoff);
        push_capped(by_user, &entry.user_id, entry.clone(), capacity, cutoff);
    }

    fn query(
        &self,
        pick: impl FnOnce(&AuditIndexes) -> Option<&VecDeque<Arc<AuditLogEntry>>>,
    ) -> Vec<AuditLogEntry> {
        let cutoff = self.cutoff();
        let indexes = self.indexes.lock();
        pick(&indexes)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|entry| entry.timestamp >= cutoff)
                    .map(|entry| entry.as_ref().clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn push_capped(
    index: &mut Index,
    key: &str,
    entry: Arc<AuditLogEntry>,
    capacity: usize,
    cutoff: DateTime<Utc>,
) {
    let entries = index.entry(key.to_string()).or_default();
    entries.push_back(entry);
    while entries
        .front()
        .map_or(false, |oldest| oldest.timestamp < cutoff)
    {
        entries.pop_front();
    }
    while entries.len() > capacity {
        entries.pop_front();
    }
}
