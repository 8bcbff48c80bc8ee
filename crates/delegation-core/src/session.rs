//! Session key lifecycle: issuance, gate validation, renewal, revocation and
//! the spend counter that caps what a delegated agent may move.
//!
//! Every mutation goes through [`SessionKeyManager`], which serializes
//! writers behind one async mutex so read-modify-write cycles against the
//! store cannot interleave. `spending_used <= spending_limit` holds after
//! every committed write.

use std::collections::BTreeSet;
use std::sync::Arc;

use agent_handlers::{Action, AgentKind, Amount, Authorization};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SessionSettings;
use crate::error::{DelegationError, DelegationResult};
use crate::scope::PermissionScopeTable;
use crate::store::StateStore;
use crate::vault::{generate_signer, sign_with_secret, KeyVault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPermissions {
    pub allowed_actions: BTreeSet<Action>,
    pub spending_limit: Amount,
    pub spending_used: Amount,
    pub expiry_time: DateTime<Utc>,
    pub auto_renew: bool,
    pub max_renewals: u32,
    pub renewals_used: u32,
    /// Length of one grant period; each renewal extends expiry by this much.
    pub period_secs: i64,
}

impl SessionPermissions {
    pub fn remaining(&self) -> Amount {
        self.spending_limit.saturating_sub(self.spending_used)
    }

    pub fn renewals_left(&self) -> u32 {
        self.max_renewals.saturating_sub(self.renewals_used)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub id: String,
    pub wallet_id: String,
    pub user_id: String,
    /// Agent the grant is bound to; `None` lets any agent use it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    pub signer: String,
    pub permissions: SessionPermissions,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) sealed_secret: Option<String>,
}

impl SessionKey {
    /// True once `now` reaches expiry or the key left the active state.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status != SessionStatus::Active || now >= self.permissions.expiry_time
    }

    pub fn has_signing_material(&self) -> bool {
        self.sealed_secret.is_some()
    }
}

/// What a wallet owner grants when issuing a session key.
#[derive(Debug, Clone, Default)]
pub struct SessionGrant {
    pub agent: Option<AgentKind>,
    /// Empty means "everything the bound agent's scope allows".
    pub allowed_actions: BTreeSet<Action>,
    pub spending_limit: Option<Amount>,
    pub duration: Option<Duration>,
    pub auto_renew: bool,
    pub max_renewals: Option<u32>,
}

impl SessionGrant {
    pub fn for_agent(agent: AgentKind) -> Self {
        Self {
            agent: Some(agent),
            ..Self::default()
        }
    }

    pub fn for_actions(actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            allowed_actions: actions.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.allowed_actions = actions.into_iter().collect();
        self
    }

    pub fn with_spending_limit(mut self, limit: Amount) -> Self {
        self.spending_limit = Some(limit);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_auto_renew(mut self, max_renewals: u32) -> Self {
        self.auto_renew = true;
        self.max_renewals = Some(max_renewals);
        self
    }
}

pub struct SessionKeyManager {
    store: Arc<dyn StateStore>,
    vault: Arc<dyn KeyVault>,
    scopes: Arc<PermissionScopeTable>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    writer: Mutex<()>,
}

impl SessionKeyManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        vault: Arc<dyn KeyVault>,
        scopes: Arc<PermissionScopeTable>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            vault,
            scopes,
            clock,
            settings,
            writer: Mutex::new(()),
        }
    }

    pub async fn create(
        &self,
        wallet_id: &str,
        user_id: &str,
        grant: SessionGrant,
    ) -> DelegationResult<SessionKey> {
        let (allowed_actions, default_limit) = match grant.agent {
            Some(agent) => {
                let scope = self.scopes.require(agent)?;
                let actions = if grant.allowed_actions.is_empty() {
                    scope.allowed_actions.clone()
                } else {
                    grant.allowed_actions.clone()
                };
                if let Some(action) = actions.iter().find(|action| !scope.allows(**action)) {
                    return Err(DelegationError::PermissionDenied(format!(
                        "cannot grant '{}' to the {} agent; it is outside the agent's allow-list",
                        action, agent
                    )));
                }
                (actions, Some(scope.default_spending_limit))
            }
            None => (grant.allowed_actions.clone(), None),
        };

        if allowed_actions.is_empty() {
            return Err(DelegationError::InvalidRequest(
                "a session grant must allow at least one action".to_string(),
            ));
        }
        let spending_limit = grant.spending_limit.or(default_limit).ok_or_else(|| {
            DelegationError::InvalidRequest(
                "a spending limit is required when the grant is not bound to an agent".to_string(),
            )
        })?;
        let duration = grant
            .duration
            .unwrap_or_else(|| self.settings.default_duration());
        if duration <= Duration::zero() {
            return Err(DelegationError::InvalidRequest(
                "session duration must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let expiry_time = now.checked_add_signed(duration).ok_or_else(|| {
            DelegationError::InvalidRequest("session duration is out of range".to_string())
        })?;

        let (secret, signer) = generate_signer();
        let sealed_secret = self.vault.encrypt(&secret)?;
        drop(secret);

        let key = SessionKey {
            id: Uuid::new_v4().to_string(),
            wallet_id: wallet_id.to_string(),
            user_id: user_id.to_string(),
            agent: grant.agent,
            signer,
            permissions: SessionPermissions {
                allowed_actions,
                spending_limit,
                spending_used: Amount::ZERO,
                expiry_time,
                auto_renew: grant.auto_renew,
                max_renewals: grant
                    .max_renewals
                    .unwrap_or(self.settings.default_max_renewals),
                renewals_used: 0,
                period_secs: duration.num_seconds(),
            },
            status: SessionStatus::Active,
            created_at: now,
            sealed_secret: Some(sealed_secret),
        };

        let _guard = self.writer.lock().await;
        self.store.save_session_key(&key).await?;
        info!(
            target: "delegation::session",
            session_key_id = %key.id,
            wallet_id = %key.wallet_id,
            agent = ?key.agent,
            spending_limit = %key.permissions.spending_limit,
            expiry = %key.permissions.expiry_time,
            "session key issued"
        );
        Ok(key)
    }

    pub async fn get(&self, id: &str) -> DelegationResult<SessionKey> {
        self.store
            .load_session_key(id)
            .await?
            .ok_or_else(|| DelegationError::SessionNotFound(id.to_string()))
    }

    pub async fn list_for_wallet(&self, wallet_id: &str) -> DelegationResult<Vec<SessionKey>> {
        Ok(self.store.list_session_keys(Some(wallet_id)).await?)
    }

    /// Pure check against the injected clock; never touches the store.
    pub fn is_expired(&self, key: &SessionKey) -> bool {
        key.is_expired_at(self.clock.now())
    }

    pub async fn renew(&self, id: &str) -> DelegationResult<SessionKey> {
        let _guard = self.writer.lock().await;
        let mut key = self.get(id).await?;
        self.renew_locked(&mut key).await?;
        Ok(key)
    }

    async fn renew_locked(&self, key: &mut SessionKey) -> DelegationResult<()> {
        let now = self.clock.now();
        let denied = |reason: String| DelegationError::RenewalDenied {
            id: key.id.clone(),
            reason,
        };

        if key.permissions.renewals_used >= key.permissions.max_renewals {
            return Err(denied(format!(
                "renewal limit of {} reached",
                key.permissions.max_renewals
            )));
        }
        match key.status {
            SessionStatus::Revoked => return Err(denied("session key is revoked".to_string())),
            SessionStatus::Expired => return Err(denied("session key has expired".to_string())),
            SessionStatus::Active if now >= key.permissions.expiry_time => {
                return Err(denied("session key has expired".to_string()))
            }
            SessionStatus::Active => {}
        }
        if !key.permissions.auto_renew {
            return Err(denied("auto-renew is disabled for this key".to_string()));
        }

        let expiry_time = Duration::try_seconds(key.permissions.period_secs)
            .and_then(|period| key.permissions.expiry_time.checked_add_signed(period))
            .ok_or_else(|| denied("renewed expiry is out of range".to_string()))?;
        key.permissions.expiry_time = expiry_time;
        key.permissions.renewals_used += 1;
        self.store.save_session_key(key).await?;
        info!(
            target: "delegation::session",
            session_key_id = %key.id,
            renewals_used = key.permissions.renewals_used,
            expiry = %key.permissions.expiry_time,
            "session key renewed"
        );
        Ok(())
    }

    /// Marks the key revoked and destroys its signing material. Repeat calls
    /// are no-ops.
    pub async fn revoke(&self, id: &str) -> DelegationResult<SessionKey> {
        let _guard = self.writer.lock().await;
        let mut key = self.get(id).await?;
        if key.status == SessionStatus::Revoked && key.sealed_secret.is_none() {
            return Ok(key);
        }
        key.status = SessionStatus::Revoked;
        key.sealed_secret = None;
        self.store.save_session_key(&key).await?;
        info!(
            target: "delegation::session",
            session_key_id = %key.id,
            wallet_id = %key.wallet_id,
            "session key revoked"
        );
        Ok(key)
    }

    /// Gate check: the key must be active and unexpired. Auto-renewing keys
    /// inside the renewal window are renewed here; keys past expiry are
    /// persisted as expired.
    pub async fn validate(&self, id: &str) -> DelegationResult<SessionKey> {
        let _guard = self.writer.lock().await;
        let mut key = self.load_live(id).await?;

        let now = self.clock.now();
        let permissions = &key.permissions;
        if permissions.auto_renew
            && permissions.renewals_left() > 0
            && permissions.expiry_time - now <= self.settings.renewal_window()
        {
            if let Err(err) = self.renew_locked(&mut key).await {
                warn!(
                    target: "delegation::session",
                    session_key_id = %id,
                    error = %err,
                    "automatic renewal failed"
                );
            }
        }
        Ok(key)
    }

    /// Validates the key and confirms it covers `action` on behalf of
    /// `agent` for `wallet_id`.
    pub async fn authorize(
        &self,
        id: &str,
        wallet_id: &str,
        agent: AgentKind,
        action: Action,
    ) -> DelegationResult<SessionKey> {
        let key = self.validate(id).await?;
        if key.wallet_id != wallet_id {
            return Err(DelegationError::PermissionDenied(format!(
                "session key {} was not issued for wallet {}",
                key.id, wallet_id
            )));
        }
        if let Some(bound) = key.agent {
            if bound != agent {
                return Err(DelegationError::PermissionDenied(format!(
                    "session key {} is bound to the {} agent, not {}",
                    key.id, bound, agent
                )));
            }
        }
        if !key.permissions.allowed_actions.contains(&action) {
            return Err(DelegationError::PermissionDenied(format!(
                "action '{}' is not granted by session key {}",
                action, key.id
            )));
        }
        Ok(key)
    }

    /// Atomically adds `amount` to the key's spend, refusing if the spending
    /// limit would be exceeded.
    pub async fn charge(&self, id: &str, amount: Amount) -> DelegationResult<SessionKey> {
        let _guard = self.writer.lock().await;
        let mut key = self.load_live(id).await?;

        let permissions = &mut key.permissions;
        let next = permissions
            .spending_used
            .checked_add(amount)
            .filter(|next| *next <= permissions.spending_limit)
            .ok_or_else(|| {
                DelegationError::BudgetExceeded(format!(
                    "amount {} exceeds session spending limit of {} ({} already used)",
                    amount, permissions.spending_limit, permissions.spending_used
                ))
            })?;
        permissions.spending_used = next;
        self.store.save_session_key(&key).await?;
        debug!(
            target: "delegation::session",
            session_key_id = %key.id,
            amount = %amount,
            spending_used = %key.permissions.spending_used,
            "session spend committed"
        );
        Ok(key)
    }

    /// Returns a previously charged amount, e.g. after the handler failed.
    pub async fn release(&self, id: &str, amount: Amount) -> DelegationResult<SessionKey> {
        let _guard = self.writer.lock().await;
        let mut key = self.get(id).await?;
        key.permissions.spending_used = key.permissions.spending_used.saturating_sub(amount);
        self.store.save_session_key(&key).await?;
        debug!(
            target: "delegation::session",
            session_key_id = %key.id,
            amount = %amount,
            spending_used = %key.permissions.spending_used,
            "session spend released"
        );
        Ok(key)
    }

    /// Signs `payload` with the key's signer. The decrypted secret is
    /// dropped before this returns.
    pub async fn sign(&self, id: &str, payload: &[u8]) -> DelegationResult<Authorization> {
        let key = {
            let _guard = self.writer.lock().await;
            self.load_live(id).await?
        };
        let sealed = key
            .sealed_secret
            .as_deref()
            .ok_or_else(|| DelegationError::SessionRevoked(key.id.clone()))?;

        let signature = {
            let secret = self.vault.decrypt(sealed)?;
            sign_with_secret(&secret, payload)?
        };
        Ok(Authorization {
            session_key_id: key.id,
            signer: key.signer,
            signature,
        })
    }

    /// Persists `expired` for every active key whose expiry has passed.
    pub async fn expire_stale(&self) -> DelegationResult<usize> {
        let _guard = self.writer.lock().await;
        let now = self.clock.now();
        let mut expired = 0;
        for mut key in self.store.list_session_keys(None).await? {
            if key.status == SessionStatus::Active && now >= key.permissions.expiry_time {
                key.status = SessionStatus::Expired;
                self.store.save_session_key(&key).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(target: "delegation::session", expired, "expired stale session keys");
        }
        Ok(expired)
    }

    /// Loads a key that must still be usable. Caller holds the writer lock.
    async fn load_live(&self, id: &str) -> DelegationResult<SessionKey> {
        let mut key = self.get(id).await?;
        match key.status {
            SessionStatus::Revoked => Err(DelegationError::SessionRevoked(key.id)),
            SessionStatus::Expired => Err(DelegationError::SessionExpired(key.id)),
            SessionStatus::Active if self.clock.now() >= key.permissions.expiry_time => {
                key.status = SessionStatus::Expired;
                self.store.save_session_key(&key).await?;
                debug!(
                    target: "delegation::session",
                    session_key_id = %key.id,
                    "session key expired"
                );
                Err(DelegationError::SessionExpired(key.id))
            }
            SessionStatus::Active => Ok(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::vault::AesGcmVault;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        manager: SessionKeyManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let manager = SessionKeyManager::new(
            store.clone(),
            Arc::new(AesGcmVault::ephemeral()),
            Arc::new(PermissionScopeTable::with_defaults()),
            clock.clone(),
            SessionSettings::default(),
        );
        Fixture {
            clock,
            store,
            manager,
        }
    }

    #[tokio::test]
    async fn create_defaults_from_agent_scope() {
        let fx = fixture();
        let key = fx
            .manager
            .create("wallet-1", "user-1", SessionGrant::for_agent(AgentKind::Payment))
            .await
            .unwrap();
        assert_eq!(key.status, SessionStatus::Active);
        assert_eq!(key.permissions.spending_limit, Amount::from_units(1_000));
        assert!(key.permissions.allowed_actions.contains(&Action::Transfer));
        assert_eq!(
            key.permissions.expiry_time,
            fx.clock.now() + Duration::seconds(3_600)
        );
        assert!(key.signer.starts_with("0x"));
        assert!(key.has_signing_material());
        assert_eq!(fx.manager.get(&key.id).await.unwrap(), key);
    }

    #[tokio::test]
    async fn create_rejects_actions_outside_scope() {
        let fx = fixture();
        let grant = SessionGrant::for_agent(AgentKind::Payment).with_actions([Action::Swap]);
        let err = fx.manager.create("w", "u", grant).await.unwrap_err();
        assert!(matches!(err, DelegationError::PermissionDenied(_)));

        let unbound = SessionGrant::for_actions([Action::Transfer]);
        let err = fx.manager.create("w", "u", unbound).await.unwrap_err();
        assert!(matches!(err, DelegationError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn revoked_key_is_expired_forever() {
        let fx = fixture();
        let key = fx
            .manager
            .create("w", "u", SessionGrant::for_agent(AgentKind::Swap))
            .await
            .unwrap();
        let revoked = fx.manager.revoke(&key.id).await.unwrap();
        assert!(fx.manager.is_expired(&revoked));
        assert!(!revoked.has_signing_material());

        let again = fx.manager.revoke(&key.id).await.unwrap();
        assert_eq!(again, revoked);

        fx.clock.advance(Duration::days(365));
        let stored = fx.manager.get(&key.id).await.unwrap();
        assert!(fx.manager.is_expired(&stored));
        assert!(matches!(
            fx.manager.validate(&key.id).await,
            Err(DelegationError::SessionRevoked(_))
        ));
        assert!(matches!(
            fx.manager.sign(&key.id, b"x").await,
            Err(DelegationError::SessionRevoked(_))
        ));
    }

    #[tokio::test]
    async fn is_expired_does_not_mutate() {
        let fx = fixture();
        let key = fx
            .manager
            .create("w", "u", SessionGrant::for_agent(AgentKind::Swap))
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(2));
        assert!(fx.manager.is_expired(&key));
        let stored = fx.store.load_session_key(&key.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);

        assert!(matches!(
            fx.manager.validate(&key.id).await,
            Err(DelegationError::SessionExpired(_))
        ));
        let stored = fx.store.load_session_key(&key.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn renewal_respects_cap_and_flag() {
        let fx = fixture();
        let grant = SessionGrant::for_agent(AgentKind::Payment).with_auto_renew(1);
        let key = fx.manager.create("w", "u", grant).await.unwrap();

        let renewed = fx.manager.renew(&key.id).await.unwrap();
        assert_eq!(renewed.permissions.renewals_used, 1);
        assert_eq!(
            renewed.permissions.expiry_time,
            key.permissions.expiry_time + Duration::seconds(3_600)
        );

        let err = fx.manager.renew(&key.id).await.unwrap_err();
        assert!(matches!(err, DelegationError::RenewalDenied { .. }));
        assert!(err.to_string().contains("renewal limit of 1"));

        let manual = fx
            .manager
            .create("w", "u", SessionGrant::for_agent(AgentKind::Payment))
            .await
            .unwrap();
        assert!(matches!(
            fx.manager.renew(&manual.id).await,
            Err(DelegationError::RenewalDenied { .. })
        ));
    }

    #[tokio::test]
    async fn renewal_cap_wins_even_with_auto_renew_disabled() {
        let fx = fixture();
        let grant = SessionGrant {
            max_renewals: Some(0),
            ..SessionGrant::for_agent(AgentKind::Payment)
        };
        let key = fx.manager.create("w", "u", grant).await.unwrap();
        let err = fx.manager.renew(&key.id).await.unwrap_err();
        assert!(err.to_string().contains("renewal limit of 0"));
    }

    #[tokio::test]
    async fn validate_auto_renews_inside_window() {
        let fx = fixture();
        let grant = SessionGrant::for_agent(AgentKind::Payment).with_auto_renew(2);
        let key = fx.manager.create("w", "u", grant).await.unwrap();

        fx.clock.advance(Duration::minutes(30));
        let untouched = fx.manager.validate(&key.id).await.unwrap();
        assert_eq!(untouched.permissions.renewals_used, 0);

        fx.clock.advance(Duration::minutes(26));
        let renewed = fx.manager.validate(&key.id).await.unwrap();
        assert_eq!(renewed.permissions.renewals_used, 1);
        assert!(!fx.manager.is_expired(&renewed));
    }

    #[tokio::test]
    async fn charge_never_exceeds_limit() {
        let fx = fixture();
        let grant = SessionGrant::for_agent(AgentKind::Payment)
            .with_spending_limit(Amount::from_units(100));
        let key = fx.manager.create("w", "u", grant).await.unwrap();

        fx.manager.charge(&key.id, Amount::from_units(60)).await.unwrap();
        let err = fx
            .manager
            .charge(&key.id, Amount::from_units(41))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::BudgetExceeded(_)));
        assert!(err.to_string().contains("spending limit of 100.00"));

        let full = fx.manager.charge(&key.id, Amount::from_units(40)).await.unwrap();
        assert_eq!(full.permissions.spending_used, full.permissions.spending_limit);

        let released = fx.manager.release(&key.id, Amount::from_units(40)).await.unwrap();
        assert_eq!(released.permissions.spending_used, Amount::from_units(60));
    }

    #[tokio::test]
    async fn authorize_checks_wallet_agent_and_action() {
        let fx = fixture();
        let key = fx
            .manager
            .create("wallet-1", "u", SessionGrant::for_agent(AgentKind::Payment))
            .await
            .unwrap();
        assert!(fx
            .manager
            .authorize(&key.id, "wallet-1", AgentKind::Payment, Action::Transfer)
            .await
            .is_ok());
        for (wallet, agent, action) in [
            ("wallet-2", AgentKind::Payment, Action::Transfer),
            ("wallet-1", AgentKind::Swap, Action::Swap),
            ("wallet-1", AgentKind::Payment, Action::Swap),
        ] {
            assert!(matches!(
                fx.manager.authorize(&key.id, wallet, agent, action).await,
                Err(DelegationError::PermissionDenied(_))
            ));
        }
    }

    #[tokio::test]
    async fn expire_stale_marks_only_elapsed_keys() {
        let fx = fixture();
        let short = SessionGrant::for_agent(AgentKind::Swap).with_duration(Duration::minutes(5));
        let long = SessionGrant::for_agent(AgentKind::Swap).with_duration(Duration::hours(5));
        let short = fx.manager.create("w", "u", short).await.unwrap();
        let long = fx.manager.create("w", "u", long).await.unwrap();

        fx.clock.advance(Duration::minutes(10));
        assert_eq!(fx.manager.expire_stale().await.unwrap(), 1);
        assert_eq!(
            fx.manager.get(&short.id).await.unwrap().status,
            SessionStatus::Expired
        );
        assert_eq!(
            fx.manager.get(&long.id).await.unwrap().status,
            SessionStatus::Active
        );
        assert_eq!(fx.manager.list_for_wallet("w").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn out_of_range_expiry_is_refused() {
        let fx = fixture();
        let grant = SessionGrant::for_agent(AgentKind::Payment)
            .with_duration(Duration::days(10_000_000_000));
        assert!(matches!(
            fx.manager.create("wallet-1", "user-1", grant).await,
            Err(DelegationError::InvalidRequest(_))
        ));

        let grant = SessionGrant::for_agent(AgentKind::Payment).with_auto_renew(1);
        let mut key = fx.manager.create("wallet-1", "user-1", grant).await.unwrap();
        key.permissions.period_secs = i64::MAX;
        fx.store.save_session_key(&key).await.unwrap();

        let err = fx.manager.renew(&key.id).await.unwrap_err();
        assert!(matches!(err, DelegationError::RenewalDenied { .. }));
        let stored = fx.manager.get(&key.id).await.unwrap();
        assert_eq!(stored.permissions.renewals_used, 0);
        assert_eq!(stored.permissions.expiry_time, key.permissions.expiry_time);
    }
}
