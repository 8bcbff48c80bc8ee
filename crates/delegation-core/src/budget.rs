//! Sub-account budget ledger.
//!
//! All sub-account state is owned by one runtime task. Callers talk to it
//! through [`LedgerHandle`]; commands are processed one at a time, so the
//! check and the commit of [`LedgerHandle::try_spend`] can never be split by
//! a concurrent request.

use std::sync::Arc;

use agent_handlers::Amount;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{DelegationError, DelegationResult};
use crate::store::StateStore;

const RESET_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAccount {
    pub id: String,
    pub master_wallet_id: String,
    pub daily_spend_limit: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_transaction_limit: Option<Amount>,
    pub total_spent_today: Amount,
    pub last_reset_date: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SubAccount {
    pub fn new(
        id: impl Into<String>,
        master_wallet_id: impl Into<String>,
        daily_spend_limit: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            master_wallet_id: master_wallet_id.into(),
            daily_spend_limit,
            per_transaction_limit: None,
            total_spent_today: Amount::ZERO,
            last_reset_date: now,
            is_active: true,
            expires_at: None,
        }
    }

    pub fn with_per_transaction_limit(mut self, limit: Amount) -> Self {
        self.per_transaction_limit = Some(limit);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn remaining_today(&self) -> Amount {
        self.daily_spend_limit.saturating_sub(self.total_spent_today)
    }

    /// Zeroes today's spend when the last reset is at least a day old.
    fn apply_daily_reset(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.last_reset_date >= Duration::hours(RESET_WINDOW_HOURS) {
            self.total_spent_today = Amount::ZERO;
            self.last_reset_date = now;
            true
        } else {
            false
        }
    }

    /// Runs the limit checks in order. Assumes the daily reset was applied.
    fn evaluate(&self, amount: Amount, now: DateTime<Utc>) -> BudgetDecision {
        let denied = |reason: String| BudgetDecision::denied(reason, self);

        if !self.is_active {
            return denied(format!("sub-account {} is inactive", self.id));
        }
        if self.expires_at.map_or(false, |expires_at| now >= expires_at) {
            return denied(format!("sub-account {} has expired", self.id));
        }
        if let Some(limit) = self.per_transaction_limit {
            if amount > limit {
                return denied(format!(
                    "amount {} exceeds per-transaction limit of {}",
                    amount, limit
                ));
            }
        }
        let within_daily = self
            .total_spent_today
            .checked_add(amount)
            .map_or(false, |total| total <= self.daily_spend_limit);
        if !within_daily {
            return denied(format!(
                "amount {} exceeds daily limit of {} ({} already spent today)",
                amount, self.daily_spend_limit, self.total_spent_today
            ));
        }
        BudgetDecision::allowed(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub spent_today: Amount,
    pub remaining_today: Amount,
}

impl BudgetDecision {
    fn allowed(account: &SubAccount) -> Self {
        Self {
            allowed: true,
            reason: None,
            spent_today: account.total_spent_today,
            remaining_today: account.remaining_today(),
        }
    }

    fn denied(reason: String, account: &SubAccount) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            spent_today: account.total_spent_today,
            remaining_today: account.remaining_today(),
        }
    }

    /// Converts a refusal into [`DelegationError::BudgetExceeded`].
    pub fn into_result(self) -> DelegationResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(DelegationError::BudgetExceeded(
                self.reason.unwrap_or_else(|| "budget check failed".to_string()),
            ))
        }
    }
}

type Reply<T> = oneshot::Sender<DelegationResult<T>>;

enum LedgerCommand {
    Open(SubAccount, Reply<SubAccount>),
    Snapshot(String, Reply<SubAccount>),
    Check(String, Amount, Reply<BudgetDecision>),
    Record(String, Amount, Reply<SubAccount>),
    TrySpend(String, Amount, Reply<BudgetDecision>),
    Release(String, Amount, Reply<SubAccount>),
    SetActive(String, bool, Reply<SubAccount>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LedgerHandle {
    cmd_tx: mpsc::Sender<LedgerCommand>,
}

impl LedgerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> LedgerCommand,
    ) -> DelegationResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| DelegationError::LedgerOffline)?;
        rx.await.map_err(|_| DelegationError::LedgerOffline)?
    }

    /// Registers a new sub-account. Fails if the id is taken.
    pub async fn open_account(&self, account: SubAccount) -> DelegationResult<SubAccount> {
        self.request(|reply| LedgerCommand::Open(account, reply))
            .await
    }

    /// Current view of the account with any due daily reset applied. The
    /// reset itself is only persisted by the next mutating call.
    pub async fn account(&self, id: &str) -> DelegationResult<SubAccount> {
        let id = id.to_string();
        self.request(|reply| LedgerCommand::Snapshot(id, reply))
            .await
    }

    pub async fn check_budget_limits(
        &self,
        id: &str,
        amount: Amount,
    ) -> DelegationResult<BudgetDecision> {
        let id = id.to_string();
        self.request(|reply| LedgerCommand::Check(id, amount, reply))
            .await
    }

    /// Commits spend without checking limits.
    pub async fn record_transaction(&self, id: &str, amount: Amount) -> DelegationResult<SubAccount> {
        let id = id.to_string();
        self.request(|reply| LedgerCommand::Record(id, amount, reply))
            .await
    }

    /// Check and commit as one step. A refusal leaves the account untouched
    /// apart from a due daily reset.
    pub async fn try_spend(&self, id: &str, amount: Amount) -> DelegationResult<BudgetDecision> {
        let id = id.to_string();
        self.request(|reply| LedgerCommand::TrySpend(id, amount, reply))
            .await
    }

    pub async fn release(&self, id: &str, amount: Amount) -> DelegationResult<SubAccount> {
        let id = id.to_string();
        self.request(|reply| LedgerCommand::Release(id, amount, reply))
            .await
    }

    pub async fn set_active(&self, id: &str, active: bool) -> DelegationResult<SubAccount> {
        let id = id.to_string();
        self.request(|reply| LedgerCommand::SetActive(id, active, reply))
            .await
    }

    pub async fn shutdown(&self) -> DelegationResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LedgerCommand::Shutdown(tx))
            .await
            .map_err(|_| DelegationError::LedgerOffline)?;
        rx.await.map_err(|_| DelegationError::LedgerOffline)
    }
}

pub struct BudgetLedger {
    handle: LedgerHandle,
    task: JoinHandle<()>,
}

impl BudgetLedger {
    /// Spawns the ledger runtime on the current tokio runtime.
    pub fn spawn(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let runtime = LedgerRuntime { store, clock };
        let task = tokio::spawn(runtime.run(cmd_rx));
        Self {
            handle: LedgerHandle { cmd_tx },
            task,
        }
    }

    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) -> DelegationResult<()> {
        self.handle.shutdown().await?;
        if let Err(err) = self.task.await {
            warn!(target: "delegation::budget", error = %err, "ledger task ended abnormally");
        }
        Ok(())
    }
}

struct LedgerRuntime {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerRuntime {
    async fn run(self, mut cmd_rx: mpsc::Receiver<LedgerCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                LedgerCommand::Open(account, reply) => {
                    let _ = reply.send(self.open(account).await);
                }
                LedgerCommand::Snapshot(id, reply) => {
                    let _ = reply.send(self.snapshot(&id).await);
                }
                LedgerCommand::Check(id, amount, reply) => {
                    let _ = reply.send(self.check(&id, amount).await);
                }
                LedgerCommand::Record(id, amount, reply) => {
                    let _ = reply.send(self.record(&id, amount).await);
                }
                LedgerCommand::TrySpend(id, amount, reply) => {
                    let _ = reply.send(self.try_spend(&id, amount).await);
                }
                LedgerCommand::Release(id, amount, reply) => {
                    let _ = reply.send(self.release(&id, amount).await);
                }
                LedgerCommand::SetActive(id, active, reply) => {
                    let _ = reply.send(self.set_active(&id, active).await);
                }
                LedgerCommand::Shutdown(reply) => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!(target: "delegation::budget", "ledger runtime exited");
    }

    async fn load(&self, id: &str) -> DelegationResult<SubAccount> {
        self.store
            .load_sub_account(id)
            .await?
            .ok_or_else(|| DelegationError::AccountNotFound(id.to_string()))
    }

    /// Loads the account and applies a due reset, persisting it.
    async fn load_current(&self, id: &str) -> DelegationResult<SubAccount> {
        let mut account = self.load(id).await?;
        if account.apply_daily_reset(self.clock.now()) {
            self.store.save_sub_account(&account).await?;
            debug!(
                target: "delegation::budget",
                account_id = %account.id,
                "daily spend reset"
            );
        }
        Ok(account)
    }

    async fn open(&self, account: SubAccount) -> DelegationResult<SubAccount> {
        if self.store.load_sub_account(&account.id).await?.is_some() {
            return Err(DelegationError::InvalidRequest(format!(
                "sub-account {} already exists",
                account.id
            )));
        }
        self.store.save_sub_account(&account).await?;
        info!(
            target: "delegation::budget",
            account_id = %account.id,
            wallet_id = %account.master_wallet_id,
            daily_limit = %account.daily_spend_limit,
            "sub-account opened"
        );
        Ok(account)
    }

    async fn snapshot(&self, id: &str) -> DelegationResult<SubAccount> {
        let mut account = self.load(id).await?;
        account.apply_daily_reset(self.clock.now());
        Ok(account)
    }

    async fn check(&self, id: &str, amount: Amount) -> DelegationResult<BudgetDecision> {
        let account = self.load_current(id).await?;
        Ok(account.evaluate(amount, self.clock.now()))
    }

    async fn record(&self, id: &str, amount: Amount) -> DelegationResult<SubAccount> {
        let mut account = self.load_current(id).await?;
        account.total_spent_today = account.total_spent_today.saturating_add(amount);
        self.store.save_sub_account(&account).await?;
        debug!(
            target: "delegation::budget",
            account_id = %account.id,
            amount = %amount,
            spent_today = %account.total_spent_today,
            "transaction recorded"
        );
        Ok(account)
    }

    async fn try_spend(&self, id: &str, amount: Amount) -> DelegationResult<BudgetDecision> {
        let mut account = self.load_current(id).await?;
        let decision = account.evaluate(amount, self.clock.now());
        if !decision.allowed {
            debug!(
                target: "delegation::budget",
                account_id = %account.id,
                amount = %amount,
                reason = decision.reason.as_deref().unwrap_or_default(),
                "spend refused"
            );
            return Ok(decision);
        }

        account.total_spent_today = account.total_spent_today.saturating_add(amount);
        self.store.save_sub_account(&account).await?;
        debug!(
            target: "delegation::budget",
            account_id = %account.id,
            amount = %amount,
            spent_today = %account.total_spent_today,
            "spend committed"
        );
        Ok(BudgetDecision::allowed(&account))
    }

    async fn release(&self, id: &str, amount: Amount) -> DelegationResult<SubAccount> {
        let mut account = self.load_current(id).await?;
        account.total_spent_today = account.total_spent_today.saturating_sub(amount);
        self.store.save_sub_account(&account).await?;
        Ok(account)
    }

    async fn set_active(&self, id: &str, active: bool) -> DelegationResult<SubAccount> {
        let mut account = self.load(id).await?;
        account.is_active = active;
        self.store.save_sub_account(&account).await?;
        info!(
            target: "delegation::budget",
            account_id = %account.id,
            active,
            "sub-account status changed"
        );
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn units(value: u64) -> Amount {
        Amount::from_units(value)
    }

    fn spawn() -> (Arc<ManualClock>, Arc<MemoryStore>, BudgetLedger) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let ledger = BudgetLedger::spawn(store.clone(), clock.clone());
        (clock, store, ledger)
    }

    #[tokio::test]
    async fn refuses_spend_past_daily_limit() {
        let (clock, _store, ledger) = spawn();
        let handle = ledger.handle();
        handle
            .open_account(SubAccount::new("acct", "wallet", units(100), clock.now()))
            .await
            .unwrap();

        assert!(handle.try_spend("acct", units(70)).await.unwrap().allowed);
        let decision = handle.try_spend("acct", units(31)).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision
            .reason
            .as_deref()
            .unwrap()
            .contains("daily limit of 100.00"));
        assert_eq!(decision.remaining_today, units(30));
        assert_eq!(
            handle.account("acct").await.unwrap().total_spent_today,
            units(70)
        );
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reset_is_lazy_and_persisted_on_access() {
        let (clock, store, ledger) = spawn();
        let handle = ledger.handle();
        handle
            .open_account(SubAccount::new("acct", "wallet", units(100), clock.now()))
            .await
            .unwrap();
        handle.record_transaction("acct", units(80)).await.unwrap();

        clock.advance(Duration::hours(25));
        let view = handle.account("acct").await.unwrap();
        assert_eq!(view.total_spent_today, Amount::ZERO);
        let stored = store.load_sub_account("acct").await.unwrap().unwrap();
        assert_eq!(stored.total_spent_today, units(80));

        let decision = handle.check_budget_limits("acct", units(90)).await.unwrap();
        assert!(decision.allowed);
        let stored = store.load_sub_account("acct").await.unwrap().unwrap();
        assert_eq!(stored.total_spent_today, Amount::ZERO);
        assert_eq!(stored.last_reset_date, clock.now());
    }

    #[tokio::test]
    async fn inactive_and_expired_accounts_are_refused() {
        let (clock, _store, ledger) = spawn();
        let handle = ledger.handle();
        let expiring = SubAccount::new("temp", "wallet", units(100), clock.now())
            .with_expiry(clock.now() + Duration::hours(1));
        handle.open_account(expiring).await.unwrap();
        handle
            .open_account(SubAccount::new("acct", "wallet", units(100), clock.now()))
            .await
            .unwrap();

        handle.set_active("acct", false).await.unwrap();
        let decision = handle.try_spend("acct", units(1)).await.unwrap();
        assert!(decision.reason.unwrap().contains("inactive"));

        clock.advance(Duration::hours(2));
        let decision = handle.try_spend("temp", units(1)).await.unwrap();
        assert!(decision.reason.unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn release_returns_reserved_spend() {
        let (clock, _store, ledger) = spawn();
        let handle = ledger.handle();
        handle
            .open_account(SubAccount::new("acct", "wallet", units(50), clock.now()))
            .await
            .unwrap();
        handle.try_spend("acct", units(40)).await.unwrap();
        let account = handle.release("acct", units(40)).await.unwrap();
        assert_eq!(account.total_spent_today, Amount::ZERO);
    }

    #[tokio::test]
    async fn unknown_and_duplicate_accounts() {
        let (clock, _store, ledger) = spawn();
        let handle = ledger.handle();
        assert!(matches!(
            handle.try_spend("missing", units(1)).await,
            Err(DelegationError::AccountNotFound(_))
        ));
        let account = SubAccount::new("acct", "wallet", units(50), clock.now());
        handle.open_account(account.clone()).await.unwrap();
        assert!(matches!(
            handle.open_account(account).await,
            Err(DelegationError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn handle_reports_offline_after_shutdown() {
        let (_clock, _store, ledger) = spawn();
        let handle = ledger.handle();
        ledger.shutdown().await.unwrap();
        assert!(matches!(
            handle.account("acct").await,
            Err(DelegationError::LedgerOffline)
        ));
    }
}
