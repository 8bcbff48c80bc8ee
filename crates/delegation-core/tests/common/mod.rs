#![allow(dead_code)]

use std::sync::Arc;

use agent_handlers::{
    AgentRequest, Amount, ExecutionReceipt, ExecutionRequest, HandlerServices, RequestContext,
    StaticRateTable, TokenBalance, WalletBackend,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use delegation_core::{
    AesGcmVault, DelegationConfig, DelegationEngine, ManualClock, StateStore,
};
use parking_lot::Mutex;

pub const WALLET: &str = "wallet-1";
pub const USER: &str = "user-1";

/// Wallet backend that fails a scripted number of submissions before
/// succeeding, and remembers what it was asked to execute.
#[derive(Default)]
pub struct ScriptedBackend {
    failures_left: Mutex<u32>,
    submissions: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedBackend {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: Mutex::new(times),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<ExecutionRequest> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl WalletBackend for ScriptedBackend {
    async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionReceipt> {
        {
            let mut failures_left = self.failures_left.lock();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(anyhow!("execution backend temporarily unavailable"));
            }
        }
        let mut submissions = self.submissions.lock();
        submissions.push(request.clone());
        Ok(ExecutionReceipt {
            tx_hash: format!("0x{:064x}", submissions.len()),
        })
    }

    async fn balances(&self, _wallet_id: &str) -> Result<Vec<TokenBalance>> {
        Ok(vec![TokenBalance {
            token: "USDC".to_string(),
            chain: Some("base".to_string()),
            amount: Amount::from_units(1_250),
        }])
    }
}

pub fn services(backend: Arc<ScriptedBackend>) -> HandlerServices {
    let rates = StaticRateTable::new().with_rate("USD", "EUR", Amount::from_micros(920_000));
    HandlerServices::new(backend, Arc::new(rates))
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ))
}

pub struct Harness {
    pub engine: DelegationEngine,
    pub backend: Arc<ScriptedBackend>,
    pub clock: Arc<ManualClock>,
}

pub async fn harness() -> Harness {
    harness_with(ScriptedBackend::default(), DelegationConfig::default(), None).await
}

pub async fn harness_with(
    backend: ScriptedBackend,
    config: DelegationConfig,
    store: Option<Arc<dyn StateStore>>,
) -> Harness {
    let backend = Arc::new(backend);
    let clock = clock();
    let mut builder = DelegationEngine::builder(services(backend.clone()))
        .with_config(config)
        .with_clock(clock.clone())
        .with_vault(Arc::new(AesGcmVault::from_secret("integration test secret").unwrap()));
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    Harness {
        engine: builder.build().await.unwrap(),
        backend,
        clock,
    }
}

pub fn context() -> RequestContext {
    RequestContext::new(WALLET, USER)
}

pub fn transfer(amount: &str) -> AgentRequest {
    AgentRequest::new("send usdc to alice", context())
        .with_entity("amount", amount)
        .with_entity("recipient", "0xa11ce")
}

pub fn units(value: u64) -> Amount {
    Amount::from_units(value)
}
