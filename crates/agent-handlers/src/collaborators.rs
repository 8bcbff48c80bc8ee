use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::amount::Amount;
use crate::envelope::ClassifiedIntent;
use crate::kinds::{Action, AgentKind};

/// Turns free text into a classified intent. Implemented by the NLP layer.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Option<ClassifiedIntent>>;
}

/// Signature produced by a session key over an execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub session_key_id: String,
    pub signer: String,
    pub signature: String,
}

/// Opaque call handed to the wallet execution backend. Call-data encoding
/// happens on the other side of this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub wallet_id: String,
    pub agent: AgentKind,
    pub action: Action,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReceipt {
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    pub amount: Amount,
}

/// Executes signed wallet calls and answers balance queries.
#[async_trait]
pub trait WalletBackend: Send + Sync {
    async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionReceipt>;

    async fn balances(&self, wallet_id: &str) -> Result<Vec<TokenBalance>>;
}

/// Supplies currency conversion rates, expressed as fixed-point amounts.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn rate(&self, from: &str, to: &str) -> Result<Amount>;
}

/// Rate provider backed by a fixed table. Inverse pairs are derived.
#[derive(Debug, Clone, Default)]
pub struct StaticRateTable {
    rates: HashMap<(String, String), Amount>,
}

impl StaticRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Amount) -> Self {
        self.rates
            .insert((from.to_ascii_uppercase(), to.to_ascii_uppercase()), rate);
        self
    }
}

#[async_trait]
impl RateProvider for StaticRateTable {
    async fn rate(&self, from: &str, to: &str) -> Result<Amount> {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();
        if from == to {
            return Ok(Amount::from_units(1));
        }
        if let Some(rate) = self.rates.get(&(from.clone(), to.clone())) {
            return Ok(*rate);
        }
        if let Some(inverse) = self.rates.get(&(to.clone(), from.clone())) {
            if !inverse.is_zero() {
                let one = Amount::from_units(1).micros();
                return Ok(Amount::from_micros(one * one / inverse.micros()));
            }
        }
        Err(anyhow!("no conversion rate from {} to {}", from, to))
    }
}
