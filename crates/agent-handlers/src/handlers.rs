use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::amount::{Amount, AmountError};
use crate::collaborators::{
    Authorization, ExecutionReceipt, ExecutionRequest, RateProvider, WalletBackend,
};
use crate::envelope::{AgentRequest, ClassifiedIntent};
use crate::kinds::{Action, AgentKind};

const DEFAULT_TOKEN: &str = "USDC";

/// Intent names and free-text keywords a handler answers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMatcher {
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl IntentMatcher {
    pub fn new(intents: &[&str], keywords: &[&str]) -> Self {
        Self {
            intents: intents.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Exact (case-insensitive) match against a classified intent name.
    pub fn matches_intent(&self, intent: &str) -> bool {
        let intent = intent.trim();
        self.intents
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(intent))
    }

    /// Whole-word keyword match against free text. Multi-word keywords must
    /// appear as a contiguous phrase.
    pub fn matches_keywords(&self, text: &str) -> bool {
        let haystack = format!(" {} ", normalize(text));
        self.keywords.iter().any(|keyword| {
            let keyword = normalize(keyword);
            !keyword.is_empty() && haystack.contains(&format!(" {} ", keyword))
        })
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Matching configuration shared by every handler variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub matcher: IntentMatcher,
    /// Higher values are evaluated first.
    pub priority: i32,
}

impl HandlerSpec {
    pub fn new(matcher: IntentMatcher, priority: i32) -> Self {
        Self { matcher, priority }
    }
}

/// Collaborators handlers reach through to do their work.
#[derive(Clone)]
pub struct HandlerServices {
    pub backend: Arc<dyn WalletBackend>,
    pub rates: Arc<dyn RateProvider>,
}

impl HandlerServices {
    pub fn new(backend: Arc<dyn WalletBackend>, rates: Arc<dyn RateProvider>) -> Self {
        Self { backend, rates }
    }
}

/// A routed request that already passed the permission and budget gates.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub request: &'a AgentRequest,
    pub action: Action,
    pub authorization: Option<Authorization>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub message: String,
    pub data: Option<Value>,
    pub requires_confirmation: Option<bool>,
}

#[derive(Debug, Error)]
pub enum HandlerInputError {
    #[error("missing required entity '{0}'")]
    MissingEntity(&'static str),
    #[error("invalid amount: {0}")]
    Amount(#[from] AmountError),
}

/// Closed set of capability handlers the router dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "agent", rename_all = "snake_case")]
pub enum AgentHandler {
    Payment(HandlerSpec),
    Swap(HandlerSpec),
    Bridge(HandlerSpec),
    Conversion(HandlerSpec),
    Portfolio(HandlerSpec),
}

impl AgentHandler {
    pub fn payment() -> Self {
        Self::Payment(HandlerSpec::new(
            IntentMatcher::new(
                &["transfer", "send", "send_payment", "payment"],
                &["send", "pay", "transfer"],
            ),
            50,
        ))
    }

    pub fn swap() -> Self {
        Self::Swap(HandlerSpec::new(
            IntentMatcher::new(&["swap", "swap_tokens"], &["swap", "trade", "exchange"]),
            40,
        ))
    }

    pub fn bridge() -> Self {
        Self::Bridge(HandlerSpec::new(
            IntentMatcher::new(
                &["bridge", "bridge_funds"],
                &["bridge", "cross-chain", "move funds to"],
            ),
            40,
        ))
    }

    pub fn conversion() -> Self {
        Self::Conversion(HandlerSpec::new(
            IntentMatcher::new(
                &["convert", "currency_conversion", "quote"],
                &["convert", "conversion", "how much is", "rate"],
            ),
            30,
        ))
    }

    pub fn portfolio() -> Self {
        Self::Portfolio(HandlerSpec::new(
            IntentMatcher::new(
                &["balance", "check_balance", "portfolio"],
                &["balance", "portfolio", "holdings"],
            ),
            20,
        ))
    }

    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Payment => Self::payment(),
            AgentKind::Swap => Self::swap(),
            AgentKind::Bridge => Self::bridge(),
            AgentKind::Conversion => Self::conversion(),
            AgentKind::Portfolio => Self::portfolio(),
        }
    }

    /// One handler per known agent with the built-in matchers.
    pub fn defaults() -> Vec<AgentHandler> {
        AgentKind::ALL.iter().map(|kind| Self::for_kind(*kind)).collect()
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            Self::Payment(_) => AgentKind::Payment,
            Self::Swap(_) => AgentKind::Swap,
            Self::Bridge(_) => AgentKind::Bridge,
            Self::Conversion(_) => AgentKind::Conversion,
            Self::Portfolio(_) => AgentKind::Portfolio,
        }
    }

    fn spec(&self) -> &HandlerSpec {
        match self {
            Self::Payment(spec)
            | Self::Swap(spec)
            | Self::Bridge(spec)
            | Self::Conversion(spec)
            | Self::Portfolio(spec) => spec,
        }
    }

    fn spec_mut(&mut self) -> &mut HandlerSpec {
        match self {
            Self::Payment(spec)
            | Self::Swap(spec)
            | Self::Bridge(spec)
            | Self::Conversion(spec)
            | Self::Portfolio(spec) => spec,
        }
    }

    pub fn priority(&self) -> i32 {
        self.spec().priority
    }

    pub fn matcher(&self) -> &IntentMatcher {
        &self.spec().matcher
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec_mut().priority = priority;
        self
    }

    pub fn with_matcher(mut self, matcher: IntentMatcher) -> Self {
        self.spec_mut().matcher = matcher;
        self
    }

    pub fn supports(&self, action: Action) -> bool {
        self.kind().actions().contains(&action)
    }

    /// Exact match on a classifier result. When the classifier names an
    /// agent, only that agent's handler can match.
    pub fn matches_classified(&self, intent: &ClassifiedIntent) -> bool {
        match intent.agent {
            Some(agent) if agent != self.kind() => false,
            Some(_) => {
                self.matcher().matches_intent(&intent.intent)
                    || Action::parse(&intent.intent).is_some_and(|action| self.supports(action))
            }
            None => self.matcher().matches_intent(&intent.intent),
        }
    }

    pub fn matches_text(&self, text: &str) -> bool {
        self.matcher().matches_keywords(text)
    }

    /// Picks the action to run: the classified action when this handler
    /// supports it, otherwise the handler's primary action.
    pub fn resolve_action(&self, request: &AgentRequest) -> Action {
        request
            .classified_intent
            .as_ref()
            .and_then(|intent| Action::parse(&intent.intent))
            .filter(|action| self.supports(*action))
            .unwrap_or_else(|| self.kind().primary_action())
    }

    /// Amount the action would move out of the wallet, `None` for read-only
    /// actions.
    pub fn spend_amount(
        &self,
        request: &AgentRequest,
        action: Action,
    ) -> Result<Option<Amount>, HandlerInputError> {
        if !action.moves_funds() {
            return Ok(None);
        }
        match request.amount()? {
            Some(amount) => Ok(Some(amount)),
            None => Err(HandlerInputError::MissingEntity("amount")),
        }
    }

    pub async fn execute(
        &self,
        invocation: Invocation<'_>,
        services: &HandlerServices,
    ) -> Result<HandlerOutcome> {
        if !self.supports(invocation.action) {
            return Err(anyhow!(
                "action {} is not supported by the {} agent",
                invocation.action,
                self.kind()
            ));
        }
        debug!(
            target: "agent_handlers",
            agent = %self.kind(),
            action = %invocation.action,
            "executing handler"
        );

        match self {
            Self::Payment(_) => execute_transfer(invocation, services).await,
            Self::Swap(_) => execute_swap(invocation, services).await,
            Self::Bridge(_) => execute_bridge(invocation, services).await,
            Self::Conversion(_) => execute_conversion(invocation, services).await,
            Self::Portfolio(_) => execute_balance(invocation, services).await,
        }
    }
}

/// Canonical bytes a session key signs to authorize a routed request.
pub fn signing_payload(request: &AgentRequest, agent: AgentKind, action: Action) -> Vec<u8> {
    let payload = json!({
        "walletId": request.context.wallet_id,
        "userId": request.context.user_id,
        "agent": agent,
        "action": action,
        "entities": request.entities,
    });
    serde_json::to_vec(&payload).unwrap_or_default()
}

fn require<'a>(request: &'a AgentRequest, keys: &[&str], name: &'static str) -> Result<&'a str> {
    request
        .entity_str(keys)
        .ok_or_else(|| anyhow!(HandlerInputError::MissingEntity(name)))
}

fn require_amount(request: &AgentRequest) -> Result<Amount> {
    request
        .amount()
        .map_err(HandlerInputError::from)?
        .ok_or_else(|| anyhow!(HandlerInputError::MissingEntity("amount")))
}

async fn submit(
    invocation: &Invocation<'_>,
    services: &HandlerServices,
    agent: AgentKind,
    params: Value,
) -> Result<ExecutionReceipt> {
    let request = ExecutionRequest {
        wallet_id: invocation.request.context.wallet_id.clone(),
        agent,
        action: invocation.action,
        params,
        authorization: invocation.authorization.clone(),
    };
    services.backend.submit(&request).await
}

async fn execute_transfer(
    invocation: Invocation<'_>,
    services: &HandlerServices,
) -> Result<HandlerOutcome> {
    let request = invocation.request;
    let recipient = require(request, &["recipient", "to", "address"], "recipient")?;
    let amount = require_amount(request)?;
    let token = request
        .entity_str(&["token", "currency"])
        .unwrap_or(DEFAULT_TOKEN);
    let chain = request.entity_str(&["chain"]);

    let params = json!({
        "recipient": recipient,
        "amount": amount,
        "token": token,
        "chain": chain,
    });
    let receipt = submit(&invocation, services, AgentKind::Payment, params).await?;

    Ok(HandlerOutcome {
        message: format!("Sent {} {} to {}", amount, token, recipient),
        data: Some(json!({
            "txHash": receipt.tx_hash,
            "recipient": recipient,
            "amount": amount,
            "token": token,
        })),
        requires_confirmation: Some(false),
    })
}

async fn execute_swap(
    invocation: Invocation<'_>,
    services: &HandlerServices,
) -> Result<HandlerOutcome> {
    let request = invocation.request;
    let from_token = require(request, &["fromToken", "from", "token"], "fromToken")?;
    let to_token = require(request, &["toToken", "to"], "toToken")?;
    let amount = require_amount(request)?;
    let chain = request.entity_str(&["chain"]);

    let params = json!({
        "fromToken": from_token,
        "toToken": to_token,
        "amount": amount,
        "chain": chain,
    });
    let receipt = submit(&invocation, services, AgentKind::Swap, params).await?;

    Ok(HandlerOutcome {
        message: format!("Swapped {} {} for {}", amount, from_token, to_token),
        data: Some(json!({
            "txHash": receipt.tx_hash,
            "fromToken": from_token,
            "toToken": to_token,
            "amount": amount,
        })),
        requires_confirmation: Some(false),
    })
}

async fn execute_bridge(
    invocation: Invocation<'_>,
    services: &HandlerServices,
) -> Result<HandlerOutcome> {
    let request = invocation.request;
    let to_chain = require(request, &["toChain", "destinationChain"], "toChain")?;
    let from_chain = request.entity_str(&["fromChain", "chain"]);
    let amount = require_amount(request)?;
    let token = request
        .entity_str(&["token", "currency"])
        .unwrap_or(DEFAULT_TOKEN);

    let params = json!({
        "fromChain": from_chain,
        "toChain": to_chain,
        "token": token,
        "amount": amount,
    });
    let receipt = submit(&invocation, services, AgentKind::Bridge, params).await?;

    Ok(HandlerOutcome {
        message: format!("Bridging {} {} to {}", amount, token, to_chain),
        data: Some(json!({
            "txHash": receipt.tx_hash,
            "fromChain": from_chain,
            "toChain": to_chain,
            "token": token,
            "amount": amount,
        })),
        requires_confirmation: Some(false),
    })
}

async fn execute_conversion(
    invocation: Invocation<'_>,
    services: &HandlerServices,
) -> Result<HandlerOutcome> {
    let request = invocation.request;
    let amount = require_amount(request)?;
    let from = require(request, &["fromCurrency", "from", "currency"], "fromCurrency")?;
    let to = require(request, &["toCurrency", "to"], "toCurrency")?;

    let rate = services.rates.rate(from, to).await?;
    let converted = amount
        .mul_rate(rate)
        .ok_or_else(|| anyhow!("conversion of {} {} overflowed", amount, from))?;

    Ok(HandlerOutcome {
        message: format!(
            "{} {} is about {} {}",
            amount,
            from.to_ascii_uppercase(),
            converted,
            to.to_ascii_uppercase()
        ),
        data: Some(json!({
            "from": from.to_ascii_uppercase(),
            "to": to.to_ascii_uppercase(),
            "amount": amount,
            "rate": rate,
            "converted": converted,
        })),
        requires_confirmation: None,
    })
}

async fn execute_balance(
    invocation: Invocation<'_>,
    services: &HandlerServices,
) -> Result<HandlerOutcome> {
    let wallet_id = &invocation.request.context.wallet_id;
    let balances = services.backend.balances(wallet_id).await?;

    Ok(HandlerOutcome {
        message: format!("Wallet {} holds {} token balances", wallet_id, balances.len()),
        data: Some(json!({ "balances": balances })),
        requires_confirmation: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{StaticRateTable, TokenBalance};
    use crate::envelope::RequestContext;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        submitted: Mutex<Vec<ExecutionRequest>>,
    }

    #[async_trait]
    impl WalletBackend for RecordingBackend {
        async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionReceipt> {
            self.submitted.lock().unwrap().push(request.clone());
            Ok(ExecutionReceipt {
                tx_hash: "0xfeed".to_string(),
            })
        }

        async fn balances(&self, _wallet_id: &str) -> Result<Vec<TokenBalance>> {
            Ok(vec![TokenBalance {
                token: "USDC".to_string(),
                chain: Some("base".to_string()),
                amount: Amount::from_units(12),
            }])
        }
    }

    fn services(backend: Arc<RecordingBackend>) -> HandlerServices {
        let rates = StaticRateTable::new().with_rate("USD", "EUR", Amount::parse("0.9").unwrap());
        HandlerServices::new(backend, Arc::new(rates))
    }

    fn context() -> RequestContext {
        RequestContext::new("wallet-1", "user-1")
    }

    #[test]
    fn keyword_matching_is_whole_word() {
        let matcher = IntentMatcher::new(&[], &["pay", "how much is"]);
        assert!(matcher.matches_keywords("Please PAY alice"));
        assert!(matcher.matches_keywords("how much is 5 eth?"));
        assert!(!matcher.matches_keywords("show my payroll"));
    }

    #[test]
    fn classified_agent_restricts_match() {
        let swap = AgentHandler::swap();
        assert!(swap.matches_classified(&ClassifiedIntent::new("swap_tokens")));
        assert!(!swap.matches_classified(&ClassifiedIntent::for_agent(
            "swap",
            AgentKind::Payment
        )));
        assert!(AgentHandler::payment()
            .matches_classified(&ClassifiedIntent::for_agent("transfer", AgentKind::Payment)));
    }

    #[test]
    fn spend_amount_required_only_for_fund_moving_actions() {
        let handler = AgentHandler::payment();
        let request = AgentRequest::new("send", context());
        assert!(matches!(
            handler.spend_amount(&request, Action::Transfer),
            Err(HandlerInputError::MissingEntity("amount"))
        ));
        assert_eq!(
            AgentHandler::portfolio()
                .spend_amount(&request, Action::Balance)
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn transfer_submits_signed_request() {
        let backend = Arc::new(RecordingBackend::default());
        let request = AgentRequest::new("send 5 to bob", context())
            .with_entity("recipient", "0xb0b")
            .with_entity("amount", "5");
        let authorization = Authorization {
            session_key_id: "sk-1".to_string(),
            signer: "0xabc".to_string(),
            signature: "deadbeef".to_string(),
        };

        let outcome = AgentHandler::payment()
            .execute(
                Invocation {
                    request: &request,
                    action: Action::Transfer,
                    authorization: Some(authorization.clone()),
                },
                &services(backend.clone()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.message, "Sent 5.00 USDC to 0xb0b");
        let submitted = backend.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].authorization, Some(authorization));
        assert_eq!(submitted[0].params["amount"], json!("5.00"));
    }

    #[tokio::test]
    async fn conversion_uses_rate_provider_without_backend() {
        let backend = Arc::new(RecordingBackend::default());
        let request = AgentRequest::new("convert 100 usd to eur", context())
            .with_entity("amount", 100)
            .with_entity("from", "usd")
            .with_entity("to", "eur");

        let outcome = AgentHandler::conversion()
            .execute(
                Invocation {
                    request: &request,
                    action: Action::Convert,
                    authorization: None,
                },
                &services(backend.clone()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.message, "100.00 USD is about 90.00 EUR");
        assert!(backend.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_unsupported_action() {
        let backend = Arc::new(RecordingBackend::default());
        let request = AgentRequest::new("swap", context());
        let err = AgentHandler::swap()
            .execute(
                Invocation {
                    request: &request,
                    action: Action::Transfer,
                    authorization: None,
                },
                &services(backend),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
