use std::collections::{BTreeSet, HashMap};

use agent_handlers::{Action, AgentKind, AgentRequest, Amount};
use serde::{Deserialize, Serialize};

use crate::error::{DelegationError, DelegationResult};

const CHAIN_ENTITIES: [&str; 3] = ["chain", "fromChain", "toChain"];
const TOKEN_ENTITIES: [&str; 3] = ["token", "fromToken", "toToken"];

/// Static allow-list and default limits for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPermissionScope {
    pub agent: AgentKind,
    pub allowed_actions: BTreeSet<Action>,
    pub default_spending_limit: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_transaction_limit: Option<Amount>,
    /// Case-insensitive; `None` allows every chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_chains: Option<Vec<String>>,
    /// Case-insensitive; `None` allows every token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tokens: Option<Vec<String>>,
}

impl AgentPermissionScope {
    pub fn new(
        agent: AgentKind,
        actions: impl IntoIterator<Item = Action>,
        default_spending_limit: Amount,
    ) -> Self {
        Self {
            agent,
            allowed_actions: actions.into_iter().collect(),
            default_spending_limit,
            per_transaction_limit: None,
            allowed_chains: None,
            allowed_tokens: None,
        }
    }

    pub fn with_per_transaction_limit(mut self, limit: Amount) -> Self {
        self.per_transaction_limit = Some(limit);
        self
    }

    pub fn with_allowed_chains(mut self, chains: &[&str]) -> Self {
        self.allowed_chains = Some(chains.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_allowed_tokens(mut self, tokens: &[&str]) -> Self {
        self.allowed_tokens = Some(tokens.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn allows(&self, action: Action) -> bool {
        self.allowed_actions.contains(&action)
    }

    /// Checks the action and any chain/token entities the request names.
    pub fn check_request(&self, request: &AgentRequest, action: Action) -> DelegationResult<()> {
        if !self.allows(action) {
            return Err(DelegationError::PermissionDenied(format!(
                "action '{}' is not in the {} agent's allow-list",
                action, self.agent
            )));
        }

        if let Some(chains) = &self.allowed_chains {
            for key in CHAIN_ENTITIES {
                if let Some(chain) = request.entity_str(&[key]) {
                    if !contains_ignore_case(chains, chain) {
                        return Err(DelegationError::PermissionDenied(format!(
                            "chain '{}' is not allowed for the {} agent",
                            chain, self.agent
                        )));
                    }
                }
            }
        }

        if let Some(tokens) = &self.allowed_tokens {
            for key in TOKEN_ENTITIES {
                if let Some(token) = request.entity_str(&[key]) {
                    if !contains_ignore_case(tokens, token) {
                        return Err(DelegationError::PermissionDenied(format!(
                            "token '{}' is not allowed for the {} agent",
                            token, self.agent
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn check_per_transaction(&self, amount: Amount) -> DelegationResult<()> {
        match self.per_transaction_limit {
            Some(limit) if amount > limit => Err(DelegationError::BudgetExceeded(format!(
                "amount {} exceeds the {} agent's per-transaction limit of {}",
                amount, self.agent, limit
            ))),
            _ => Ok(()),
        }
    }
}

fn contains_ignore_case(values: &[String], candidate: &str) -> bool {
    values.iter().any(|value| value.eq_ignore_ascii_case(candidate))
}

/// Permission scopes for every configured agent. Built once and handed to
/// the router and session key manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionScopeTable {
    scopes: HashMap<AgentKind, AgentPermissionScope>,
}

impl PermissionScopeTable {
    pub fn new() -> Self {
        Self {
            scopes: HashMap::new(),
        }
    }

    pub fn from_scopes(scopes: impl IntoIterator<Item = AgentPermissionScope>) -> Self {
        let mut table = Self::new();
        for scope in scopes {
            table.insert(scope);
        }
        table
    }

    pub fn with_defaults() -> Self {
        Self::from_scopes(default_scopes())
    }

    pub fn insert(&mut self, scope: AgentPermissionScope) {
        self.scopes.insert(scope.agent, scope);
    }

    pub fn get(&self, agent: AgentKind) -> Option<&AgentPermissionScope> {
        self.scopes.get(&agent)
    }

    /// Scope lookup that treats an unconfigured agent as a permission denial.
    pub fn require(&self, agent: AgentKind) -> DelegationResult<&AgentPermissionScope> {
        self.get(agent).ok_or_else(|| {
            DelegationError::PermissionDenied(format!(
                "no permission scope configured for the {} agent",
                agent
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentPermissionScope> {
        self.scopes.values()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

pub fn default_scopes() -> Vec<AgentPermissionScope> {
    vec![
        AgentPermissionScope::new(AgentKind::Payment, [Action::Transfer], Amount::from_units(1_000))
            .with_per_transaction_limit(Amount::from_units(500)),
        AgentPermissionScope::new(AgentKind::Swap, [Action::Swap], Amount::from_units(1_000))
            .with_per_transaction_limit(Amount::from_units(500)),
        AgentPermissionScope::new(AgentKind::Bridge, [Action::Bridge], Amount::from_units(1_000))
            .with_per_transaction_limit(Amount::from_units(250))
            .with_allowed_chains(&["ethereum", "base", "arbitrum", "optimism", "polygon"]),
        AgentPermissionScope::new(AgentKind::Conversion, [Action::Convert], Amount::ZERO),
        AgentPermissionScope::new(AgentKind::Portfolio, [Action::Balance], Amount::ZERO),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_handlers::RequestContext;

    fn request() -> AgentRequest {
        AgentRequest::new("bridge", RequestContext::new("w", "u"))
    }

    #[test]
    fn defaults_cover_every_agent() {
        let table = PermissionScopeTable::with_defaults();
        for kind in AgentKind::ALL {
            let scope = table.require(kind).unwrap();
            assert!(scope.allows(kind.primary_action()));
        }
    }

    #[test]
    fn rejects_action_outside_allow_list() {
        let table = PermissionScopeTable::with_defaults();
        let scope = table.require(AgentKind::Payment).unwrap();
        let err = scope.check_request(&request(), Action::Swap).unwrap_err();
        assert!(matches!(err, DelegationError::PermissionDenied(_)));
    }

    #[test]
    fn enforces_chain_allow_list_case_insensitively() {
        let table = PermissionScopeTable::with_defaults();
        let scope = table.require(AgentKind::Bridge).unwrap();
        let ok = request().with_entity("toChain", "Base");
        assert!(scope.check_request(&ok, Action::Bridge).is_ok());
        let denied = request().with_entity("toChain", "solana");
        let err = scope.check_request(&denied, Action::Bridge).unwrap_err();
        assert!(err.to_string().contains("solana"));
    }

    #[test]
    fn per_transaction_limit_is_inclusive() {
        let scope = AgentPermissionScope::new(AgentKind::Payment, [Action::Transfer], Amount::ZERO)
            .with_per_transaction_limit(Amount::from_units(10));
        assert!(scope.check_per_transaction(Amount::from_units(10)).is_ok());
        let over = Amount::from_units(10).saturating_add(Amount::from_micros(1));
        assert!(matches!(
            scope.check_per_transaction(over),
            Err(DelegationError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn missing_scope_is_a_permission_denial() {
        let table = PermissionScopeTable::new();
        assert!(matches!(
            table.require(AgentKind::Swap),
            Err(DelegationError::PermissionDenied(_))
        ));
    }
}
