use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::amount::{Amount, AmountError};
use crate::kinds::AgentKind;

/// Extracted request entities, kept in the order the classifier produced them.
pub type Entities = IndexMap<String, Value>;

/// Identity of the caller a request is executed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub wallet_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
    /// Sub-account whose daily budget the request spends from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_account_id: Option<String>,
}

impl RequestContext {
    pub fn new(wallet_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            user_id: user_id.into(),
            user_token: None,
            sub_account_id: None,
        }
    }

    pub fn with_sub_account(mut self, sub_account_id: impl Into<String>) -> Self {
        self.sub_account_id = Some(sub_account_id.into());
        self
    }
}

/// Output of the upstream intent classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedIntent {
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl ClassifiedIntent {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            agent: None,
            confidence: None,
        }
    }

    pub fn for_agent(intent: impl Into<String>, agent: AgentKind) -> Self {
        Self {
            intent: intent.into(),
            agent: Some(agent),
            confidence: None,
        }
    }
}

/// Inbound routing envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub intent: String,
    #[serde(default)]
    pub entities: Entities,
    pub context: RequestContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_intent: Option<ClassifiedIntent>,
}

impl AgentRequest {
    pub fn new(intent: impl Into<String>, context: RequestContext) -> Self {
        Self {
            intent: intent.into(),
            entities: Entities::new(),
            context,
            session_id: None,
            classified_intent: None,
        }
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entities.insert(key.into(), value.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_classified_intent(mut self, intent: ClassifiedIntent) -> Self {
        self.classified_intent = Some(intent);
        self
    }

    /// Returns the first present string entity among `keys`.
    pub fn entity_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.entities.get(*key))
            .find_map(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// The `amount` entity, if the request carries one.
    pub fn amount(&self) -> Result<Option<Amount>, AmountError> {
        self.entities
            .get("amount")
            .filter(|value| !value.is_null())
            .map(Amount::from_json)
            .transpose()
    }
}

/// Error body attached to failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

/// Outbound routing envelope. Every router outcome, including rejections,
/// is expressed as one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    pub message: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl AgentResponse {
    pub fn succeeded(
        agent: impl Into<String>,
        action: Option<String>,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            success: true,
            message: message.into(),
            agent: agent.into(),
            action,
            requires_confirmation: None,
            data,
            error: None,
        }
    }

    pub fn failed(
        agent: impl Into<String>,
        action: Option<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            success: false,
            message: message.clone(),
            agent: agent.into(),
            action,
            requires_confirmation: None,
            data: None,
            error: Some(ResponseError {
                code: code.into(),
                message,
            }),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_camel_case_envelope() {
        let request: AgentRequest = serde_json::from_value(json!({
            "intent": "send 5 usdc to bob",
            "entities": { "amount": "5", "recipient": "0xb0b" },
            "context": { "walletId": "w1", "userId": "u1" },
            "sessionId": "sk-1",
            "classifiedIntent": { "intent": "transfer", "agent": "payment" }
        }))
        .unwrap();

        assert_eq!(request.session_id.as_deref(), Some("sk-1"));
        assert_eq!(request.entity_str(&["to", "recipient"]), Some("0xb0b"));
        assert_eq!(request.amount().unwrap(), Some(Amount::from_units(5)));
        assert_eq!(
            request.classified_intent.unwrap().agent,
            Some(AgentKind::Payment)
        );
    }

    #[test]
    fn failed_response_mirrors_message_into_error() {
        let response = AgentResponse::failed("router", None, "AGENT_NOT_FOUND", "no agent");
        assert!(!response.success);
        assert_eq!(response.error_code(), Some("AGENT_NOT_FOUND"));
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("requiresConfirmation").is_none());
    }
}
