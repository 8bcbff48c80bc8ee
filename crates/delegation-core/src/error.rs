use agent_handlers::AgentResponse;
use thiserror::Error;

use crate::store::StoreError;
use crate::vault::VaultError;

/// Convenient result alias for engine operations.
pub type DelegationResult<T> = std::result::Result<T, DelegationError>;

const RETRYABLE_CODES: [&str; 3] = ["AGENT_EXECUTION_FAILED", "LEDGER_OFFLINE", "STORE_ERROR"];

/// Retry classification for an error code carried in an [`AgentResponse`].
pub fn is_retryable_code(code: &str) -> bool {
    RETRYABLE_CODES.contains(&code)
}

/// Every way a gated agent operation can be refused or fail.
#[derive(Debug, Error)]
pub enum DelegationError {
    /// Action outside the agent's static allow-list or the session grant.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Per-transaction or daily cap would be exceeded.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("session key {0} has expired")]
    SessionExpired(String),
    #[error("session key {0} has been revoked")]
    SessionRevoked(String),
    #[error("renewal denied for session key {id}: {reason}")]
    RenewalDenied { id: String, reason: String },
    #[error("session key {0} not found")]
    SessionNotFound(String),
    #[error("sub-account {0} not found")]
    AccountNotFound(String),
    #[error("no agent can handle request: {0}")]
    AgentNotFound(String),
    /// Carries the handler's own message unchanged.
    #[error("{0}")]
    AgentExecutionFailed(String),
    #[error("workflow step {step} failed after {attempts} attempt(s): {message}")]
    WorkflowStepFailed {
        step: usize,
        attempts: u32,
        message: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("budget ledger is offline")]
    LedgerOffline,
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("key vault error: {0}")]
    Vault(#[from] VaultError),
}

impl DelegationError {
    /// Stable machine-readable code surfaced in responses and audit entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::SessionRevoked(_) => "SESSION_REVOKED",
            Self::RenewalDenied { .. } => "RENEWAL_DENIED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::AgentNotFound(_) => "AGENT_NOT_FOUND",
            Self::AgentExecutionFailed(_) => "AGENT_EXECUTION_FAILED",
            Self::WorkflowStepFailed { .. } => "WORKFLOW_STEP_FAILED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::LedgerOffline => "LEDGER_OFFLINE",
            Self::Store(_) => "STORE_ERROR",
            Self::Vault(_) => "VAULT_ERROR",
        }
    }

    /// Whether retrying the same request could succeed. Grant and budget
    /// rejections are final for the request that triggered them.
    pub fn is_retryable(&self) -> bool {
        is_retryable_code(self.code())
    }

    pub fn into_response(self, agent: impl Into<String>, action: Option<String>) -> AgentResponse {
        let code = self.code();
        AgentResponse::failed(agent, action, code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_failure_preserves_handler_message() {
        let err = DelegationError::AgentExecutionFailed("rpc timeout".to_string());
        let response = err.into_response("payment", Some("transfer".to_string()));
        assert_eq!(response.message, "rpc timeout");
        assert_eq!(response.error_code(), Some("AGENT_EXECUTION_FAILED"));
    }

    #[test]
    fn only_execution_failures_are_retryable() {
        assert!(DelegationError::AgentExecutionFailed("x".into()).is_retryable());
        assert!(!DelegationError::BudgetExceeded("x".into()).is_retryable());
        assert!(!DelegationError::PermissionDenied("x".into()).is_retryable());
    }
}
