//! Delegated authorization and budget enforcement for wallet agents.
//!
//! Every agent request passes the same gate before a handler runs:
//!
//! 1. the agent's static [`PermissionScopeTable`] entry must allow the action;
//! 2. a presented session key must be active, unexpired, issued for the
//!    wallet and grant the action ([`SessionKeyManager`]);
//! 3. the amount must fit the per-transaction cap, the session spending
//!    limit and, for sub-accounts, the daily limit ([`BudgetLedger`]).
//!
//! Spend is reserved atomically before the handler is invoked and returned
//! if the handler fails. The outcome of every gated request is appended to
//! the [`AuditLog`]. [`WorkflowEngine`] drives the router through ordered,
//! conditional steps with per-step retries.

pub mod audit;
pub mod budget;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod router;
pub mod scope;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod vault;
pub mod workflow;

pub use audit::{AuditLog, AuditLogEntry};
pub use budget::{BudgetDecision, BudgetLedger, LedgerHandle, SubAccount};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AuditSettings, ConfigError, DelegationConfig, RouterSettings, SessionSettings, VaultSettings,
};
pub use engine::{DelegationEngine, DelegationEngineBuilder};
pub use error::{is_retryable_code, DelegationError, DelegationResult};
pub use router::{AgentRouter, AgentRouterBuilder, ROUTER_AGENT};
pub use scope::{default_scopes, AgentPermissionScope, PermissionScopeTable};
pub use session::{SessionGrant, SessionKey, SessionKeyManager, SessionPermissions, SessionStatus};
pub use store::{JsonFileStore, MemoryStore, StateStore, StoreError, StoreResult};
pub use telemetry::init_tracing;
pub use vault::{AesGcmVault, KeyVault, VaultError};
pub use workflow::{
    create_batch_workflow, BatchOperation, CustomPredicate, RetryPolicy, StepCondition,
    StepResult, StepStatus, WorkflowContext, WorkflowDefinition, WorkflowEngine, WorkflowResult,
    WorkflowState, WorkflowStep,
};
