//! Wires the components together from one [`DelegationConfig`].

use std::sync::Arc;

use agent_handlers::{AgentRequest, AgentResponse, HandlerServices, IntentClassifier};
use tracing::info;

use crate::audit::AuditLog;
use crate::budget::{BudgetLedger, LedgerHandle};
use crate::clock::{Clock, SystemClock};
use crate::config::DelegationConfig;
use crate::error::{DelegationError, DelegationResult};
use crate::router::AgentRouter;
use crate::scope::PermissionScopeTable;
use crate::session::SessionKeyManager;
use crate::store::{MemoryStore, StateStore};
use crate::vault::KeyVault;
use crate::workflow::{WorkflowContext, WorkflowDefinition, WorkflowEngine, WorkflowResult};

pub struct DelegationEngine {
    config: DelegationConfig,
    sessions: Arc<SessionKeyManager>,
    ledger: BudgetLedger,
    audit: Arc<AuditLog>,
    router: Arc<AgentRouter>,
    workflows: WorkflowEngine,
}

impl DelegationEngine {
    pub fn builder(services: HandlerServices) -> DelegationEngineBuilder {
        DelegationEngineBuilder::new(services)
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionKeyManager> {
        &self.sessions
    }

    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.handle()
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn router(&self) -> &Arc<AgentRouter> {
        &self.router
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub async fn route(&self, request: AgentRequest) -> AgentResponse {
        self.router.route(request).await
    }

    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> WorkflowResult {
        self.workflows.run_workflow(definition, context).await
    }

    pub async fn shutdown(self) -> DelegationResult<()> {
        self.ledger.shutdown().await?;
        info!(target: "delegation::engine", "engine stopped");
        Ok(())
    }
}

pub struct DelegationEngineBuilder {
    services: HandlerServices,
    config: DelegationConfig,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    vault: Option<Arc<dyn KeyVault>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
}

impl DelegationEngineBuilder {
    fn new(services: HandlerServices) -> Self {
        Self {
            services,
            config: DelegationConfig::default(),
            store: None,
            clock: None,
            vault: None,
            classifier: None,
        }
    }

    pub fn with_config(mut self, config: DelegationConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to an AES-GCM vault keyed from `vault.secret_env`.
    pub fn with_vault(mut self, vault: Arc<dyn KeyVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validates the configuration, spawns the budget ledger and restores
    /// audit indexes from the store. Needs a running tokio runtime.
    pub async fn build(self) -> DelegationResult<DelegationEngine> {
        let config = self.config;
        config
            .validate()
            .map_err(|err| DelegationError::InvalidRequest(err.to_string()))?;

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let vault: Arc<dyn KeyVault> = match self.vault {
            Some(vault) => vault,
            None => Arc::new(config.open_vault()?),
        };
        let scopes: Arc<PermissionScopeTable> = Arc::new(config.scope_table());

        let sessions = Arc::new(SessionKeyManager::new(
            store.clone(),
            vault,
            scopes.clone(),
            clock.clone(),
            config.session.clone(),
        ));
        let ledger = BudgetLedger::spawn(store.clone(), clock.clone());
        let audit = Arc::new(AuditLog::new(store, clock.clone(), config.audit.clone()));
        audit.restore().await?;

        let mut router = AgentRouter::builder(self.services)
            .with_scopes(scopes)
            .with_session_manager(sessions.clone())
            .with_ledger(ledger.handle())
            .with_audit_log(audit.clone())
            .with_clock(clock);
        if let Some(fallback) = config.router.fallback_agent {
            router = router.with_fallback(fallback);
        }
        if let Some(classifier) = self.classifier {
            router = router.with_classifier(classifier);
        }
        let router = Arc::new(router.build());
        let workflows = WorkflowEngine::new(router.clone());

        info!(
            target: "delegation::engine",
            agents = config.agents.len(),
            fallback = ?config.router.fallback_agent,
            "delegation engine ready"
        );
        Ok(DelegationEngine {
            config,
            sessions,
            ledger,
            audit,
            router,
            workflows,
        })
    }
}
