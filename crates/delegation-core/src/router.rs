//! Request routing and the permission/budget gate in front of every handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use agent_handlers::{
    signing_payload, Action, AgentHandler, AgentKind, AgentRequest, AgentResponse, Amount,
    Authorization, HandlerOutcome, HandlerServices, IntentClassifier, Invocation,
};
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditLog, AuditLogEntry};
use crate::budget::LedgerHandle;
use crate::clock::{Clock, SystemClock};
use crate::error::{DelegationError, DelegationResult};
use crate::scope::PermissionScopeTable;
use crate::session::{SessionKey, SessionKeyManager};

/// Agent name reported when no handler could be selected.
pub const ROUTER_AGENT: &str = "router";

/// Spend reserved ahead of a handler call, returned if the call fails.
#[derive(Debug, Default)]
struct Reservation {
    session: Option<(String, Amount)>,
    account: Option<(String, Amount)>,
}

pub struct AgentRouter {
    handlers: Vec<AgentHandler>,
    fallback: Option<AgentKind>,
    scopes: Arc<PermissionScopeTable>,
    sessions: Option<Arc<SessionKeyManager>>,
    ledger: Option<LedgerHandle>,
    audit: Option<Arc<AuditLog>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    services: HandlerServices,
    clock: Arc<dyn Clock>,
}

impl AgentRouter {
    pub fn builder(services: HandlerServices) -> AgentRouterBuilder {
        AgentRouterBuilder::new(services)
    }

    /// Handlers in evaluation order.
    pub fn handlers(&self) -> &[AgentHandler] {
        &self.handlers
    }

    /// Routes `request` to one handler and reports the outcome. Every
    /// failure, including a panicking handler, becomes a failed response.
    #[instrument(
        name = "route",
        skip(self, request),
        fields(intent = %request.intent, wallet_id = %request.context.wallet_id)
    )]
    pub async fn route(&self, mut request: AgentRequest) -> AgentResponse {
        if request.classified_intent.is_none() {
            if let Some(classifier) = &self.classifier {
                match classifier.classify(&request.intent).await {
                    Ok(intent) => request.classified_intent = intent,
                    Err(err) => warn!(
                        target: "delegation::router",
                        error = %err,
                        "intent classification failed; falling back to keywords"
                    ),
                }
            }
        }

        let Some(handler) = self.select_handler(&request) else {
            let err = DelegationError::AgentNotFound(format!(
                "no agent matches intent '{}'",
                request.intent
            ));
            info!(target: "delegation::router", "no handler matched");
            return err.into_response(ROUTER_AGENT, None);
        };

        let kind = handler.kind();
        let action = handler.resolve_action(&request);
        debug!(
            target: "delegation::router",
            agent = %kind,
            action = %action,
            "handler selected"
        );

        let (result, amount) = self.dispatch(handler, &request, action).await;
        self.audit(&request, kind, action, amount, &result).await;

        match result {
            Ok(outcome) => {
                let mut response = AgentResponse::succeeded(
                    kind.as_str(),
                    Some(action.as_str().to_string()),
                    outcome.message,
                    outcome.data,
                );
                response.requires_confirmation = outcome.requires_confirmation;
                response
            }
            Err(err) => {
                info!(
                    target: "delegation::router",
                    agent = %kind,
                    action = %action,
                    code = err.code(),
                    error = %err,
                    "request refused"
                );
                err.into_response(kind.as_str(), Some(action.as_str().to_string()))
            }
        }
    }

    /// Classified-intent match first, then keywords, then the fallback.
    /// Within each pass the first handler in priority order wins.
    fn select_handler(&self, request: &AgentRequest) -> Option<&AgentHandler> {
        if let Some(intent) = &request.classified_intent {
            if let Some(handler) = self.handlers.iter().find(|h| h.matches_classified(intent)) {
                return Some(handler);
            }
        }
        if let Some(handler) = self.handlers.iter().find(|h| h.matches_text(&request.intent)) {
            return Some(handler);
        }
        let fallback = self.fallback?;
        self.handlers.iter().find(|h| h.kind() == fallback)
    }

    /// Runs the gate and the handler. Also returns the parsed amount so the
    /// audit entry can carry it.
    async fn dispatch(
        &self,
        handler: &AgentHandler,
        request: &AgentRequest,
        action: Action,
    ) -> (DelegationResult<HandlerOutcome>, Option<Amount>) {
        let kind = handler.kind();

        let session = match self.check_permissions(request, kind, action).await {
            Ok(session) => session,
            Err(err) => return (Err(err), None),
        };

        let amount = match handler.spend_amount(request, action) {
            Ok(amount) => amount,
            Err(err) => return (Err(DelegationError::InvalidRequest(err.to_string())), None),
        };

        let reservation = match self.reserve(request, kind, session.as_ref(), amount).await {
            Ok(reservation) => reservation,
            Err(err) => return (Err(err), amount),
        };

        let authorization = match self.authorize(request, kind, action, session.as_ref()).await {
            Ok(authorization) => authorization,
            Err(err) => {
                self.release(reservation).await;
                return (Err(err), amount);
            }
        };

        let invocation = Invocation {
            request,
            action,
            authorization,
        };
        let outcome = AssertUnwindSafe(handler.execute(invocation, &self.services))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(DelegationError::AgentExecutionFailed(err.to_string())),
            Err(panic) => Err(DelegationError::AgentExecutionFailed(panic_message(
                panic.as_ref(),
            ))),
        };
        if result.is_err() {
            self.release(reservation).await;
        }
        (result, amount)
    }

    /// Action must be in the agent's static allow-list and, when a session
    /// key is presented, in the key's grant.
    async fn check_permissions(
        &self,
        request: &AgentRequest,
        kind: AgentKind,
        action: Action,
    ) -> DelegationResult<Option<SessionKey>> {
        self.scopes.require(kind)?.check_request(request, action)?;

        let Some(session_id) = request.session_id.as_deref() else {
            return Ok(None);
        };
        let sessions = self.sessions.as_ref().ok_or_else(|| {
            DelegationError::PermissionDenied(
                "session keys are not accepted by this router".to_string(),
            )
        })?;
        let key = sessions
            .authorize(session_id, &request.context.wallet_id, kind, action)
            .await?;
        Ok(Some(key))
    }

    async fn reserve(
        &self,
        request: &AgentRequest,
        kind: AgentKind,
        session: Option<&SessionKey>,
        amount: Option<Amount>,
    ) -> DelegationResult<Reservation> {
        let mut reservation = Reservation::default();
        let Some(amount) = amount else {
            return Ok(reservation);
        };

        self.scopes.require(kind)?.check_per_transaction(amount)?;

        if let (Some(key), Some(sessions)) = (session, &self.sessions) {
            sessions.charge(&key.id, amount).await?;
            reservation.session = Some((key.id.clone(), amount));
        }

        if let Some(account_id) = request.context.sub_account_id.as_deref() {
            let spent = match &self.ledger {
                Some(ledger) => ledger
                    .try_spend(account_id, amount)
                    .await
                    .and_then(|decision| decision.into_result()),
                None => Err(DelegationError::InvalidRequest(
                    "sub-account budgets are not enabled on this router".to_string(),
                )),
            };
            if let Err(err) = spent {
                self.release(reservation).await;
                return Err(err);
            }
            reservation.account = Some((account_id.to_string(), amount));
        }

        Ok(reservation)
    }

    async fn authorize(
        &self,
        request: &AgentRequest,
        kind: AgentKind,
        action: Action,
        session: Option<&SessionKey>,
    ) -> DelegationResult<Option<Authorization>> {
        match (session, &self.sessions) {
            (Some(key), Some(sessions)) => {
                let payload = signing_payload(request, kind, action);
                Ok(Some(sessions.sign(&key.id, &payload).await?))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, reservation: Reservation) {
        if let (Some((id, amount)), Some(sessions)) = (reservation.session, &self.sessions) {
            if let Err(err) = sessions.release(&id, amount).await {
                warn!(
                    target: "delegation::router",
                    session_key_id = %id,
                    amount = %amount,
                    error = %err,
                    "failed to release session reservation"
                );
            }
        }
        if let (Some((id, amount)), Some(ledger)) = (reservation.account, &self.ledger) {
            if let Err(err) = ledger.release(&id, amount).await {
                warn!(
                    target: "delegation::router",
                    account_id = %id,
                    amount = %amount,
                    error = %err,
                    "failed to release sub-account reservation"
                );
            }
        }
    }

    async fn audit(
        &self,
        request: &AgentRequest,
        kind: AgentKind,
        action: Action,
        amount: Option<Amount>,
        result: &DelegationResult<HandlerOutcome>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut entry = AuditLogEntry::new(
            self.clock.now(),
            &request.context.wallet_id,
            &request.context.user_id,
            action.as_str(),
        )
        .with_session(request.session_id.clone())
        .with_agent(kind, action)
        .with_amount(amount);
        if let Err(err) = result {
            entry = entry.failed(format!("{}: {}", err.code(), err));
        }
        audit.record(entry).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "agent handler panicked".to_string()
    }
}

pub struct AgentRouterBuilder {
    services: HandlerServices,
    handlers: Vec<AgentHandler>,
    fallback: Option<AgentKind>,
    scopes: Arc<PermissionScopeTable>,
    sessions: Option<Arc<SessionKeyManager>>,
    ledger: Option<LedgerHandle>,
    audit: Option<Arc<AuditLog>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    clock: Arc<dyn Clock>,
}

impl AgentRouterBuilder {
    fn new(services: HandlerServices) -> Self {
        Self {
            services,
            handlers: Vec::new(),
            fallback: None,
            scopes: Arc::new(PermissionScopeTable::with_defaults()),
            sessions: None,
            ledger: None,
            audit: None,
            classifier: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_scopes(mut self, scopes: Arc<PermissionScopeTable>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Adds a handler. Without any registered handlers the router uses the
    /// five built-in agents.
    pub fn register_handler(mut self, handler: AgentHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_fallback(mut self, agent: AgentKind) -> Self {
        self.fallback = Some(agent);
        self
    }

    pub fn with_session_manager(mut self, sessions: Arc<SessionKeyManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerHandle) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> AgentRouter {
        let mut handlers = if self.handlers.is_empty() {
            AgentHandler::defaults()
        } else {
            self.handlers
        };
        // Stable: equal priorities keep registration order.
        handlers.sort_by_key(|handler| std::cmp::Reverse(handler.priority()));

        AgentRouter {
            handlers,
            fallback: self.fallback,
            scopes: self.scopes,
            sessions: self.sessions,
            ledger: self.ledger,
            audit: self.audit,
            classifier: self.classifier,
            services: self.services,
            clock: self.clock,
        }
    }
}
