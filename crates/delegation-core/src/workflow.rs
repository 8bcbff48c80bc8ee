//! Multi-step plans driven through the router.
//!
//! Steps run strictly in declared order. A step whose condition is false is
//! recorded as skipped. A failed step is retried per its [`RetryPolicy`]
//! when the failure is retryable; once it gives up the remaining steps are
//! not run.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_handlers::{
    Action, AgentKind, AgentRequest, AgentResponse, ClassifiedIntent, Entities, RequestContext,
    ResponseError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{is_retryable_code, DelegationError};
use crate::router::AgentRouter;

/// Values produced by earlier steps, keyed by their `output_key`.
pub type WorkflowState = serde_json::Map<String, Value>;

/// Predicate over the accumulated state, for conditions that the built-in
/// comparisons cannot express.
#[derive(Clone)]
pub struct CustomPredicate(Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>);

impl CustomPredicate {
    pub fn new(predicate: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomPredicate(..)")
    }
}

/// `key` may use dots to reach into nested objects (`quote.converted`).
///
/// `Custom` predicates are code and have no serialized form. A step
/// carrying one serializes without its condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepCondition {
    Equals { key: String, value: Value },
    GreaterThan { key: String, value: f64 },
    LessThan { key: String, value: f64 },
    Exists { key: String },
    #[serde(skip)]
    Custom(CustomPredicate),
}

impl StepCondition {
    pub fn custom(predicate: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(CustomPredicate::new(predicate))
    }

    pub fn evaluate(&self, state: &WorkflowState) -> bool {
        match self {
            Self::Equals { key, value } => lookup(state, key).map_or(false, |found| found == value),
            Self::GreaterThan { key, value } => {
                lookup(state, key).and_then(as_number).map_or(false, |n| n > *value)
            }
            Self::LessThan { key, value } => {
                lookup(state, key).and_then(as_number).map_or(false, |n| n < *value)
            }
            Self::Exists { key } => lookup(state, key).map_or(false, |found| !found.is_null()),
            Self::Custom(predicate) => (predicate.0)(state),
        }
    }
}

fn lookup<'a>(state: &'a WorkflowState, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = state.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Numbers compare directly; numeric strings (amounts are strings) parse.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            delay_ms,
            backoff_multiplier,
        }
    }

    /// Wait before retry `n` (1-based): `delay_ms * multiplier^(n-1)`.
    pub fn delay_before_retry(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1) as i32;
        let millis = self.delay_ms as f64 * self.backoff_multiplier.max(0.0).powi(exponent);
        Duration::from_millis(millis.round().min(u64::MAX as f64) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub agent: AgentKind,
    pub action: Action,
    /// String values of the form `${key}` or `${key.field}` are replaced
    /// from the workflow state before dispatch.
    #[serde(default)]
    pub params: Entities,
    #[serde(default, skip_serializing_if = "lacks_serialized_condition")]
    pub condition: Option<StepCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

fn lacks_serialized_condition(condition: &Option<StepCondition>) -> bool {
    matches!(condition, None | Some(StepCondition::Custom(_)))
}

impl WorkflowStep {
    pub fn new(agent: AgentKind, action: Action) -> Self {
        Self {
            agent,
            action,
            params: Entities::new(),
            condition: None,
            retry_policy: None,
            output_key: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            steps,
        }
    }
}

/// One entry per operation, no conditions, no retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub agent: AgentKind,
    pub action: Action,
    #[serde(default)]
    pub params: Entities,
}

pub fn create_batch_workflow(
    name: impl Into<String>,
    operations: impl IntoIterator<Item = BatchOperation>,
) -> WorkflowDefinition {
    let steps = operations
        .into_iter()
        .map(|operation| WorkflowStep {
            params: operation.params,
            ..WorkflowStep::new(operation.agent, operation.action)
        })
        .collect();
    WorkflowDefinition::new(name, steps)
}

/// Who the workflow runs for, plus any seed state.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub context: RequestContext,
    pub session_id: Option<String>,
    pub initial_state: WorkflowState,
}

impl WorkflowContext {
    pub fn new(context: RequestContext) -> Self {
        Self {
            context,
            session_id: None,
            initial_state: WorkflowState::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.initial_state.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    pub agent: AgentKind,
    pub action: Action,
    pub status: StepStatus,
    pub attempts: u32,
    /// Last router response; absent for skipped steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AgentResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    pub steps: Vec<StepResult>,
    pub state: WorkflowState,
    pub completed_steps: usize,
    pub total_steps: usize,
    /// Index of the step that aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    router: Arc<AgentRouter>,
}

impl WorkflowEngine {
    pub fn new(router: Arc<AgentRouter>) -> Self {
        Self { router }
    }

    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> WorkflowResult {
        let started = Instant::now();
        let total_steps = definition.steps.len();
        let mut state = context.initial_state.clone();
        let mut steps = Vec::with_capacity(total_steps);
        let mut failed_step = None;

        info!(
            target: "delegation::workflow",
            workflow_id = %definition.id,
            name = %definition.name,
            total_steps,
            "workflow started"
        );

        for (index, step) in definition.steps.iter().enumerate() {
            if let Some(condition) = &step.condition {
                if !condition.evaluate(&state) {
                    debug!(
                        target: "delegation::workflow",
                        workflow_id = %definition.id,
                        step = index,
                        "condition false; step skipped"
                    );
                    steps.push(StepResult {
                        index,
                        agent: step.agent,
                        action: step.action,
                        status: StepStatus::Skipped,
                        attempts: 0,
                        response: None,
                        error: None,
                    });
                    continue;
                }
            }

            let request = build_request(step, &context, &state);
            let (outcome, attempts) = self.dispatch_with_retry(definition, index, step, request).await;

            match outcome {
                Ok(response) => {
                    if let Some(key) = &step.output_key {
                        let output = response
                            .data
                            .clone()
                            .unwrap_or_else(|| Value::String(response.message.clone()));
                        state.insert(key.clone(), output);
                    }
                    steps.push(StepResult {
                        index,
                        agent: step.agent,
                        action: step.action,
                        status: StepStatus::Completed,
                        attempts,
                        response: Some(response),
                        error: None,
                    });
                }
                Err(response) => {
                    let err = DelegationError::WorkflowStepFailed {
                        step: index,
                        attempts,
                        message: response.message.clone(),
                    };
                    warn!(
                        target: "delegation::workflow",
                        workflow_id = %definition.id,
                        step = index,
                        attempts,
                        cause = response.error_code().unwrap_or_default(),
                        error = %err,
                        "workflow aborted"
                    );
                    steps.push(StepResult {
                        index,
                        agent: step.agent,
                        action: step.action,
                        status: StepStatus::Failed,
                        attempts,
                        error: Some(ResponseError {
                            code: err.code().to_string(),
                            message: response.message.clone(),
                        }),
                        response: Some(response),
                    });
                    failed_step = Some(index);
                    break;
                }
            }
        }

        let completed_steps = steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            target: "delegation::workflow",
            workflow_id = %definition.id,
            completed_steps,
            total_steps,
            elapsed_ms,
            success = failed_step.is_none(),
            "workflow finished"
        );

        WorkflowResult {
            workflow_id: definition.id.clone(),
            success: failed_step.is_none(),
            steps,
            state,
            completed_steps,
            total_steps,
            failed_step,
            elapsed_ms,
        }
    }

    /// Routes the step until it succeeds, fails for a non-retryable reason,
    /// or runs out of retries. Returns the final response and attempt count.
    async fn dispatch_with_retry(
        &self,
        definition: &WorkflowDefinition,
        index: usize,
        step: &WorkflowStep,
        request: AgentRequest,
    ) -> (Result<AgentResponse, AgentResponse>, u32) {
        let policy = step.retry_policy.clone().unwrap_or_default();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let response = self.router.route(request.clone()).await;
            if response.success {
                return (Ok(response), attempts);
            }

            let retryable = response.error_code().map_or(false, is_retryable_code);
            let retries_used = attempts - 1;
            if !retryable || retries_used >= policy.max_retries {
                return (Err(response), attempts);
            }

            let delay = policy.delay_before_retry(attempts);
            warn!(
                target: "delegation::workflow",
                workflow_id = %definition.id,
                step = index,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %response.message,
                "step failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn build_request(step: &WorkflowStep, context: &WorkflowContext, state: &WorkflowState) -> AgentRequest {
    let mut request = AgentRequest::new(
        format!("{} {}", step.agent, step.action),
        context.context.clone(),
    )
    .with_classified_intent(ClassifiedIntent::for_agent(step.action.as_str(), step.agent));
    request.session_id = context.session_id.clone();
    for (key, value) in &step.params {
        request
            .entities
            .insert(key.clone(), resolve_template(value, state));
    }
    request
}

/// A string that is exactly `${path}` is replaced by the state value at
/// `path`; unresolved placeholders are left as written.
fn resolve_template(value: &Value, state: &WorkflowState) -> Value {
    match value {
        Value::String(text) => text
            .trim()
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .and_then(|path| lookup(state, path.trim()))
            .cloned()
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_template(item, state))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_template(item, state)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new();
        state.insert(
            "quote".to_string(),
            json!({ "converted": "92.00", "to": "EUR", "legs": [1, 2] }),
        );
        state.insert("approved".to_string(), json!(true));
        state
    }

    #[test]
    fn custom_conditions_are_dropped_when_serialized() {
        let workflow = WorkflowDefinition::new(
            "guarded",
            vec![
                WorkflowStep::new(AgentKind::Portfolio, Action::Balance)
                    .with_condition(StepCondition::custom(|state| state.is_empty())),
                WorkflowStep::new(AgentKind::Portfolio, Action::Balance).with_condition(
                    StepCondition::Exists {
                        key: "quote".into(),
                    },
                ),
            ],
        );
        let value = serde_json::to_value(&workflow).unwrap();
        assert!(value["steps"][0].get("condition").is_none());
        assert_eq!(value["steps"][1]["condition"]["type"], json!("exists"));

        let restored: WorkflowDefinition = serde_json::from_value(value).unwrap();
        assert!(restored.steps[0].condition.is_none());
        assert!(matches!(
            restored.steps[1].condition,
            Some(StepCondition::Exists { .. })
        ));
    }

    #[test]
    fn conditions_evaluate_against_nested_state() {
        let state = state();
        assert!(StepCondition::Equals {
            key: "quote.to".into(),
            value: json!("EUR"),
        }
        .evaluate(&state));
        assert!(StepCondition::GreaterThan {
            key: "quote.converted".into(),
            value: 90.0,
        }
        .evaluate(&state));
        assert!(!StepCondition::LessThan {
            key: "quote.converted".into(),
            value: 90.0,
        }
        .evaluate(&state));
        assert!(StepCondition::Exists {
            key: "quote.legs.1".into()
        }
        .evaluate(&state));
        assert!(!StepCondition::Exists {
            key: "missing".into()
        }
        .evaluate(&state));
        assert!(StepCondition::custom(|state| state.contains_key("approved")).evaluate(&state));
    }

    #[test]
    fn backoff_grows_geometrically() {
        let policy = RetryPolicy::new(3, 100, 2.0);
        assert_eq!(policy.delay_before_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn templates_resolve_from_state() {
        let state = state();
        assert_eq!(resolve_template(&json!("${quote.converted}"), &state), json!("92.00"));
        assert_eq!(resolve_template(&json!("${nope}"), &state), json!("${nope}"));
        assert_eq!(
            resolve_template(&json!({ "inner": "${approved}" }), &state),
            json!({ "inner": true })
        );
        assert_eq!(resolve_template(&json!("plain"), &state), json!("plain"));
    }

    #[test]
    fn batch_workflow_has_one_plain_step_per_operation() {
        let operations = vec![
            BatchOperation {
                agent: AgentKind::Payment,
                action: Action::Transfer,
                params: Entities::new(),
            },
            BatchOperation {
                agent: AgentKind::Portfolio,
                action: Action::Balance,
                params: Entities::new(),
            },
        ];
        let workflow = create_batch_workflow("payout", operations);
        assert_eq!(workflow.steps.len(), 2);
        assert!(workflow
            .steps
            .iter()
            .all(|step| step.condition.is_none() && step.retry_policy.is_none()));
        assert_eq!(workflow.steps[1].agent, AgentKind::Portfolio);
    }

    #[test]
    fn step_definitions_deserialize() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "agent": "conversion",
            "action": "convert",
            "params": { "amount": "10" },
            "condition": { "type": "greaterThan", "key": "balance", "value": 5.0 },
            "retryPolicy": { "maxRetries": 2, "delayMs": 50, "backoffMultiplier": 1.5 },
            "outputKey": "quote"
        }))
        .unwrap();
        assert_eq!(step.retry_policy.unwrap().max_retries, 2);
        assert!(matches!(
            step.condition,
            Some(StepCondition::GreaterThan { .. })
        ));
    }
}
