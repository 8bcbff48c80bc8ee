//! Capability handlers and routing envelope shared by the delegation engine.
//! The crate defines the request/response types exchanged with the
//! conversational layer, the closed set of wallet agents the router can
//! dispatch to, and the collaborator traits (intent classifier, wallet
//! execution backend, rate provider) implemented by the host application.

pub mod amount;
pub mod collaborators;
pub mod envelope;
pub mod handlers;
pub mod kinds;

pub use amount::{Amount, AmountError, AMOUNT_DECIMALS};
pub use collaborators::{
    Authorization, ExecutionReceipt, ExecutionRequest, IntentClassifier, RateProvider,
    StaticRateTable, TokenBalance, WalletBackend,
};
pub use envelope::{
    AgentRequest, AgentResponse, ClassifiedIntent, Entities, RequestContext, ResponseError,
};
pub use handlers::{
    signing_payload, AgentHandler, HandlerInputError, HandlerOutcome, HandlerServices,
    HandlerSpec, IntentMatcher, Invocation,
};
pub use kinds::{Action, AgentKind};
