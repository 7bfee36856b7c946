use crate::command::Command;
use crate::context::{ContextEntry, ContextSummary};
use crate::state::WorldSnapshot;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;


/// Everything a provider gets to decide on
#[derive(Clone, Debug)]
pub struct DecisionRequest {
    pub cycle_id: Uuid,
    pub world: Arc<WorldSnapshot>,
    /// Decision context, chronological
    pub context: Vec<ContextEntry>,
    /// Newest MEDIUM+ entries of `context`
    pub relevant: Vec<ContextEntry>,
    /// `context` grouped by importance tier
    pub summary: ContextSummary,
    pub deadline: Duration,
}

/// Provider answer: proposed commands plus free-form reasoning
#[derive(Clone, Debug, Default)]
pub struct Decision {
    pub commands: Vec<Command>,
    pub diagnostic: String,
}

impl Decision {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            diagnostic: String::new(),
        }
    }
}

/// Why no decision came back
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// No answer within the deadline
    Timeout(Duration),
    /// Provider answered with an error or unusable output
    Failed(String),
    /// No provider is configured or reachable
    Unavailable,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Timeout(deadline) => {
                write!(f, "decision provider timed out after {:?}", deadline)
            }
            ProviderError::Failed(msg) => write!(f, "decision provider failed: {}", msg),
            ProviderError::Unavailable => write!(f, "decision provider unavailable"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Source of proposed dispatch commands.
///
/// Implementations are treated as untrusted and possibly slow: their output
/// always goes through the safety guard, and the dispatch loop enforces the
/// request deadline itself via [`decide_with_deadline`]. A provider that
/// answers with an empty command list is saying "no action needed"; that is
/// not a failure and does not trigger the fallback policy.
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use fleet_dispatch::provider::{Decision, DecisionProvider, DecisionRequest, ProviderError};
/// use fleet_dispatch::command::Command;
///
/// struct SendEveryoneHome;
///
/// #[async_trait]
/// impl DecisionProvider for SendEveryoneHome {
///     fn name(&self) -> &str {
///         "send-everyone-home"
///     }
///
///     async fn decide(&self, request: &DecisionRequest) -> Result<Decision, ProviderError> {
///         let commands = request
///             .world
///             .agvs()
///             .map(|(key, _)| Command::move_to(&key.line_id, &key.device_id, "P0"))
///             .collect();
///         Ok(Decision::new(commands))
///     }
/// }
/// ```
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Propose commands for the request's snapshot and context.
    ///
    /// # Returns
    /// * `Ok(decision)` - possibly empty list of proposed commands
    /// * `Err(ProviderError)` - no usable decision; the loop falls back
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, ProviderError>;
}

/// Call the provider, converting an overrun of `request.deadline` into
/// [`ProviderError::Timeout`]
pub async fn decide_with_deadline(
    provider: &dyn DecisionProvider,
    request: &DecisionRequest,
) -> Result<Decision, ProviderError> {
    match tokio::time::timeout(request.deadline, provider.decide(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(request.deadline)),
    }
}

/// Provider that never answers; every cycle runs on the fallback policy
#[derive(Debug, Default)]
pub struct NullProvider;

#[async_trait]
impl DecisionProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn decide(&self, _request: &DecisionRequest) -> Result<Decision, ProviderError> {
        Err(ProviderError::Unavailable)
    }
}

/// Canned provider behaviour for one cycle
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    Commands(Vec<Command>),
    Fail(String),
    /// Sleep before answering with no commands (exercises the deadline)
    Stall(Duration),
}

/// Provider that replays a queue of canned responses, one per call.
/// Answers with an empty decision once the queue runs dry.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DecisionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some(ScriptedResponse::Commands(commands)) => Ok(Decision {
                commands,
                diagnostic: "scripted".to_string(),
            }),
            Some(ScriptedResponse::Fail(msg)) => Err(ProviderError::Failed(msg)),
            Some(ScriptedResponse::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(Decision::default())
            }
            None => Ok(Decision::default()),
        }
    }
}
