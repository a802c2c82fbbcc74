//! Error types for the relay action pipeline.

use thiserror::Error;

use crate::action::ActionState;
use crate::ids::ActionId;

/// Errors raised by the action service and its ports.
///
/// Transport and storage failures are recoverable and turn into action
/// outcomes. The remaining variants are local programming errors: they abort
/// the current operation and are logged at the processing loop boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ActionState, to: ActionState },
    #[error("action already registered in connection slot")]
    DuplicateAction,
    #[error("no action definition for descriptor: {0}")]
    MissingDefinition(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("join mismatch: {0}")]
    JoinMismatch(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("action {action_id}: {source}")]
    Action {
        action_id: ActionId,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Attach the offending action for diagnostics.
    pub fn for_action(self, action_id: &ActionId) -> Self {
        match self {
            already @ Self::Action { .. } => already,
            other => Self::Action {
                action_id: action_id.clone(),
                source: Box::new(other),
            },
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
