//! Action lifecycle states, priority classes and terminal outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ActionId;

/// Lifecycle state of an action.
///
/// `New` and `Running` are live; every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    New,
    Running,
    Success,
    Error,
    Incomplete,
    Aborted,
}

impl ActionState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::New | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Incomplete => "INCOMPLETE",
            Self::Aborted => "ABORTED",
        }
    }
}

/// Scheduling class used when the deferred queue is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Coalesced into one request with the rest of the foreground batch.
    #[default]
    Foreground,
    /// Foreground work that rides along with the next batch instead of
    /// forcing a send on its own.
    Caboose,
    /// Sent alone on its own connection slot.
    Background,
    /// Sent alone, and only once everything else has drained.
    Deferred,
}

/// Terminal result delivered to an action's callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Success(Value),
    AppError(String),
    Incomplete,
    Aborted,
}

impl ActionOutcome {
    pub fn state(&self) -> ActionState {
        match self {
            Self::Success(_) => ActionState::Success,
            Self::AppError(_) => ActionState::Error,
            Self::Incomplete => ActionState::Incomplete,
            Self::Aborted => ActionState::Aborted,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn return_value(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::AppError(message) => Some(message),
            _ => None,
        }
    }
}

/// One serialized action inside a request's `actions` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInvocation {
    pub id: ActionId,
    pub descriptor: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub storable: bool,
}
