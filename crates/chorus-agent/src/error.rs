use std::time::Duration;

use thiserror::Error;

use chorus_flow::{InterruptKind, Interrupted};
use chorus_store::StoreError;

use crate::capability::CapabilityError;
use crate::nodes;

/// Failure of one pipeline stage.
///
/// Each variant is one entry of the error taxonomy and maps to its own
/// user-facing text through [`FlowError::user_message`]. The `Display`
/// output is for logs only and may carry internals.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("intent detection failed: {0}")]
    Intent(String),

    #[error("context assembly failed: {0}")]
    Context(String),

    #[error("routing failed: {0}")]
    Routing(String),

    #[error("function dispatch failed: {0}")]
    FunctionDispatch(String),

    #[error("model call timed out during {stage} after {}ms", .after.as_millis())]
    ModelTimeout { stage: &'static str, after: Duration },

    #[error("store error: {0}")]
    Store(String),
}

impl FlowError {
    /// Taxonomy tag, stable across releases.
    pub fn error_type(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "ValidationError",
            FlowError::Intent(_) => "IntentError",
            FlowError::Context(_) => "ContextError",
            FlowError::Routing(_) => "RoutingError",
            FlowError::FunctionDispatch(_) => "FunctionDispatchError",
            FlowError::ModelTimeout { .. } => "ModelTimeoutError",
            FlowError::Store(_) => "StoreError",
        }
    }

    /// Reply shown to the user. Never includes error details.
    pub fn user_message(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => {
                "I couldn't read that message. Send some text, up to 4000 characters."
            }
            FlowError::Intent(_) => "I couldn't work out what you meant. Could you rephrase that?",
            FlowError::Context(_) => {
                "I lost track of our conversation for a moment. Please try again."
            }
            FlowError::Routing(_) => "I wasn't sure how to answer that. Please try again.",
            FlowError::FunctionDispatch(_) => {
                "I couldn't reach the service I need for that right now."
            }
            FlowError::ModelTimeout { .. } => {
                "That took me too long to answer. Please try again in a moment."
            }
            FlowError::Store(_) => "Something went wrong saving our conversation. Please try again.",
        }
    }

    /// Error for a panic or step-limit abort inside `node`, typed by stage.
    fn for_stage(node: &'static str, detail: String) -> Self {
        match node {
            nodes::INTENT => FlowError::Intent(detail),
            nodes::CONTEXT | nodes::CONTEXT_INDIVIDUAL | nodes::CONTEXT_BLENDED => {
                FlowError::Context(detail)
            }
            nodes::ROUTER => FlowError::Routing(detail),
            nodes::EXECUTOR => FlowError::FunctionDispatch(detail),
            _ => FlowError::Store(detail),
        }
    }
}

impl From<Interrupted> for FlowError {
    fn from(interrupt: Interrupted) -> Self {
        match interrupt.kind {
            InterruptKind::TimedOut(after) => FlowError::ModelTimeout {
                stage: interrupt.node,
                after,
            },
            InterruptKind::Panicked(ref msg) => {
                FlowError::for_stage(interrupt.node, format!("panicked: {msg}"))
            }
            InterruptKind::StepLimit(steps) => {
                FlowError::for_stage(interrupt.node, format!("step limit {steps} reached"))
            }
        }
    }
}

impl From<StoreError> for FlowError {
    fn from(e: StoreError) -> Self {
        FlowError::Store(e.to_string())
    }
}

impl From<CapabilityError> for FlowError {
    fn from(e: CapabilityError) -> Self {
        FlowError::FunctionDispatch(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all() -> Vec<FlowError> {
        vec![
            FlowError::Validation("x".into()),
            FlowError::Intent("x".into()),
            FlowError::Context("x".into()),
            FlowError::Routing("x".into()),
            FlowError::FunctionDispatch("x".into()),
            FlowError::ModelTimeout {
                stage: "explanation",
                after: Duration::from_millis(10),
            },
            FlowError::Store("x".into()),
        ]
    }

    #[test]
    fn every_type_has_a_distinct_user_message() {
        let errors = all();
        let types: HashSet<_> = errors.iter().map(FlowError::error_type).collect();
        let messages: HashSet<_> = errors.iter().map(FlowError::user_message).collect();
        assert_eq!(types.len(), errors.len());
        assert_eq!(messages.len(), errors.len());
    }

    #[test]
    fn user_message_hides_details() {
        let e = FlowError::Store("database is locked at /var/lib/secret.db".into());
        assert!(!e.user_message().contains("secret"));
        assert!(e.to_string().contains("secret"));
    }

    #[test]
    fn interrupts_map_to_stage_errors() {
        let timeout = FlowError::from(Interrupted {
            node: nodes::EXECUTOR,
            kind: InterruptKind::TimedOut(Duration::from_secs(1)),
        });
        assert_eq!(timeout.error_type(), "ModelTimeoutError");

        let panic = FlowError::from(Interrupted {
            node: nodes::CONTEXT_BLENDED,
            kind: InterruptKind::Panicked("boom".into()),
        });
        assert_eq!(panic.error_type(), "ContextError");

        let limit = FlowError::from(Interrupted {
            node: nodes::ROUTER,
            kind: InterruptKind::StepLimit(32),
        });
        assert_eq!(limit.error_type(), "RoutingError");
    }
}
