use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors detected while assembling a flow graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("flow {flow}: no entry node set")]
    MissingEntry { flow: &'static str },

    #[error("flow {flow}: node {node} registered twice")]
    DuplicateNode {
        flow: &'static str,
        node: &'static str,
    },

    #[error("flow {flow}: edge references unknown node {node}")]
    UnknownNode {
        flow: &'static str,
        node: &'static str,
    },
}

/// Why the runner cut a node short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptKind {
    /// The node exceeded its declared timeout.
    TimedOut(Duration),
    /// The node panicked; carries the panic message when it was a string.
    Panicked(String),
    /// The flow visited more nodes than its step limit allows.
    StepLimit(usize),
}

/// A failure the runner produced on a node's behalf.
///
/// Every pipeline error type implements `From<Interrupted>` so these land on
/// the same error edges as failures the node returned itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupted {
    pub node: &'static str,
    pub kind: InterruptKind,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InterruptKind::TimedOut(after) => {
                write!(f, "node {} timed out after {}ms", self.node, after.as_millis())
            }
            InterruptKind::Panicked(msg) => write!(f, "node {} panicked: {}", self.node, msg),
            InterruptKind::StepLimit(max) => {
                write!(f, "flow exceeded {} steps at node {}", max, self.node)
            }
        }
    }
}

impl std::error::Error for Interrupted {}
