//! `chorus-flow`: a small directed-graph pipeline runner.
//!
//! A [`Flow`] owns a set of named [`Node`]s, an immutable edge table and the
//! shared store. Each node returns a tagged `Result`; the runner matches it
//! against the node's edges (conditional first, then success, then error) to
//! pick the next node, until no edge matches.
//!
//! Nodes never take the process down: panics and timeouts are turned into the
//! pipeline's error type via [`Interrupted`] and fed to the node's error edge.

pub mod builder;
pub mod error;
pub mod flow;
pub mod node;

pub use builder::FlowBuilder;
pub use error::{BuildError, InterruptKind, Interrupted};
pub use flow::{Failure, Flow, FlowReport};
pub use node::{ErrorHandler, Node, Pipeline, DEFAULT_NODE_TIMEOUT};
