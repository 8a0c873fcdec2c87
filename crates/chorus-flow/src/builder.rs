use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BuildError;
use crate::flow::{Edges, Flow};
use crate::node::{ErrorHandler, Node, Pipeline};

const DEFAULT_MAX_STEPS: usize = 32;

/// Declarative construction of a [`Flow`].
///
/// Edges are collected here and frozen by [`FlowBuilder::build`], which also
/// checks that every name an edge mentions belongs to a registered node.
pub struct FlowBuilder<P: Pipeline> {
    name: &'static str,
    entry: Option<&'static str>,
    nodes: Vec<Arc<dyn Node<P>>>,
    edges: HashMap<&'static str, Edges<P>>,
    targets: Vec<&'static str>,
    default_error: Option<Arc<dyn ErrorHandler<P>>>,
    max_steps: usize,
}

impl<P: Pipeline> FlowBuilder<P> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entry: None,
            nodes: Vec::new(),
            edges: HashMap::new(),
            targets: Vec::new(),
            default_error: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Register a node and make it the entry point.
    pub fn entry(mut self, node: Arc<dyn Node<P>>) -> Self {
        self.entry = Some(node.name());
        self.nodes.push(node);
        self
    }

    pub fn node(mut self, node: Arc<dyn Node<P>>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Follow `from → to` when `from` succeeds and no condition matched.
    pub fn on_success(mut self, from: &'static str, to: &'static str) -> Self {
        self.edges.entry(from).or_default().success = Some(to);
        self.targets.extend([from, to]);
        self
    }

    /// Follow `from → to` when `from` succeeds and `predicate` holds.
    /// Conditions are checked in the order they were added.
    pub fn on_condition<F>(mut self, from: &'static str, predicate: F, to: &'static str) -> Self
    where
        F: Fn(&P::Data) -> bool + Send + Sync + 'static,
    {
        self.edges
            .entry(from)
            .or_default()
            .conditions
            .push((Box::new(predicate), to));
        self.targets.extend([from, to]);
        self
    }

    /// Handle failures of `from` with `handler`.
    pub fn on_error<H>(mut self, from: &'static str, handler: H) -> Self
    where
        H: ErrorHandler<P> + 'static,
    {
        self.edges.entry(from).or_default().error = Some(Arc::new(handler));
        self.targets.push(from);
        self
    }

    /// Handler for failing nodes that have no error edge of their own.
    pub fn on_any_error<H>(mut self, handler: H) -> Self
    where
        H: ErrorHandler<P> + 'static,
    {
        self.default_error = Some(Arc::new(handler));
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn build(self, store: Arc<P::Store>) -> Result<Flow<P>, BuildError> {
        let entry = self.entry.ok_or(BuildError::MissingEntry { flow: self.name })?;

        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            let name = node.name();
            if nodes.insert(name, node).is_some() {
                return Err(BuildError::DuplicateNode {
                    flow: self.name,
                    node: name,
                });
            }
        }

        if let Some(unknown) = self.targets.iter().find(|t| !nodes.contains_key(*t)) {
            return Err(BuildError::UnknownNode {
                flow: self.name,
                node: *unknown,
            });
        }

        Ok(Flow {
            name: self.name,
            entry,
            nodes,
            edges: self.edges,
            default_error: self.default_error,
            store,
            max_steps: self.max_steps,
        })
    }
}
