use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::error::{InterruptKind, Interrupted};
use crate::node::{ErrorHandler, Node, Pipeline};

pub(crate) type Predicate<P> = Box<dyn Fn(&<P as Pipeline>::Data) -> bool + Send + Sync>;

/// Outgoing edges of a single node, evaluated in declaration order.
pub(crate) struct Edges<P: Pipeline> {
    pub(crate) conditions: Vec<(Predicate<P>, &'static str)>,
    pub(crate) success: Option<&'static str>,
    pub(crate) error: Option<Arc<dyn ErrorHandler<P>>>,
}

impl<P: Pipeline> Default for Edges<P> {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            success: None,
            error: None,
        }
    }
}

impl<P: Pipeline> Edges<P> {
    fn next_after_success(&self, data: &P::Data) -> Option<&'static str> {
        self.conditions
            .iter()
            .find(|(pred, _)| pred(data))
            .map(|(_, next)| *next)
            .or(self.success)
    }
}

/// The node that failed and what it failed with.
pub struct Failure<E> {
    pub node: &'static str,
    pub error: E,
    /// Whether an error handler ran for this failure.
    pub handled: bool,
}

/// Result of one flow run. A run never fails past this boundary.
pub struct FlowReport<P: Pipeline> {
    pub data: P::Data,
    pub failure: Option<Failure<P::Error>>,
    /// Node names in visiting order.
    pub path: Vec<&'static str>,
}

impl<P: Pipeline> FlowReport<P> {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// An immutable, runnable node graph bound to a shared store.
pub struct Flow<P: Pipeline> {
    pub(crate) name: &'static str,
    pub(crate) entry: &'static str,
    pub(crate) nodes: HashMap<&'static str, Arc<dyn Node<P>>>,
    pub(crate) edges: HashMap<&'static str, Edges<P>>,
    pub(crate) default_error: Option<Arc<dyn ErrorHandler<P>>>,
    pub(crate) store: Arc<P::Store>,
    pub(crate) max_steps: usize,
}

impl<P: Pipeline> Flow<P> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn store(&self) -> &Arc<P::Store> {
        &self.store
    }

    /// Run `data` from the entry node until no edge matches.
    pub async fn run(&self, mut data: P::Data) -> FlowReport<P> {
        let started = Instant::now();
        let mut path = Vec::new();
        let mut current = self.entry;

        for _ in 0..self.max_steps {
            path.push(current);
            let Some(node) = self.nodes.get(current) else {
                // Unreachable for flows built through FlowBuilder.
                let error = P::Error::from(Interrupted {
                    node: current,
                    kind: InterruptKind::Panicked("node missing from graph".to_string()),
                });
                return self.fail(current, error, data, path);
            };

            let edges = self.edges.get(current);
            match self.execute(node.as_ref(), &mut data).await {
                Ok(()) => match edges.and_then(|e| e.next_after_success(&data)) {
                    Some(next) => {
                        debug!(flow = self.name, from = current, to = next, "flow edge");
                        current = next;
                    }
                    None => {
                        debug!(
                            flow = self.name,
                            steps = path.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "flow completed"
                        );
                        return FlowReport {
                            data,
                            failure: None,
                            path,
                        };
                    }
                },
                Err(error) => return self.fail(current, error, data, path),
            }
        }

        // `current` never ran; blame the last node that did
        let last = path.last().copied().unwrap_or(current);
        let error = P::Error::from(Interrupted {
            node: last,
            kind: InterruptKind::StepLimit(self.max_steps),
        });
        self.fail(last, error, data, path)
    }

    fn fail(
        &self,
        node: &'static str,
        error: P::Error,
        mut data: P::Data,
        path: Vec<&'static str>,
    ) -> FlowReport<P> {
        warn!(flow = self.name, node, error = %error, "flow node failed");
        let handler = self
            .edges
            .get(node)
            .and_then(|e| e.error.as_ref())
            .or(self.default_error.as_ref());
        let handled = match handler {
            Some(h) => {
                h.handle(node, &error, &mut data);
                true
            }
            None => false,
        };
        FlowReport {
            data,
            failure: Some(Failure {
                node,
                error,
                handled,
            }),
            path,
        }
    }

    /// Run one node under its timeout, converting panics into failures.
    async fn execute(&self, node: &dyn Node<P>, data: &mut P::Data) -> Result<(), P::Error> {
        let limit = node.timeout();
        let guarded = AssertUnwindSafe(node.run(&self.store, data)).catch_unwind();
        match tokio::time::timeout(limit, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(P::Error::from(Interrupted {
                node: node.name(),
                kind: InterruptKind::Panicked(panic_message(panic.as_ref())),
            })),
            Err(_) => Err(P::Error::from(Interrupted {
                node: node.name(),
                kind: InterruptKind::TimedOut(limit),
            })),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
