use std::time::Duration;

use async_trait::async_trait;

use crate::error::Interrupted;

/// Timeout applied to nodes that do not declare their own.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Binds together the types one family of nodes operates on.
pub trait Pipeline: Send + Sync + 'static {
    /// Shared state every node can read and mutate.
    type Store: Send + Sync + 'static;
    /// Per-run data threaded through the nodes.
    type Data: Send + 'static;
    /// Failure type; runner-produced interrupts convert into it.
    type Error: From<Interrupted> + std::fmt::Display + Send + 'static;
}

/// One step of a flow.
#[async_trait]
pub trait Node<P: Pipeline>: Send + Sync {
    /// Unique name inside a flow; edges refer to nodes by it.
    fn name(&self) -> &'static str;

    /// Wall-clock budget for one `run`. Exceeding it is a failure.
    fn timeout(&self) -> Duration {
        DEFAULT_NODE_TIMEOUT
    }

    async fn run(&self, store: &P::Store, data: &mut P::Data) -> Result<(), P::Error>;
}

/// Terminal handler for a failed node.
///
/// Runs synchronously and must not fail: it turns the error into something
/// the caller can show (typically by writing a reply into `data`).
pub trait ErrorHandler<P: Pipeline>: Send + Sync {
    fn handle(&self, node: &'static str, error: &P::Error, data: &mut P::Data);
}

impl<P, F> ErrorHandler<P> for F
where
    P: Pipeline,
    F: Fn(&'static str, &P::Error, &mut P::Data) + Send + Sync,
{
    fn handle(&self, node: &'static str, error: &P::Error, data: &mut P::Data) {
        self(node, error, data)
    }
}
