//! The middleware contract: operations flow down a chain of links, result
//! envelopes flow back up as observable events.

use std::sync::Arc;

use serde_json::Value;

use tether_core::{ClientError, Observable, Operation, ResultEnvelope};

/// One result flowing back up the chain: the wire envelope plus whatever
/// side-channel context the terminal link attached (HTTP status etc.).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub result: ResultEnvelope,
    pub context: Option<Value>,
}

impl Envelope {
    pub fn new(result: ResultEnvelope) -> Self {
        Envelope {
            result,
            context: None,
        }
    }

    pub fn data(data: Value) -> Self {
        Envelope::new(ResultEnvelope::data(data))
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Invokes the remainder of the chain for a (possibly derived) operation.
pub type NextLink = Arc<dyn Fn(Operation) -> Observable<Envelope, ClientError> + Send + Sync>;

/// One stage of the pipeline.
///
/// A link either transforms the operation and delegates to `next`, or is
/// terminal and performs I/O itself, never touching `next`.
pub trait Link: Send + Sync {
    fn call(&self, op: Operation, next: NextLink) -> Observable<Envelope, ClientError>;
}

/// An ordered set of links wired together once and executed per operation.
#[derive(Clone)]
pub struct LinkChain {
    links: Arc<Vec<Arc<dyn Link>>>,
}

impl std::fmt::Debug for LinkChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkChain")
            .field("len", &self.links.len())
            .finish()
    }
}

impl LinkChain {
    pub fn new(links: Vec<Arc<dyn Link>>) -> Self {
        LinkChain {
            links: Arc::new(links),
        }
    }

    /// Runs `op` through the chain from the first link.
    pub fn execute(&self, op: Operation) -> Observable<Envelope, ClientError> {
        execute_from(self.links.clone(), 0, op)
    }
}

fn execute_from(
    links: Arc<Vec<Arc<dyn Link>>>,
    index: usize,
    op: Operation,
) -> Observable<Envelope, ClientError> {
    match links.get(index) {
        Some(link) => {
            let next_links = links.clone();
            let next: NextLink =
                Arc::new(move |op| execute_from(next_links.clone(), index + 1, op));
            link.call(op, next)
        }
        // Falling off the end means the chain was assembled without a
        // terminating link. That is a configuration bug, not a transient
        // failure.
        None => Observable::throw(ClientError::config(
            "link chain has no terminating link",
        )),
    }
}
