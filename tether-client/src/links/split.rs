//! Routes operations to pre-built sub-chains by a predicate key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tether_core::{ClientError, Observable, Operation};

use crate::link::{Envelope, Link, LinkChain, NextLink};

/// Dispatch-table link: the predicate computes a key per operation and the
/// matching sub-chain handles it. Routes are wired once at construction;
/// a key without a route is a configuration error event.
pub struct SplitLink<K> {
    predicate: Arc<dyn Fn(&Operation) -> K + Send + Sync>,
    routes: HashMap<K, LinkChain>,
}

impl<K> std::fmt::Debug for SplitLink<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitLink")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl<K> SplitLink<K>
where
    K: Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(
        predicate: impl Fn(&Operation) -> K + Send + Sync + 'static,
        routes: impl IntoIterator<Item = (K, Vec<Arc<dyn Link>>)>,
    ) -> Self {
        SplitLink {
            predicate: Arc::new(predicate),
            routes: routes
                .into_iter()
                .map(|(key, links)| (key, LinkChain::new(links)))
                .collect(),
        }
    }
}

impl<K> Link for SplitLink<K>
where
    K: Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    fn call(&self, op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
        let key = (self.predicate)(&op);
        match self.routes.get(&key) {
            Some(chain) => chain.execute(op),
            None => Observable::throw(ClientError::config(format!(
                "no route for split key {key:?}"
            ))),
        }
    }
}

/// Convenience for the common boolean split.
impl SplitLink<bool> {
    pub fn when(
        predicate: impl Fn(&Operation) -> bool + Send + Sync + 'static,
        matched: Vec<Arc<dyn Link>>,
        otherwise: Vec<Arc<dyn Link>>,
    ) -> Self {
        SplitLink::new(predicate, [(true, matched), (false, otherwise)])
    }
}
