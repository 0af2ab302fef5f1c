//! Deduplicates concurrent identical queries onto one in-flight request.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use tether_core::{ClientError, Observable, Observer, Operation, OperationKind, Teardown};

use crate::link::{Envelope, Link, NextLink};

/// Pass-through link that keys in-flight queries by path plus input and
/// hands every concurrent subscriber the same shared observable. The cache
/// entry is evicted when the request terminates, so later calls start fresh.
/// Mutations and subscriptions are never deduplicated.
pub struct DedupeLink {
    inflight: Arc<DashMap<String, Observable<Envelope, ClientError>>>,
}

impl std::fmt::Debug for DedupeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeLink")
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl Default for DedupeLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupeLink {
    pub fn new() -> Self {
        DedupeLink {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl Link for DedupeLink {
    fn call(&self, op: Operation, next: NextLink) -> Observable<Envelope, ClientError> {
        if op.kind != OperationKind::Query {
            return next(op);
        }
        let key = format!("{}:{}", op.path, op.input);

        use dashmap::mapref::entry::Entry;
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                trace!(%key, "joining in-flight query");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let shared = evicting(next(op), self.inflight.clone(), key).share();
                entry.insert(shared.clone());
                shared
            }
        }
    }
}

/// Wraps `source` so the cache entry disappears on the terminal event.
fn evicting(
    source: Observable<Envelope, ClientError>,
    map: Arc<DashMap<String, Observable<Envelope, ClientError>>>,
    key: String,
) -> Observable<Envelope, ClientError> {
    Observable::new(move |sub| {
        let err_map = map.clone();
        let err_key = key.clone();
        let done_map = map.clone();
        let done_key = key.clone();
        let fwd = sub.clone();
        let err_sub = sub.clone();

        let inner = source.subscribe(
            Observer::new()
                .on_next(move |envelope| fwd.next(envelope))
                .on_error(move |e| {
                    err_map.remove(&err_key);
                    err_sub.error(e);
                })
                .on_complete(move || {
                    done_map.remove(&done_key);
                    sub.complete();
                }),
        );
        Ok(Box::new(move || inner.unsubscribe()) as Teardown)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tether_core::Subscriber;

    type Emitters = Arc<Mutex<Vec<Subscriber<Envelope, ClientError>>>>;

    /// Terminal whose emissions the test drives by hand.
    fn manual_next(calls: Arc<AtomicUsize>, emitters: Emitters) -> NextLink {
        Arc::new(move |_op| {
            let calls = calls.clone();
            let emitters = emitters.clone();
            Observable::new(move |sub| {
                calls.fetch_add(1, Ordering::SeqCst);
                emitters.lock().unwrap().push(sub);
                Ok(Box::new(|| {}) as Teardown)
            })
        })
    }

    fn query(id: u64) -> Operation {
        Operation::new(id, OperationKind::Query, "user.get", json!({"id": 1}))
    }

    #[test]
    fn concurrent_identical_queries_share_one_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let emitters: Emitters = Arc::new(Mutex::new(Vec::new()));
        let link = DedupeLink::new();
        let next = manual_next(calls.clone(), emitters.clone());

        let a_values = Arc::new(Mutex::new(Vec::new()));
        let b_values = Arc::new(Mutex::new(Vec::new()));
        let a2 = a_values.clone();
        let b2 = b_values.clone();

        let obs_a = link.call(query(1), next.clone());
        let obs_b = link.call(query(2), next);
        let _sa = obs_a.subscribe(Observer::new().on_next(move |e: Envelope| {
            a2.lock().unwrap().push(e);
        }));
        let _sb = obs_b.subscribe(Observer::new().on_next(move |e: Envelope| {
            b2.lock().unwrap().push(e);
        }));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let emitter = emitters.lock().unwrap()[0].clone();
        emitter.next(Envelope::data(json!("shared")));
        emitter.complete();

        assert_eq!(a_values.lock().unwrap().len(), 1);
        assert_eq!(b_values.lock().unwrap().len(), 1);
    }

    #[test]
    fn completed_query_is_evicted_and_refetched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let emitters: Emitters = Arc::new(Mutex::new(Vec::new()));
        let link = DedupeLink::new();
        let next = manual_next(calls.clone(), emitters.clone());

        let _first = link.call(query(1), next.clone()).subscribe(Observer::new());
        let emitter = emitters.lock().unwrap()[0].clone();
        emitter.complete();
        assert_eq!(link.inflight.len(), 0);

        let _second = link.call(query(2), next).subscribe(Observer::new());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn different_inputs_do_not_share() {
        let calls = Arc::new(AtomicUsize::new(0));
        let emitters: Emitters = Arc::new(Mutex::new(Vec::new()));
        let link = DedupeLink::new();
        let next = manual_next(calls.clone(), emitters.clone());

        let _a = link
            .call(
                Operation::new(1, OperationKind::Query, "user.get", json!({"id": 1})),
                next.clone(),
            )
            .subscribe(Observer::new());
        let _b = link
            .call(
                Operation::new(2, OperationKind::Query, "user.get", json!({"id": 2})),
                next,
            )
            .subscribe(Observer::new());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mutations_bypass_the_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let emitters: Emitters = Arc::new(Mutex::new(Vec::new()));
        let link = DedupeLink::new();
        let next = manual_next(calls.clone(), emitters.clone());

        for id in 0..2 {
            let op = Operation::new(id, OperationKind::Mutation, "user.create", json!({}));
            let _s = link.call(op, next.clone()).subscribe(Observer::new());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
