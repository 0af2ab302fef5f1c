//! Pass-through link that resubscribes the inner chain on error.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use tether_core::{ClientError, Observable, Observer, Operation, Subscriber, Subscription, Teardown};

use crate::link::{Envelope, Link, NextLink};

/// Retries failed operations by unsubscribing the failed attempt and
/// subscribing a fresh one. `max_attempts` counts total attempts, so 1
/// means no retry at all. Next events from a failed attempt are still
/// forwarded; only the terminal error triggers the resubscribe.
#[derive(Debug, Clone, Copy)]
pub struct RetryLink {
    pub max_attempts: usize,
}

impl RetryLink {
    pub fn new(max_attempts: usize) -> Self {
        RetryLink { max_attempts }
    }
}

struct RetryState {
    attempt: usize,
    inner: Option<Subscription>,
    done: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Link for RetryLink {
    fn call(&self, op: Operation, next: NextLink) -> Observable<Envelope, ClientError> {
        let max_attempts = self.max_attempts.max(1);
        Observable::new(move |sub| {
            let state = Arc::new(Mutex::new(RetryState {
                attempt: 0,
                inner: None,
                done: false,
            }));
            subscribe_attempt(&op, &next, &sub, &state, max_attempts);

            let teardown_state = state;
            Ok(Box::new(move || {
                let inner = {
                    let mut state = lock(&teardown_state);
                    state.done = true;
                    state.inner.take()
                };
                if let Some(inner) = inner {
                    inner.unsubscribe();
                }
            }) as Teardown)
        })
    }
}

fn subscribe_attempt(
    op: &Operation,
    next: &NextLink,
    sub: &Subscriber<Envelope, ClientError>,
    state: &Arc<Mutex<RetryState>>,
    max_attempts: usize,
) {
    let attempt = {
        let state = lock(state);
        if state.done {
            return;
        }
        state.attempt
    };

    let fwd_sub = sub.clone();
    let done_sub = sub.clone();
    let err_sub = sub.clone();
    let err_op = op.clone();
    let err_next = next.clone();
    let err_state = state.clone();

    let observer = Observer::new()
        .on_next(move |envelope| fwd_sub.next(envelope))
        .on_error(move |err: ClientError| {
            let retry = {
                let mut state = lock(&err_state);
                if state.done {
                    false
                } else if state.attempt + 1 < max_attempts {
                    state.attempt += 1;
                    state.inner = None;
                    true
                } else {
                    false
                }
            };
            if retry {
                debug!(id = err_op.id, path = %err_op.path, error = %err, "retrying operation");
                subscribe_attempt(&err_op, &err_next, &err_sub, &err_state, max_attempts);
            } else {
                err_sub.error(err);
            }
        })
        .on_complete(move || done_sub.complete());

    let subscription = next(op.clone()).subscribe(observer);

    // A synchronous error may already have advanced to a later attempt (or
    // torn the whole thing down); only record the handle if this attempt is
    // still the live one.
    let stale = {
        let mut state = lock(state);
        if !state.done && state.attempt == attempt {
            state.inner = Some(subscription.clone());
            false
        } else {
            true
        }
    };
    if stale {
        subscription.unsubscribe();
    }
}
