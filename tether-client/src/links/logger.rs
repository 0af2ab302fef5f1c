//! Pass-through link logging operation lifecycles via `tracing`.

use std::time::Instant;

use tracing::{debug, warn};

use tether_core::{ClientError, Observable, Observer, Operation, Teardown};

use crate::link::{Envelope, Link, NextLink};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerLink;

impl LoggerLink {
    pub fn new() -> Self {
        LoggerLink
    }
}

impl Link for LoggerLink {
    fn call(&self, op: Operation, next: NextLink) -> Observable<Envelope, ClientError> {
        Observable::new(move |sub| {
            let started = Instant::now();
            debug!(id = op.id, kind = %op.kind, path = %op.path, "operation started");

            let id = op.id;
            let fwd = sub.clone();
            let done = sub.clone();
            let inner = next(op.clone()).subscribe(
                Observer::new()
                    .on_next(move |envelope| {
                        debug!(
                            id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "operation result"
                        );
                        fwd.next(envelope);
                    })
                    .on_error(move |err: ClientError| {
                        warn!(
                            id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %err,
                            "operation failed"
                        );
                        sub.error(err);
                    })
                    .on_complete(move || done.complete()),
            );
            Ok(Box::new(move || inner.unsubscribe()) as Teardown)
        })
    }
}
