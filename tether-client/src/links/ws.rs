//! Terminal link delegating every operation kind to the persistent
//! WebSocket client.

use tokio_util::sync::CancellationToken;

use tether_core::{ClientError, CombinedTransformer, Observable, Observer, Operation, Teardown};

use crate::link::{Envelope, Link, NextLink};
use crate::ws::WsClient;

/// Terminal link over one shared [`WsClient`]. Unlike the HTTP links this
/// one carries subscriptions.
#[derive(Debug, Clone)]
pub struct WsLink {
    client: WsClient,
    transformer: CombinedTransformer,
}

impl WsLink {
    pub fn new(client: WsClient) -> Self {
        WsLink {
            client,
            transformer: CombinedTransformer::default(),
        }
    }

    pub fn with_transformer(client: WsClient, transformer: CombinedTransformer) -> Self {
        WsLink {
            client,
            transformer,
        }
    }
}

impl Link for WsLink {
    fn call(&self, op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
        let client = self.client.clone();
        let transformer = self.transformer.clone();
        Observable::new(move |sub| {
            let wire_op = op.with_input(transformer.serialize_input(op.input.clone()));

            let output = transformer.clone();
            let fwd = sub.clone();
            let failed = sub.clone();
            let done = sub.clone();
            let inner = client.request(&wire_op, None).subscribe(
                Observer::new()
                    .on_next(move |mut envelope: Envelope| {
                        if let Some(data) = envelope.result.data.take() {
                            envelope.result.data = Some(output.deserialize_output(data));
                        }
                        fwd.next(envelope);
                    })
                    .on_error(move |err| failed.error(err))
                    .on_complete(move || done.complete()),
            );

            // An aborted operation errors out; the teardown below then
            // unsubscribes, which sends the stop frame for subscriptions
            // already on the wire.
            let stop = CancellationToken::new();
            let watcher_stop = stop.clone();
            let signal = wire_op.signal.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => sub.error(ClientError::Cancelled),
                    _ = watcher_stop.cancelled() => {}
                }
            });

            Ok(Box::new(move || {
                stop.cancel();
                inner.unsubscribe();
            }) as Teardown)
        })
    }
}
