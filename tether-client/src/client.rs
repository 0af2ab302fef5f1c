//! Path-parameterized client facade.
//!
//! Procedures are addressed by dot-separated path strings; each call builds
//! an operation and runs it through the configured link chain.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tether_core::{
    first_value, ClientError, Observable, Operation, OperationContext, OperationKind,
    RequestIdAllocator,
};

use crate::link::{Envelope, Link, LinkChain};

/// Per-call knobs. Everything defaults to off.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cancels the call (and its network work) when triggered.
    pub signal: Option<CancellationToken>,
    /// Pre-populated side channel visible to every link.
    pub context: Option<OperationContext>,
}

/// The client: a request-id allocator plus a link chain.
///
/// Cheap to clone; clones share the allocator so ids stay unique across
/// handles.
#[derive(Debug, Clone)]
pub struct Client {
    chain: LinkChain,
    ids: Arc<RequestIdAllocator>,
}

impl Client {
    /// Builds a client from an ordered list of links. The last link must be
    /// terminal (HTTP, batched HTTP, or WebSocket).
    pub fn new(links: Vec<Arc<dyn Link>>) -> Self {
        Client {
            chain: LinkChain::new(links),
            ids: Arc::new(RequestIdAllocator::new()),
        }
    }

    fn operation(
        &self,
        kind: OperationKind,
        path: impl Into<String>,
        input: Value,
        opts: CallOptions,
    ) -> Operation {
        let mut op = Operation::new(self.ids.allocate(), kind, path, input);
        if let Some(signal) = opts.signal {
            op.signal = signal;
        }
        if let Some(context) = opts.context {
            op.context = context;
        }
        op
    }

    async fn first(&self, op: Operation) -> Result<Value, ClientError> {
        let observable = self.chain.execute(op);
        match first_value(&observable).await {
            Some(Ok(envelope)) => Ok(envelope.result.data.unwrap_or(Value::Null)),
            Some(Err(err)) => Err(err),
            // Completed without ever producing a value.
            None => Err(ClientError::ClosedPrematurely),
        }
    }

    /// Runs a query and resolves with its first result.
    pub async fn query(&self, path: impl Into<String>, input: Value) -> Result<Value, ClientError> {
        self.query_with(path, input, CallOptions::default()).await
    }

    pub async fn query_with(
        &self,
        path: impl Into<String>,
        input: Value,
        opts: CallOptions,
    ) -> Result<Value, ClientError> {
        let op = self.operation(OperationKind::Query, path, input, opts);
        self.first(op).await
    }

    /// Runs a mutation and resolves with its first result.
    pub async fn mutation(
        &self,
        path: impl Into<String>,
        input: Value,
    ) -> Result<Value, ClientError> {
        self.mutation_with(path, input, CallOptions::default())
            .await
    }

    pub async fn mutation_with(
        &self,
        path: impl Into<String>,
        input: Value,
        opts: CallOptions,
    ) -> Result<Value, ClientError> {
        let op = self.operation(OperationKind::Mutation, path, input, opts);
        self.first(op).await
    }

    /// Starts a subscription. Events arrive on the returned observable;
    /// unsubscribing stops the server-side subscription.
    pub fn subscription(
        &self,
        path: impl Into<String>,
        input: Value,
    ) -> Observable<Envelope, ClientError> {
        self.subscription_with(path, input, CallOptions::default())
    }

    pub fn subscription_with(
        &self,
        path: impl Into<String>,
        input: Value,
        opts: CallOptions,
    ) -> Observable<Envelope, ClientError> {
        let op = self.operation(OperationKind::Subscription, path, input, opts);
        self.chain.execute(op)
    }

    /// Escape hatch: run a pre-built operation through the chain.
    pub fn execute(&self, op: Operation) -> Observable<Envelope, ClientError> {
        self.chain.execute(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tether_core::{ErrorCode, ErrorShape, Observer};

    use crate::link::NextLink;

    struct EchoLink {
        seen: Arc<Mutex<Vec<Operation>>>,
    }

    impl Link for EchoLink {
        fn call(&self, op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
            self.seen.lock().unwrap().push(op.clone());
            Observable::of(Envelope::data(json!({
                "kind": op.kind.to_string(),
                "path": op.path,
                "input": op.input,
            })))
        }
    }

    fn echo_client() -> (Client, Arc<Mutex<Vec<Operation>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let client = Client::new(vec![Arc::new(EchoLink { seen: seen.clone() })]);
        (client, seen)
    }

    #[tokio::test]
    async fn query_resolves_with_the_first_result() {
        let (client, seen) = echo_client();
        let data = client.query("user.get", json!({"id": 7})).await.unwrap();
        assert_eq!(
            data,
            json!({"kind": "query", "path": "user.get", "input": {"id": 7}})
        );
        assert_eq!(seen.lock().unwrap()[0].id, 1);
    }

    #[tokio::test]
    async fn mutation_uses_the_mutation_kind_and_fresh_ids() {
        let (client, seen) = echo_client();
        client.query("a", json!(null)).await.unwrap();
        client.mutation("b", json!(1)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].kind, OperationKind::Mutation);
        assert_eq!(
            seen.iter().map(|op| op.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn rpc_errors_surface_from_query() {
        let client = Client::new(vec![Arc::new(FailLink)]);
        let err = client.query("x", json!(null)).await.unwrap_err();
        assert_eq!(err.shape().unwrap().code, ErrorCode::BadRequest);
    }

    struct FailLink;

    impl Link for FailLink {
        fn call(&self, _op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
            Observable::throw(ClientError::Rpc(ErrorShape::new(
                ErrorCode::BadRequest,
                "nope",
            )))
        }
    }

    #[tokio::test]
    async fn completing_without_a_value_is_an_error() {
        struct EmptyLink;
        impl Link for EmptyLink {
            fn call(&self, _op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
                Observable::empty()
            }
        }
        let client = Client::new(vec![Arc::new(EmptyLink)]);
        let err = client.query("x", json!(null)).await.unwrap_err();
        assert!(matches!(err, ClientError::ClosedPrematurely));
    }

    #[tokio::test]
    async fn call_options_thread_signal_and_context_through() {
        let (client, seen) = echo_client();
        let signal = CancellationToken::new();
        let context = OperationContext::new();
        context.set("trace", json!("abc"));

        client
            .query_with(
                "user.get",
                json!(null),
                CallOptions {
                    signal: Some(signal.clone()),
                    context: Some(context),
                },
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].context.get("trace"), Some(json!("abc")));
        signal.cancel();
        assert!(seen[0].signal.is_cancelled());
    }

    #[tokio::test]
    async fn subscription_streams_multiple_events() {
        struct StreamLink;
        impl Link for StreamLink {
            fn call(&self, _op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
                Observable::new(|sub| {
                    sub.next(Envelope::data(json!(1)));
                    sub.next(Envelope::data(json!(2)));
                    sub.complete();
                    Ok(Box::new(|| {}) as tether_core::Teardown)
                })
            }
        }
        let client = Client::new(vec![Arc::new(StreamLink)]);

        let values = Arc::new(Mutex::new(Vec::new()));
        let values2 = values.clone();
        let _sub = client
            .subscription("post.onAdd", json!(null))
            .subscribe(Observer::new().on_next(move |env: Envelope| {
                values2.lock().unwrap().push(env.result.data);
            }));

        assert_eq!(
            *values.lock().unwrap(),
            vec![Some(json!(1)), Some(json!(2))]
        );
    }
}
