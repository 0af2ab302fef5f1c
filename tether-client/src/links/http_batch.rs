//! Terminal links that coalesce operations into batched HTTP requests.
//!
//! Queries and mutations get separate dataloaders (different wire methods).
//! The streaming variant asks the server for the line-delimited response
//! format and resolves each operation the moment its line arrives, in
//! arrival order rather than index order.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_core::{ClientError, CombinedTransformer, Observable, Operation, OperationKind, Teardown};
use tether_transport::{JsonStreamReader, StreamEvent};

use crate::dataloader::{BatchFetcher, DataLoader, FetchHandle, ItemFuture};
use crate::http::{
    batch_body, batch_url, collect_body, HttpFetcher, HttpMethod, HttpRequest, ReqwestFetcher,
};
use crate::link::{Envelope, Link, NextLink};
use crate::links::decode_envelope;

pub struct HttpBatchLinkOptions {
    pub url: String,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub transformer: CombinedTransformer,
    pub method_override: Option<HttpMethod>,
    /// Prospective GET URL length bound; exceeding it splits the batch.
    pub max_url_length: usize,
}

impl std::fmt::Debug for HttpBatchLinkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBatchLinkOptions")
            .field("url", &self.url)
            .field("max_url_length", &self.max_url_length)
            .finish_non_exhaustive()
    }
}

impl HttpBatchLinkOptions {
    pub fn new(url: impl Into<String>) -> Self {
        HttpBatchLinkOptions {
            url: url.into(),
            fetcher: Arc::new(ReqwestFetcher::default()),
            transformer: CombinedTransformer::default(),
            method_override: None,
            max_url_length: usize::MAX,
        }
    }
}

/// One batched operation, input already transformed.
#[derive(Debug, Clone)]
struct BatchKey {
    path: String,
    input: Value,
}

struct BatchRequestFetcher {
    opts: Arc<HttpBatchLinkOptions>,
    method: HttpMethod,
    streaming: bool,
}

fn value_to_envelope(
    value: Value,
    transformer: &CombinedTransformer,
    status: u16,
) -> Result<Envelope, ClientError> {
    let response = serde_json::from_value(value)
        .map_err(|_| ClientError::protocol(format!("malformed batch item (status {status})")))?;
    decode_envelope(response, transformer).map(|e| e.with_context(json!({ "status": status })))
}

impl BatchRequestFetcher {
    fn build_request(&self, keys: &[BatchKey]) -> Result<HttpRequest, ClientError> {
        let paths: Vec<&str> = keys.iter().map(|k| k.path.as_str()).collect();
        let inputs: Vec<&Value> = keys.iter().map(|k| &k.input).collect();
        let url = batch_url(&self.opts.url, &paths, self.method, &inputs)?;
        let body = match self.method {
            HttpMethod::Post => Some(batch_body(&inputs)?),
            HttpMethod::Get => None,
        };
        let mut headers = Vec::new();
        if self.streaming {
            headers.push(("accept".to_string(), "application/jsonl".to_string()));
        }
        Ok(HttpRequest {
            method: self.method,
            url,
            body,
            headers,
        })
    }

    fn fetch_buffered(&self, keys: Vec<BatchKey>) -> FetchHandle<Envelope> {
        let count = keys.len();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let request = self.build_request(&keys);
        let fetcher = self.opts.fetcher.clone();
        let transformer = self.opts.transformer.clone();
        FetchHandle {
            items: Box::pin(async move {
                let request = request?;
                debug!(batch_size = count, url = %request.url, "batched http request");
                let response = fetcher.fetch(request, token.clone()).await?;
                let status = response.status;
                let text = collect_body(response, &token).await?;
                let doc: Value = serde_json::from_str(&text).map_err(|_| {
                    ClientError::protocol(format!("malformed batch response (status {status})"))
                })?;
                let per_index = split_batch_document(doc, count, status)?;

                let transformer = transformer.clone();
                Ok(per_index
                    .into_iter()
                    .map(|item| {
                        let transformer = transformer.clone();
                        Box::pin(async move {
                            match item {
                                Some(value) => value_to_envelope(value, &transformer, status),
                                None => Err(ClientError::protocol(
                                    "batch response missing an item result",
                                )),
                            }
                        }) as ItemFuture<Envelope>
                    })
                    .collect())
            }),
            cancel,
        }
    }

    fn fetch_streaming(&self, keys: Vec<BatchKey>) -> FetchHandle<Envelope> {
        let count = keys.len();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let request = self.build_request(&keys);
        let fetcher = self.opts.fetcher.clone();
        let transformer = self.opts.transformer.clone();

        let (txs, rxs): (Vec<_>, Vec<_>) = (0..count)
            .map(|_| oneshot::channel::<Result<Envelope, ClientError>>())
            .unzip();

        FetchHandle {
            items: Box::pin(async move {
                let request = request?;
                debug!(batch_size = count, url = %request.url, "streamed batch http request");
                let response = fetcher.fetch(request, token.clone()).await?;
                let status = response.status;

                tokio::spawn(async move {
                    let mut txs: Vec<Option<oneshot::Sender<Result<Envelope, ClientError>>>> =
                        txs.into_iter().map(Some).collect();
                    let mut reader = JsonStreamReader::new(response.body);
                    loop {
                        match reader.next_event().await {
                            Ok(Some(StreamEvent::Item { index, value })) => {
                                if let Some(tx) = txs.get_mut(index).and_then(|t| t.take()) {
                                    let _ =
                                        tx.send(value_to_envelope(value, &transformer, status));
                                }
                            }
                            Ok(Some(StreamEvent::Aggregate(doc))) => {
                                // An intermediary buffered the response;
                                // resolve everything positionally at once.
                                match split_batch_document(doc, txs.len(), status) {
                                    Ok(per_index) => {
                                        for (slot, item) in txs.iter_mut().zip(per_index) {
                                            if let (Some(tx), Some(value)) = (slot.take(), item) {
                                                let _ = tx.send(value_to_envelope(
                                                    value,
                                                    &transformer,
                                                    status,
                                                ));
                                            }
                                        }
                                    }
                                    Err(e) => fail_remaining(&mut txs, e),
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                fail_remaining(
                                    &mut txs,
                                    ClientError::transport_with_cause("stream decode failed", e),
                                );
                                break;
                            }
                        }
                    }
                    // Slots still held here never got a line; dropping the
                    // senders rejects them below.
                });

                Ok(rxs
                    .into_iter()
                    .map(|rx| {
                        Box::pin(async move {
                            match rx.await {
                                Ok(result) => result,
                                Err(_) => Err(ClientError::protocol(
                                    "stream ended before this item arrived",
                                )),
                            }
                        }) as ItemFuture<Envelope>
                    })
                    .collect())
            }),
            cancel,
        }
    }
}

fn fail_remaining(
    txs: &mut [Option<oneshot::Sender<Result<Envelope, ClientError>>>],
    err: ClientError,
) {
    for tx in txs.iter_mut().filter_map(|t| t.take()) {
        let _ = tx.send(Err(err.clone()));
    }
}

/// Splits an array- or index-keyed-object response into positional slots.
fn split_batch_document(
    doc: Value,
    count: usize,
    status: u16,
) -> Result<Vec<Option<Value>>, ClientError> {
    match doc {
        Value::Array(items) => {
            let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
            slots.resize(count, None);
            slots.truncate(count);
            Ok(slots)
        }
        Value::Object(map) => Ok((0..count)
            .map(|index| map.get(&index.to_string()).cloned())
            .collect()),
        _ => Err(ClientError::protocol(format!(
            "batch response is neither array nor object (status {status})"
        ))),
    }
}

impl BatchFetcher<BatchKey> for BatchRequestFetcher {
    type Value = Envelope;

    fn validate(&self, keys: &[&BatchKey]) -> bool {
        let paths: Vec<&str> = keys.iter().map(|k| k.path.as_str()).collect();
        let inputs: Vec<&Value> = keys.iter().map(|k| &k.input).collect();
        match batch_url(&self.opts.url, &paths, HttpMethod::Get, &inputs) {
            Ok(url) => url.len() <= self.opts.max_url_length,
            Err(_) => false,
        }
    }

    fn fetch(&self, keys: Vec<BatchKey>) -> FetchHandle<Envelope> {
        if self.streaming {
            self.fetch_streaming(keys)
        } else {
            self.fetch_buffered(keys)
        }
    }
}

/// Terminal link batching concurrent operations into one HTTP request.
#[derive(Debug, Clone)]
pub struct HttpBatchLink {
    query_loader: DataLoader<BatchKey, Envelope>,
    mutation_loader: DataLoader<BatchKey, Envelope>,
    transformer: CombinedTransformer,
}

impl HttpBatchLink {
    pub fn new(url: impl Into<String>) -> Self {
        HttpBatchLink::with_options(HttpBatchLinkOptions::new(url))
    }

    pub fn with_options(opts: HttpBatchLinkOptions) -> Self {
        HttpBatchLink::build(opts, false)
    }

    fn build(opts: HttpBatchLinkOptions, streaming: bool) -> Self {
        let opts = Arc::new(opts);
        let transformer = opts.transformer.clone();
        let query_method = opts.method_override.unwrap_or(HttpMethod::Get);
        let query_loader = DataLoader::new(Arc::new(BatchRequestFetcher {
            opts: opts.clone(),
            method: query_method,
            streaming,
        }));
        let mutation_loader = DataLoader::new(Arc::new(BatchRequestFetcher {
            opts,
            method: HttpMethod::Post,
            streaming,
        }));
        HttpBatchLink {
            query_loader,
            mutation_loader,
            transformer,
        }
    }
}

impl Link for HttpBatchLink {
    fn call(&self, op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
        let query_loader = self.query_loader.clone();
        let mutation_loader = self.mutation_loader.clone();
        let transformer = self.transformer.clone();
        Observable::new(move |sub| {
            let loader = match op.kind {
                OperationKind::Query => &query_loader,
                OperationKind::Mutation => &mutation_loader,
                OperationKind::Subscription => {
                    return Err(ClientError::config(
                        "subscriptions require the websocket link",
                    ))
                }
            };
            let key = BatchKey {
                path: op.path.clone(),
                input: transformer.serialize_input(op.input.clone()),
            };
            let handle = loader.load(key);
            let canceller = handle.canceller();
            let signal = op.signal.clone();
            let on_signal = canceller.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    result = handle.wait() => result,
                    _ = signal.cancelled() => {
                        on_signal.cancel();
                        Err(ClientError::Cancelled)
                    }
                };
                match result {
                    Ok(envelope) => {
                        sub.next(envelope);
                        sub.complete();
                    }
                    Err(e) => sub.error(e),
                }
            });
            Ok(Box::new(move || canceller.cancel()) as Teardown)
        })
    }
}

/// [`HttpBatchLink`] with streamed, per-item delivery.
#[derive(Debug, Clone)]
pub struct HttpBatchStreamLink {
    inner: HttpBatchLink,
}

impl HttpBatchStreamLink {
    pub fn new(url: impl Into<String>) -> Self {
        HttpBatchStreamLink::with_options(HttpBatchLinkOptions::new(url))
    }

    pub fn with_options(opts: HttpBatchLinkOptions) -> Self {
        HttpBatchStreamLink {
            inner: HttpBatchLink::build(opts, true),
        }
    }
}

impl Link for HttpBatchStreamLink {
    fn call(&self, op: Operation, next: NextLink) -> Observable<Envelope, ClientError> {
        self.inner.call(op, next)
    }
}
