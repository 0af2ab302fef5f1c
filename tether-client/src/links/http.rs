//! Terminal link for plain, one-operation-per-request HTTP.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use tether_core::{ClientError, CombinedTransformer, Observable, Operation, OperationKind, Teardown};

use crate::http::{
    collect_body, single_body, single_url, HttpFetcher, HttpMethod, HttpRequest, ReqwestFetcher,
};
use crate::link::{Envelope, Link, NextLink};
use crate::links::decode_envelope;

pub struct HttpLinkOptions {
    pub url: String,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub transformer: CombinedTransformer,
    /// Forces every call onto one method (servers behind caches sometimes
    /// want POST-only).
    pub method_override: Option<HttpMethod>,
}

impl std::fmt::Debug for HttpLinkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLinkOptions")
            .field("url", &self.url)
            .field("method_override", &self.method_override)
            .finish_non_exhaustive()
    }
}

impl HttpLinkOptions {
    pub fn new(url: impl Into<String>) -> Self {
        HttpLinkOptions {
            url: url.into(),
            fetcher: Arc::new(ReqwestFetcher::default()),
            transformer: CombinedTransformer::default(),
            method_override: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpLink {
    opts: Arc<HttpLinkOptions>,
}

impl HttpLink {
    pub fn new(url: impl Into<String>) -> Self {
        HttpLink::with_options(HttpLinkOptions::new(url))
    }

    pub fn with_options(opts: HttpLinkOptions) -> Self {
        HttpLink {
            opts: Arc::new(opts),
        }
    }
}

impl Link for HttpLink {
    fn call(&self, op: Operation, _next: NextLink) -> Observable<Envelope, ClientError> {
        let opts = self.opts.clone();
        Observable::new(move |sub| {
            if op.kind == OperationKind::Subscription {
                return Err(ClientError::config(
                    "subscriptions require the websocket link",
                ));
            }
            let method = opts.method_override.unwrap_or(match op.kind {
                OperationKind::Query => HttpMethod::Get,
                _ => HttpMethod::Post,
            });
            let input = opts.transformer.serialize_input(op.input.clone());
            let url = single_url(&opts.url, &op.path, method, &input)?;
            let body = match method {
                HttpMethod::Post => Some(single_body(&input)?),
                HttpMethod::Get => None,
            };
            debug!(id = op.id, path = %op.path, ?method, "http request");

            let request = HttpRequest {
                method,
                url,
                body,
                headers: Vec::new(),
            };
            let token = op.signal.child_token();
            let fetch_token = token.clone();
            let fetcher = opts.fetcher.clone();
            let transformer = opts.transformer.clone();
            tokio::spawn(async move {
                match run(fetcher, request, fetch_token, transformer).await {
                    Ok(envelope) => {
                        sub.next(envelope);
                        sub.complete();
                    }
                    Err(e) => sub.error(e),
                }
            });

            Ok(Box::new(move || token.cancel()) as Teardown)
        })
    }
}

async fn run(
    fetcher: Arc<dyn HttpFetcher>,
    request: HttpRequest,
    token: tokio_util::sync::CancellationToken,
    transformer: CombinedTransformer,
) -> Result<Envelope, ClientError> {
    let response = fetcher.fetch(request, token.clone()).await?;
    let status = response.status;
    let text = collect_body(response, &token).await?;
    let parsed = serde_json::from_str(&text)
        .map_err(|_| ClientError::protocol(format!("malformed response body (status {status})")))?;
    decode_envelope(parsed, &transformer).map(|e| e.with_context(json!({ "status": status })))
}
