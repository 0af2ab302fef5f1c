//! HTTP request shaping and the injectable fetcher seam.
//!
//! Single call: `GET {base}/{path}?input=<url-encoded JSON>` for queries,
//! `POST {base}/{path}` with an `{ "input": ... }` body for mutations.
//! Batch call: paths joined with commas, a `batch=1` marker, and inputs as an
//! index-keyed map so positional order survives object-shaped responses.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use tether_core::ClientError;
use tether_transport::TransportError;

/// Characters escaped inside a query-string value.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'|');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Response body as a byte stream, so the streaming batch link can decode
/// line by line; non-streaming callers collect it with [`collect_body`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub struct HttpResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Injectable fetch seam; tests substitute channel-backed fakes.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: HttpRequest,
        signal: CancellationToken,
    ) -> Result<HttpResponse, ClientError>;
}

/// Production fetcher backed by a shared reqwest client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        ReqwestFetcher { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        request: HttpRequest,
        signal: CancellationToken,
    ) -> Result<HttpResponse, ClientError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = tokio::select! {
            _ = signal.cancelled() => return Err(ClientError::Cancelled),
            response = builder.send() => response
                .map_err(|e| ClientError::transport_with_cause("HTTP request failed", e))?,
        };

        let status = response.status().as_u16();
        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| TransportError::Io(std::io::Error::other(e)))),
        );
        Ok(HttpResponse { status, body })
    }
}

/// Reads the whole body. Bails out early when `signal` fires.
pub async fn collect_body(
    response: HttpResponse,
    signal: &CancellationToken,
) -> Result<String, ClientError> {
    let mut body = response.body;
    let mut bytes = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = signal.cancelled() => return Err(ClientError::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => bytes.extend_from_slice(&chunk),
            Some(Err(e)) => {
                return Err(ClientError::transport_with_cause("body read failed", e))
            }
            None => break,
        }
    }
    String::from_utf8(bytes).map_err(|_| ClientError::protocol("response body is not UTF-8"))
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn encode_query_value(value: &Value) -> Result<String, ClientError> {
    let json = serde_json::to_string(value)?;
    Ok(utf8_percent_encode(&json, QUERY_VALUE).to_string())
}

/// URL for one non-batched call. Query inputs ride in the query string;
/// a null input adds no parameter at all.
pub fn single_url(
    base: &str,
    path: &str,
    method: HttpMethod,
    input: &Value,
) -> Result<String, ClientError> {
    let mut url = join_url(base, path);
    if method == HttpMethod::Get && !input.is_null() {
        url.push_str("?input=");
        url.push_str(&encode_query_value(input)?);
    }
    Ok(url)
}

/// Body for one non-batched POST.
pub fn single_body(input: &Value) -> Result<String, ClientError> {
    Ok(serde_json::to_string(&json!({ "input": input }))?)
}

fn indexed_inputs(inputs: &[&Value]) -> Value {
    let mut map = Map::new();
    for (index, input) in inputs.iter().enumerate() {
        if !input.is_null() {
            map.insert(index.to_string(), (*input).clone());
        }
    }
    Value::Object(map)
}

/// URL for a batched call: comma-joined paths plus the `batch=1` marker.
/// GET carries the index-keyed input map in the query string too.
pub fn batch_url(
    base: &str,
    paths: &[&str],
    method: HttpMethod,
    inputs: &[&Value],
) -> Result<String, ClientError> {
    let mut url = join_url(base, &paths.join(","));
    url.push_str("?batch=1");
    if method == HttpMethod::Get {
        let map = indexed_inputs(inputs);
        if map.as_object().is_some_and(|m| !m.is_empty()) {
            url.push_str("&input=");
            url.push_str(&encode_query_value(&map)?);
        }
    }
    Ok(url)
}

/// Body for a batched POST: the index-keyed input map.
pub fn batch_body(inputs: &[&Value]) -> Result<String, ClientError> {
    Ok(serde_json::to_string(&indexed_inputs(inputs))?)
}
