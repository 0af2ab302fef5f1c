//! RPC client pipeline: a composable link chain in front of HTTP and
//! WebSocket terminals, with batching, dedupe, retry, and routing
//! middleware, plus the path-parameterized [`Client`] facade on top.
//!
//! Build a client by listing links, last one terminal:
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_client::links::{HttpBatchLink, LoggerLink};
//! use tether_client::Client;
//!
//! # async fn demo() -> Result<(), tether_core::ClientError> {
//! let client = Client::new(vec![
//!     Arc::new(LoggerLink::new()),
//!     Arc::new(HttpBatchLink::new("http://localhost:3000")),
//! ]);
//! let user = client.query("user.get", json!({ "id": 1 })).await?;
//! # let _ = user;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dataloader;
pub mod http;
pub mod link;
pub mod links;
pub mod ws;

pub use client::{CallOptions, Client};
pub use dataloader::{BatchFetcher, DataLoader, FetchHandle, ItemFuture, LoadCanceller, LoadHandle};
pub use http::{HttpFetcher, HttpMethod, HttpRequest, HttpResponse, ReqwestFetcher};
pub use link::{Envelope, Link, LinkChain, NextLink};
pub use ws::{
    default_retry_delay, ConnectionStateEvent, ConnectionStatus, RetryDelayFn, WsClient,
    WsClientOptions,
};
