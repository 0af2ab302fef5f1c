//! The persistent-connection client: request tracking and the connection
//! lifecycle manager.

pub mod client;
pub mod request_manager;

pub use client::{
    default_retry_delay, ConnectionStateEvent, ConnectionStatus, RetryDelayFn, WsClient,
    WsClientOptions,
};
pub use request_manager::{RequestManager, TrackedRequest};
