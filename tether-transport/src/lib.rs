//! Transport layer for the tether RPC client: the injectable socket seam,
//! the managed WebSocket connection (keep-alive, connection-params
//! handshake), and the incremental decoder for streamed batch responses.

pub mod connection;
pub mod error;
pub mod json_stream;
pub mod socket;

pub use connection::{
    ConnectOptions, ConnectionEvent, ConnectionParamsProvider, ConnectionState, KeepAliveConfig,
    UrlProvider, WsConnection, CONNECTION_PARAMS_FAILED_CLOSE_CODE,
};
pub use error::TransportError;
pub use json_stream::{JsonStreamParser, JsonStreamReader, StreamEvent};
pub use socket::{SocketConnector, SocketEvent, SocketSink, TungsteniteConnector};
