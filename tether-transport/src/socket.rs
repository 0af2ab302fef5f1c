//! Injectable socket seam.
//!
//! A connected socket is a sink half plus an event stream, so the connection
//! pump can select over inbound events while still writing. Tests swap in
//! channel-backed fakes; [`TungsteniteConnector`] is the production
//! implementation, pumped through tasks the same way the write/read halves
//! of a tungstenite stream are usually driven.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use crate::TransportError;

/// What a socket can report upward.
#[derive(Debug)]
pub enum SocketEvent {
    /// One inbound text frame.
    Message(String),
    /// The socket went away, with the triggering error when there was one.
    Closed(Option<TransportError>),
}

/// The write half of a connected socket.
#[async_trait]
pub trait SocketSink: Send + Sync {
    async fn send(&self, text: String) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Injectable socket constructor.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SocketSink>, mpsc::UnboundedReceiver<SocketEvent>), TransportError>;
}

struct TungsteniteSink {
    tx: mpsc::UnboundedSender<WsMessage>,
}

#[async_trait]
impl SocketSink for TungsteniteSink {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(WsMessage::Text(text.into()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let _ = self.tx.send(WsMessage::Close(None));
    }
}

/// Default connector: dials `url` with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SocketSink>, mpsc::UnboundedReceiver<SocketEvent>), TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        // Outgoing pump
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let is_close = matches!(message, WsMessage::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Incoming pump
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx
                            .send(SocketEvent::Message(text.as_str().to_owned()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        let _ = in_tx.send(SocketEvent::Closed(None));
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary/ping/pong frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        let _ = in_tx.send(SocketEvent::Closed(Some(TransportError::WebSocket(
                            e.to_string(),
                        ))));
                        break;
                    }
                }
            }
        });

        Ok((Box::new(TungsteniteSink { tx }), in_rx))
    }
}
