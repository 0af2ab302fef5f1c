//! Built-in links: terminals (HTTP, batched HTTP, WebSocket) and
//! pass-through middleware (retry, split, dedupe, logging).

pub mod dedupe;
pub mod http;
pub mod http_batch;
pub mod logger;
pub mod retry;
pub mod split;
pub mod ws;

pub use dedupe::DedupeLink;
pub use http::{HttpLink, HttpLinkOptions};
pub use http_batch::{HttpBatchLink, HttpBatchLinkOptions, HttpBatchStreamLink};
pub use logger::LoggerLink;
pub use retry::RetryLink;
pub use split::SplitLink;
pub use ws::WsLink;

use tether_core::{ClientError, CombinedTransformer, Response};

use crate::link::Envelope;

/// Decodes one wire response into an envelope, applying the output half of
/// the transformer. A server error envelope becomes the Rpc error.
pub(crate) fn decode_envelope(
    response: Response,
    transformer: &CombinedTransformer,
) -> Result<Envelope, ClientError> {
    match response {
        Response::Ok { mut result } => {
            if let Some(data) = result.data.take() {
                result.data = Some(transformer.deserialize_output(data));
            }
            Ok(Envelope::new(result))
        }
        Response::Err { error } => Err(ClientError::Rpc(error)),
    }
}
