//! Core types for the tether RPC client pipeline: the observable stream
//! primitive, operations, wire envelopes, the error taxonomy, and the
//! payload transformer seam.

pub mod behavior;
pub mod error;
pub mod message;
pub mod observable;
pub mod operation;
pub mod transformer;

pub use behavior::BehaviorSubject;
pub use error::{ClientError, ErrorCode, ErrorShape};
pub use message::{
    decode_incoming, encode_outgoing, ConnectionParamsMessage, IncomingMessage, IncomingMethod,
    IncomingRequest, RequestMessage, RequestMethod, RequestParams, Response, ResponseMessage,
    ResultEnvelope, ResultKind,
};
pub use observable::{
    first_value, subscription_from, Observable, Observer, Subscriber, Subscription, Teardown,
};
pub use operation::{Operation, OperationContext, OperationKind, RequestIdAllocator};
pub use transformer::{CombinedTransformer, DataTransformer, IdentityTransformer};
