//! Payload transformer seam.
//!
//! A caller-supplied serializer pair is applied uniformly around every
//! payload; the pipeline itself never inspects domain data.

use std::sync::Arc;

use serde_json::Value;

/// One direction of a transformer (e.g. superjson-style encoding).
pub trait DataTransformer: Send + Sync {
    fn serialize(&self, value: Value) -> Value;
    fn deserialize(&self, value: Value) -> Value;
}

/// Pass-through default.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl DataTransformer for IdentityTransformer {
    fn serialize(&self, value: Value) -> Value {
        value
    }

    fn deserialize(&self, value: Value) -> Value {
        value
    }
}

/// Input/output transformer pair, mirrored on the server side.
#[derive(Clone)]
pub struct CombinedTransformer {
    pub input: Arc<dyn DataTransformer>,
    pub output: Arc<dyn DataTransformer>,
}

impl std::fmt::Debug for CombinedTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CombinedTransformer")
    }
}

impl Default for CombinedTransformer {
    fn default() -> Self {
        CombinedTransformer {
            input: Arc::new(IdentityTransformer),
            output: Arc::new(IdentityTransformer),
        }
    }
}

impl CombinedTransformer {
    /// Serialize an outgoing input payload.
    pub fn serialize_input(&self, value: Value) -> Value {
        self.input.serialize(value)
    }

    /// Deserialize an incoming output payload.
    pub fn deserialize_output(&self, value: Value) -> Value {
        self.output.deserialize(value)
    }
}
