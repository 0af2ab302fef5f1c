//! The unit of work flowing through a link chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What kind of call an operation is. Matches the wire method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        };
        write!(f, "{}", s)
    }
}

/// Mutable side-channel shared by every link that sees one operation.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().ok().and_then(|e| e.get(key).cloned())
    }
}

/// One logical RPC call.
///
/// Immutable once created; a link that wants to change anything builds a
/// derived operation via [`Operation::with_input`] or plain struct update and
/// passes that onward. The id stays stable across reconnect-resumption.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: u64,
    pub kind: OperationKind,
    pub path: String,
    pub input: Value,
    pub context: OperationContext,
    pub signal: CancellationToken,
}

impl Operation {
    pub fn new(id: u64, kind: OperationKind, path: impl Into<String>, input: Value) -> Self {
        Operation {
            id,
            kind,
            path: path.into(),
            input,
            context: OperationContext::new(),
            signal: CancellationToken::new(),
        }
    }

    /// Derived operation with a replaced input, sharing id/context/signal.
    pub fn with_input(&self, input: Value) -> Self {
        let mut op = self.clone();
        op.input = input;
        op
    }
}

/// Monotonic request-id source owned by one client instance.
///
/// Ids never repeat within a client, so responses arriving after a reconnect
/// still correlate with the request that produced them.
#[derive(Debug)]
pub struct RequestIdAllocator {
    next: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        RequestIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
