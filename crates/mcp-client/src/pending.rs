//! Pending-request table: correlates in-flight request ids with the callers
//! waiting on them.
//!
//! One table per connection. An entry is created by the send path and
//! removed exactly once — by the matching response, by the caller's timeout,
//! or by [`PendingRequests::fail_all`] when the transport dies. A reply
//! whose id has no entry (already timed out, or unsolicited) is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{JsonRpcError, RpcReply};

/// JSON-RPC application-error code used when we reject entries locally.
const LOCAL_ABORT_CODE: i64 = -32000;

pub struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<RpcReply>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next correlation id and register a waiter for it.
    ///
    /// Registration happens before the request is written, so a reply that
    /// arrives immediately cannot be lost.
    pub fn register(&self) -> (u64, oneshot::Receiver<RpcReply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a reply to the waiter registered under `id`.
    ///
    /// Returns `false` if no waiter exists (late or unsolicited reply); the
    /// reply is dropped without side effects.
    pub fn complete(&self, id: u64, reply: RpcReply) -> bool {
        let tx = self.waiting.lock().remove(&id);
        match tx {
            // The receiver may have given up in the meantime; that's fine.
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Compatibility shim: if exactly one request is pending, resolve it
    /// with a plain-text payload. Lets us limp along with servers that
    /// answer in prose instead of JSON. Best effort, not a guarantee.
    pub fn complete_sole(&self, text: &str) -> bool {
        let tx = {
            let mut waiting = self.waiting.lock();
            if waiting.len() != 1 {
                return false;
            }
            let id = match waiting.keys().next() {
                Some(id) => *id,
                None => return false,
            };
            waiting.remove(&id)
        };
        match tx {
            Some(tx) => tx.send(Ok(Value::String(text.to_string()))).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id`, if any (timeout / send-failure path).
    pub fn cancel(&self, id: u64) {
        self.waiting.lock().remove(&id);
    }

    /// Reject every outstanding request with the given reason.
    ///
    /// Used on transport exit and on shutdown; nothing may be left waiting.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut waiting = self.waiting.lock();
            waiting.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(JsonRpcError {
                code: LOCAL_ABORT_CODE,
                message: reason.to_string(),
                data: None,
            }));
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
