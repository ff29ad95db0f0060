//! Pending-call registry: request id allocation and the table of callers
//! still waiting for their reply.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::messages::InboundEnvelope;

/// Ids start at 0 and only grow for the lifetime of one connection.
///
/// An entry leaves the table exactly once, when its reply is taken. A reply
/// that never arrives leaves its entry in place.
#[derive(Debug, Default)]
pub struct PendingCalls {
    next_id: u64,
    waiters: HashMap<u64, oneshot::Sender<InboundEnvelope>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id and register a waiter under it.
    pub fn register(&mut self) -> (u64, oneshot::Receiver<InboundEnvelope>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        (id, rx)
    }

    /// Remove and return the waiter for `id`, if one is registered.
    pub fn take(&mut self, id: u64) -> Option<oneshot::Sender<InboundEnvelope>> {
        self.waiters.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}
