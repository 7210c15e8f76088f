//! Response bookkeeping for originated requests.
//!
//! The dispatcher registers a message id here when it originates a request
//! and completes the registration when the matching response arrives. A
//! registration that expires, or is cancelled because routing ran out of
//! candidates, completes with the distinguished empty reply instead, so
//! the waiting caller always gets an answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::messages::Message;

/// What a waiting request eventually receives.
#[derive(Debug)]
pub enum Reply {
    Response(Message),
    /// Expired, cancelled, or shut down: the distinguished empty reply.
    Empty,
}

#[derive(Default)]
pub struct Timer {
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Reply>>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("timer lock").len()
    }

    /// Register a request id and arm its expiry. The receiver resolves
    /// exactly once.
    pub fn register(&self, id: u32, timeout: Duration) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("timer lock").insert(id, tx);

        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = pending.lock().expect("timer lock").remove(&id) {
                trace!(id, "request expired without a response");
                let _ = tx.send(Reply::Empty);
            }
        });
        rx
    }

    /// Complete a registration with an arriving response. Unmatched
    /// responses are dropped silently.
    pub fn add_response(&self, message: Message) {
        let id = message.id;
        match self.pending.lock().expect("timer lock").remove(&id) {
            Some(tx) => {
                let _ = tx.send(Reply::Response(message));
            }
            None => debug!(id, "response without a pending request"),
        }
    }

    /// Complete a registration with the empty reply (routing exhausted).
    pub fn cancel(&self, id: u32) {
        if let Some(tx) = self.pending.lock().expect("timer lock").remove(&id) {
            let _ = tx.send(Reply::Empty);
        }
    }

    /// Complete everything outstanding with the empty reply (shutdown).
    pub fn drain(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("timer lock");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Reply::Empty);
        }
    }
}
