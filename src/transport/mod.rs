//! Transport Module
//!
//! The broadcast primitive contexts on one device talk over. Delivery is
//! best-effort: frames may be dropped, duplicated or reordered, and a
//! sender never receives its own frames.

mod memory;
mod polled;

pub use memory::{MemoryBus, MemoryTransport};
pub use polled::PolledTransport;

use std::sync::Arc;

use crate::error::Result;

/// Callback invoked with every frame received on a topic
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Send/receive interface consumed by the coordination layer
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Broadcast a frame to every other subscriber of `topic`
    async fn send(&self, topic: &str, frame: Vec<u8>) -> Result<()>;

    /// Start delivering frames on `topic` to `handler`
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Unsubscribe>;

    /// Check whether the transport can currently carry traffic
    async fn probe(&self) -> bool;
}

/// Undoes a `subscribe` when called
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    /// Wrap a cancellation closure
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Nothing to undo
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Combine two unsubscribes into one
    pub fn chain(self, other: Unsubscribe) -> Self {
        Self::new(move || {
            self.unsubscribe();
            other.unsubscribe();
        })
    }

    /// Stop delivery
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
