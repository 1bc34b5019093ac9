//! In-process broadcast bus
//!
//! Connects contexts that share one process (worker threads, or a test
//! harness standing in for several tabs). Each context gets its own
//! endpoint; an endpoint can be taken offline to simulate transport loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{MessageHandler, Transport, Unsubscribe};
use crate::error::{Error, Result};

struct BusSubscriber {
    id: u64,
    endpoint: u64,
    handler: MessageHandler,
}

#[derive(Default)]
struct BusInner {
    /// Subscribers per topic
    topics: Mutex<HashMap<String, Vec<BusSubscriber>>>,
    /// Online flag per endpoint
    endpoints: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn is_online(&self, endpoint: u64) -> bool {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Deliver to every online subscriber of `topic` except `from`
    fn deliver(&self, topic: &str, from: Option<u64>, frame: &[u8]) -> usize {
        let targets: Vec<(u64, MessageHandler)> = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|s| Some(s.endpoint) != from)
                    .map(|s| (s.endpoint, Arc::clone(&s.handler)))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for (endpoint, handler) in targets {
            if self.is_online(endpoint) {
                handler(frame.to_vec());
                delivered += 1;
            }
        }
        delivered
    }
}

/// Shared in-process bus
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint on this bus
    pub fn endpoint(&self) -> MemoryTransport {
        let endpoint = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let online = Arc::new(AtomicBool::new(true));
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint, Arc::clone(&online));

        MemoryTransport {
            bus: Arc::clone(&self.inner),
            endpoint,
            online,
            name: format!("memory#{}", endpoint),
        }
    }

    /// Deliver a raw frame from outside any endpoint (fault injection)
    pub fn inject(&self, topic: &str, frame: &[u8]) -> usize {
        self.inner.deliver(topic, None, frame)
    }
}

/// One context's handle on a `MemoryBus`
pub struct MemoryTransport {
    bus: Arc<BusInner>,
    endpoint: u64,
    online: Arc<AtomicBool>,
    name: String,
}

impl MemoryTransport {
    /// Take the endpoint offline or bring it back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Check if the endpoint is online
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, topic: &str, frame: Vec<u8>) -> Result<()> {
        if !self.is_online() {
            return Err(Error::TransportUnavailable(format!("{} is offline", self.name)));
        }
        let delivered = self.bus.deliver(topic, Some(self.endpoint), &frame);
        tracing::trace!("{} delivered {} bytes to {} subscribers", self.name, frame.len(), delivered);
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Unsubscribe> {
        let id = self.bus.next_id.fetch_add(1, Ordering::Relaxed);
        self.bus
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(BusSubscriber {
                id,
                endpoint: self.endpoint,
                handler,
            });

        let bus = Arc::clone(&self.bus);
        let topic = topic.to_string();
        Ok(Unsubscribe::new(move || {
            if let Some(subs) = bus
                .topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&topic)
            {
                subs.retain(|s| s.id != id);
            }
        }))
    }

    async fn probe(&self) -> bool {
        self.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (MessageHandler, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |frame| sink.lock().unwrap().push(frame));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let c = bus.endpoint();

        let (ha, seen_a) = collector();
        let (hb, seen_b) = collector();
        let (hc, seen_c) = collector();
        a.subscribe("t", ha).unwrap();
        b.subscribe("t", hb).unwrap();
        c.subscribe("other", hc).unwrap();

        a.send("t", b"hello".to_vec()).await.unwrap();

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
        assert!(seen_c.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_endpoint() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let (hb, seen_b) = collector();
        b.subscribe("t", hb).unwrap();

        a.set_online(false);
        assert!(!a.probe().await);
        assert!(matches!(
            a.send("t", vec![1]).await,
            Err(Error::TransportUnavailable(_))
        ));

        a.set_online(true);
        b.set_online(false);
        a.send("t", vec![2]).await.unwrap();
        assert!(seen_b.lock().unwrap().is_empty());

        b.set_online(true);
        a.send("t", vec![3]).await.unwrap();
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[vec![3]]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_inject() {
        let bus = MemoryBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let (hb, seen_b) = collector();
        let unsubscribe = b.subscribe("t", hb).unwrap();

        assert_eq!(bus.inject("t", b"junk"), 1);
        unsubscribe.unsubscribe();
        a.send("t", vec![9]).await.unwrap();

        assert_eq!(seen_b.lock().unwrap().as_slice(), &[b"junk".to_vec()]);
    }
}
