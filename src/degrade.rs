//! Graceful Degradation
//!
//! Picks the operating mode from what the environment can do. The primary
//! broadcast transport gives full coordination; the polled mailbox keeps
//! the same protocol running at a slower cadence; with neither, a context
//! runs standalone and treats itself as leader, accepting that duplicate
//! writes are possible.
//!
//! The manager is itself a `Transport`: sends go to whichever transport
//! the current mode selects, and a failed send triggers re-evaluation and
//! one retry on the new choice.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::CoordConfig;
use crate::error::{Error, Result};
use crate::events::{SubscriptionId, Subscribers};
use crate::transport::{MessageHandler, PolledTransport, Transport, Unsubscribe};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Primary transport available
    Full,
    /// Only the polled mailbox is available
    Polling,
    /// No coordination at all
    Standalone,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Full => write!(f, "full"),
            Mode::Polling => write!(f, "polling"),
            Mode::Standalone => write!(f, "standalone"),
        }
    }
}

/// What the environment currently supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub transport_available: bool,
    pub polling_available: bool,
    pub mode: Mode,
}

impl CapabilityReport {
    /// Derive the mode from probe results
    pub fn from_probes(transport_available: bool, polling_available: bool) -> Self {
        let mode = if transport_available {
            Mode::Full
        } else if polling_available {
            Mode::Polling
        } else {
            Mode::Standalone
        };
        Self {
            transport_available,
            polling_available,
            mode,
        }
    }

    /// Leases are advisory only in this mode
    pub fn duplicate_write_risk(&self) -> bool {
        self.mode == Mode::Standalone
    }
}

/// Emitted once per mode transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityChange {
    pub previous: CapabilityReport,
    pub current: CapabilityReport,
}

/// The transports handed to a coordinator
#[derive(Clone, Default)]
pub struct Transports {
    pub primary: Option<Arc<dyn Transport>>,
    pub fallback: Option<Arc<dyn Transport>>,
}

impl Transports {
    /// Primary transport only
    pub fn primary(primary: Arc<dyn Transport>) -> Self {
        Self {
            primary: Some(primary),
            fallback: None,
        }
    }

    /// Add a fallback transport
    pub fn with_fallback(mut self, fallback: Arc<dyn Transport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Open the configured mailbox as the fallback and start polling it.
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: &CoordConfig, primary: Option<Arc<dyn Transport>>) -> Result<Self> {
        let fallback: Option<Arc<dyn Transport>> = if config.fallback.enabled {
            let mailbox = Arc::new(PolledTransport::open(
                Path::new(&config.fallback.path),
                config.retention(),
            )?);
            mailbox.spawn_poller(config.polling_interval());
            tracing::info!("Fallback mailbox at {}", mailbox.path().display());
            Some(mailbox)
        } else {
            None
        };
        Ok(Self { primary, fallback })
    }
}

/// Tracks capabilities and routes traffic to the active transport
pub struct DegradationManager {
    primary: Option<Arc<dyn Transport>>,
    fallback: Option<Arc<dyn Transport>>,
    report: RwLock<CapabilityReport>,
    /// Serialises probe rounds so one transition fires one event
    probing: Mutex<()>,
    subscribers: Subscribers<CapabilityChange>,
}

impl DegradationManager {
    /// Create a manager; capabilities are unknown until `initialize`
    pub fn new(transports: Transports) -> Self {
        Self {
            primary: transports.primary,
            fallback: transports.fallback,
            report: RwLock::new(CapabilityReport::from_probes(false, false)),
            probing: Mutex::new(()),
            subscribers: Subscribers::new(),
        }
    }

    /// Current capabilities
    pub fn report(&self) -> CapabilityReport {
        *self.report.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current mode
    pub fn mode(&self) -> Mode {
        self.report().mode
    }

    /// Register a capability-change handler
    pub fn on_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CapabilityChange) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    /// Remove a capability-change handler
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    async fn probe_all(&self) -> CapabilityReport {
        let transport_available = match &self.primary {
            Some(t) => t.probe().await,
            None => false,
        };
        let polling_available = match &self.fallback {
            Some(t) => t.probe().await,
            None => false,
        };
        CapabilityReport::from_probes(transport_available, polling_available)
    }

    fn store(&self, report: CapabilityReport) -> CapabilityReport {
        let mut current = self.report.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, report)
    }

    /// First probe at join; sets the mode without emitting an event
    pub async fn initialize(&self) -> CapabilityReport {
        let _round = self.probing.lock().await;
        let report = self.probe_all().await;
        self.store(report);
        if report.mode == Mode::Standalone {
            tracing::warn!("No coordination transport available; running standalone, duplicate writes are possible");
        } else {
            tracing::info!("Coordination mode: {}", report.mode);
        }
        report
    }

    /// Re-probe both transports; emits an event if the mode changed
    pub async fn evaluate(&self) -> Option<CapabilityChange> {
        let _round = self.probing.lock().await;
        let report = self.probe_all().await;
        let previous = self.store(report);
        if previous.mode == report.mode {
            return None;
        }

        if report.mode == Mode::Standalone {
            tracing::warn!(
                "Coordination lost ({} -> standalone); duplicate writes are possible",
                previous.mode
            );
        } else {
            tracing::info!("Coordination mode changed: {} -> {}", previous.mode, report.mode);
        }

        let change = CapabilityChange {
            previous,
            current: report,
        };
        self.subscribers.notify(&change);
        Some(change)
    }

    fn active(&self) -> Option<&Arc<dyn Transport>> {
        match self.mode() {
            Mode::Full => self.primary.as_ref(),
            Mode::Polling => self.fallback.as_ref(),
            Mode::Standalone => None,
        }
    }
}

#[async_trait::async_trait]
impl Transport for DegradationManager {
    fn name(&self) -> &str {
        "degrading"
    }

    async fn send(&self, topic: &str, frame: Vec<u8>) -> Result<()> {
        let Some(transport) = self.active() else {
            return Err(Error::TransportUnavailable("running standalone".to_string()));
        };

        let error = match transport.send(topic, frame.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::debug!("Send over {} failed: {}", transport.name(), error);

        self.evaluate().await;
        match self.active() {
            Some(retry) if !Arc::ptr_eq(retry, transport) => retry.send(topic, frame).await,
            _ => Err(error),
        }
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Unsubscribe> {
        let mut combined = Unsubscribe::noop();
        let mut subscribed = false;
        let mut last_error = None;

        for transport in [&self.primary, &self.fallback].into_iter().flatten() {
            match transport.subscribe(topic, Arc::clone(&handler)) {
                Ok(unsubscribe) => {
                    combined = combined.chain(unsubscribe);
                    subscribed = true;
                }
                Err(e) => {
                    tracing::warn!("Subscribe on {} failed: {}", transport.name(), e);
                    last_error = Some(e);
                }
            }
        }

        match (subscribed, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(combined),
        }
    }

    async fn probe(&self) -> bool {
        self.probe_all().await.mode != Mode::Standalone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBus, MemoryTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>, MemoryBus, MemoryBus) {
        let primary_bus = MemoryBus::new();
        let fallback_bus = MemoryBus::new();
        (
            Arc::new(primary_bus.endpoint()),
            Arc::new(fallback_bus.endpoint()),
            primary_bus,
            fallback_bus,
        )
    }

    fn manager(primary: &Arc<MemoryTransport>, fallback: &Arc<MemoryTransport>) -> DegradationManager {
        let primary: Arc<dyn Transport> = primary.clone();
        let fallback: Arc<dyn Transport> = fallback.clone();
        DegradationManager::new(Transports::primary(primary).with_fallback(fallback))
    }

    #[test]
    fn test_mode_from_probes() {
        assert_eq!(CapabilityReport::from_probes(true, true).mode, Mode::Full);
        assert_eq!(CapabilityReport::from_probes(true, false).mode, Mode::Full);
        assert_eq!(CapabilityReport::from_probes(false, true).mode, Mode::Polling);
        let none = CapabilityReport::from_probes(false, false);
        assert_eq!(none.mode, Mode::Standalone);
        assert!(none.duplicate_write_risk());
    }

    #[tokio::test]
    async fn test_one_event_per_transition() {
        let (primary, fallback, _pb, _fb) = pair();
        let manager = manager(&primary, &fallback);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.on_change(move |change| sink.lock().unwrap().push(change.current.mode));

        assert_eq!(manager.initialize().await.mode, Mode::Full);
        assert!(manager.evaluate().await.is_none());

        primary.set_online(false);
        assert!(manager.evaluate().await.is_some());
        assert!(manager.evaluate().await.is_none());

        fallback.set_online(false);
        manager.evaluate().await;
        primary.set_online(true);
        manager.evaluate().await;
        manager.evaluate().await;

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[Mode::Polling, Mode::Standalone, Mode::Full]
        );
    }

    #[tokio::test]
    async fn test_send_fails_over_to_mailbox() {
        let (primary, fallback, _pb, fallback_bus) = pair();
        let manager = manager(&primary, &fallback);
        manager.initialize().await;

        let peer = fallback_bus.endpoint();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        peer.subscribe(
            "t",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        primary.set_online(false);
        manager.send("t", vec![1]).await.unwrap();
        assert_eq!(manager.mode(), Mode::Polling);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_standalone_send_errors() {
        let (primary, fallback, _pb, _fb) = pair();
        primary.set_online(false);
        fallback.set_online(false);
        let manager = manager(&primary, &fallback);
        let report = manager.initialize().await;
        assert_eq!(report.mode, Mode::Standalone);
        assert!(matches!(
            manager.send("t", vec![1]).await,
            Err(Error::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_listens_on_both() {
        let (primary, fallback, primary_bus, fallback_bus) = pair();
        let manager = manager(&primary, &fallback);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        manager
            .subscribe(
                "t",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        primary_bus.endpoint().send("t", vec![1]).await.unwrap();
        fallback_bus.endpoint().send("t", vec![2]).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
