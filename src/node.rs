//! Coordinator
//!
//! One `Coordinator` per context. It owns the registry, election, lease,
//! query and slot state machines behind a single lock, feeds them inbound
//! frames and clock ticks from a background event loop, and broadcasts
//! whatever they emit through the degradation manager.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{CoordConfig, Timing};
use crate::degrade::{CapabilityChange, CapabilityReport, DegradationManager, Mode, Transports};
use crate::error::{Error, Result};
use crate::events::{SubscriptionId, Subscribers};
use crate::lease::{AcquireOutcome, Denial, Lease, LeaseReply, LockOptions, WriteCoordinator};
use crate::protocol::{DenyReason, Envelope, Payload, PeerId, QueryOutcome, RequestId, Term};
use crate::query::{Enlisted, QueryDeduplicator, WaiterSignal};
use crate::slot::{SlotClaim, SlotEvent, SlotManager};
use crate::state::{ClusterView, ElectionState, LeaderChange, LeaderElection, PeerRegistry, PeerRole};
use crate::transport::{MessageHandler, Transport, Unsubscribe};

/// Snapshot of a coordinator's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub peer_id: PeerId,
    pub priority: u32,
    pub mode: Mode,
    pub role: PeerRole,
    pub term: Term,
    pub leader_id: Option<PeerId>,
    /// Live contexts, including this one
    pub live_peers: usize,
    pub held_leases: usize,
    pub held_slots: Vec<String>,
    pub open_tickets: usize,
    /// Lease and query requests still waiting for the leader
    pub pending_requests: usize,
    pub corrupt_messages: u64,
    pub stale_messages: u64,
}

/// Everything the state machines emit while the lock is held
#[derive(Default)]
struct Effects {
    outbox: Vec<Payload>,
    leader_changes: Vec<LeaderChange>,
}

/// Ready to leave the lock: stamped envelopes and events to deliver
#[derive(Default)]
struct Dispatch {
    envelopes: Vec<Envelope>,
    leader_changes: Vec<LeaderChange>,
    slot_events: Vec<SlotEvent>,
}

/// Lease request that is either answered locally or sent to the leader
enum Attempt<T> {
    Decided(T),
    Waiting(RequestId, oneshot::Receiver<LeaseReply>),
}

/// All coordination state for one context
struct ContextState {
    registry: PeerRegistry,
    election: LeaderElection,
    leases: WriteCoordinator,
    queries: QueryDeduplicator,
    slots: SlotManager,
    mode: Mode,
    timing: Timing,
    joined: bool,
    last_probe: Instant,
}

impl ContextState {
    fn ensure_joined(&self) -> Result<()> {
        if self.election.state() == ElectionState::Disconnected {
            return Err(Error::ShuttingDown);
        }
        if !self.joined {
            return Err(Error::NotJoined);
        }
        Ok(())
    }

    fn apply_leader_change(&mut self, change: LeaderChange, now: Instant, effects: &mut Effects) {
        match (&change.leader_id, change.is_self) {
            (Some(_), true) => tracing::info!("This context now leads term {}", change.term),
            (Some(id), false) => tracing::info!("Leader changed to {} (term {})", id, change.term),
            (None, _) => tracing::info!("No leader for term {}", change.term),
        }
        let view = ClusterView::of(&self.registry, &self.election, now);
        self.slots
            .on_leader_change(change.leader_id.as_deref(), &view, &mut effects.outbox);
        effects.leader_changes.push(change);
    }

    /// Switch timings and leadership rules to `mode`
    fn apply_mode(&mut self, mode: Mode, config: &CoordConfig, now: Instant, effects: &mut Effects) {
        if self.mode == mode {
            return;
        }
        let previous = self.mode;
        self.mode = mode;
        self.timing = config.timing(mode);
        self.registry.set_liveness_timeout(self.timing.liveness_timeout);
        self.election.set_window(self.timing.election_window);

        let change = if mode == Mode::Standalone {
            self.registry.clear();
            self.queries.take_over_local();
            self.election.enter_standalone()
        } else if previous == Mode::Standalone {
            self.election.exit_standalone(now)
        } else {
            None
        };

        tracing::debug!(
            "Mode {} -> {}: heartbeat {:?}, liveness {:?}",
            previous,
            mode,
            self.timing.heartbeat_interval,
            self.timing.liveness_timeout
        );
        if let Some(change) = change {
            self.apply_leader_change(change, now, effects);
        }
    }

    fn heartbeat(&self, now: Instant) -> Payload {
        Payload::Heartbeat {
            role: self.election.state().role(),
            leader_id: self.election.leader().map(str::to_string),
            leases: self.leases.held_leases(now),
            slots: self.slots.held(),
            running_queries: self.queries.running_hashes(),
        }
    }

    fn tick(&mut self, now: Instant, effects: &mut Effects) {
        for peer in self.registry.expire(now) {
            self.leases.on_peer_removed(&peer.id);
            self.queries.on_peer_removed(&peer.id);
        }

        if let Some(change) = self.election.tick(now, &self.registry, &mut effects.outbox) {
            self.apply_leader_change(change, now, effects);
        }

        self.leases.tick(now, self.timing.request_timeout);
        let view = ClusterView::of(&self.registry, &self.election, now);
        self.queries
            .expire_requests(&view, self.timing.request_timeout, &mut effects.outbox);
        self.queries
            .sweep(&view, self.timing.dedup_timeout, &mut effects.outbox);
        self.slots.tick(&view, &mut effects.outbox);

        if self.mode != Mode::Standalone {
            let heartbeat = self.heartbeat(now);
            effects.outbox.push(heartbeat);
        }
    }

    /// Apply one envelope from a peer; returns false if it was stale
    fn handle(&mut self, envelope: &Envelope, now: Instant, effects: &mut Effects) -> bool {
        let sender = envelope.sender_id.as_str();
        self.registry.heartbeat(sender, envelope.sender_priority, now);

        if envelope.kind().is_authoritative() && envelope.term < self.election.term() {
            return false;
        }
        if let Payload::Heartbeat { role, .. } = &envelope.payload {
            self.registry.set_role(sender, *role);
        }

        if let Some(change) = self
            .election
            .handle(envelope, &self.registry, now, &mut effects.outbox)
        {
            self.apply_leader_change(change, now, effects);
        }

        if envelope.payload == Payload::Leave {
            self.registry.leave(sender);
            self.leases.on_peer_removed(sender);
            self.queries.on_peer_removed(sender);
            return true;
        }

        let out = &mut effects.outbox;
        let view = ClusterView::of(&self.registry, &self.election, now);
        match &envelope.payload {
            Payload::Heartbeat {
                leases,
                slots,
                running_queries,
                ..
            } => {
                self.leases.observe_held(sender, leases, envelope.term, now);
                self.slots
                    .observe_heartbeat(sender, envelope.sender_priority, envelope.term, slots, &view);
                self.queries.observe_running(sender, running_queries, now);
            }
            Payload::LeaseRequest {
                request_id,
                resource_key,
                hold_ms,
                renew_token,
            } => {
                if view.is_leader {
                    self.leases.handle_request(
                        sender,
                        *request_id,
                        resource_key,
                        *hold_ms,
                        *renew_token,
                        &view,
                        out,
                    );
                }
            }
            Payload::LeaseGrant {
                request_id,
                requester,
                resource_key,
                fencing_token,
                hold_ms,
            } => {
                self.leases.apply_grant(
                    *request_id,
                    requester,
                    resource_key,
                    *fencing_token,
                    *hold_ms,
                    envelope.term,
                    now,
                    out,
                );
            }
            Payload::LeaseDeny {
                request_id,
                requester,
                reason,
                ..
            } => {
                self.leases.apply_deny(*request_id, requester, reason.clone());
            }
            Payload::LeaseRelease {
                resource_key,
                holder,
                fencing_token,
            } => {
                self.leases.apply_release(resource_key, holder, *fencing_token);
            }
            Payload::QueryStart {
                request_id,
                query_hash,
            } => {
                if view.is_leader {
                    self.queries.handle_start(sender, *request_id, query_hash, &view, out);
                }
            }
            Payload::QueryAssign {
                request_id,
                requester,
                query_hash,
                executor,
                reopened,
            } => {
                self.queries
                    .apply_assign(*request_id, requester, query_hash, executor, *reopened, now, out);
            }
            Payload::QueryResult {
                query_hash,
                executor,
                outcome,
            } => {
                self.queries.apply_result(query_hash, executor, outcome.clone());
            }
            Payload::SlotClaim { endpoint_id, claim } => {
                self.slots.handle_claim(
                    sender,
                    envelope.sender_priority,
                    envelope.term,
                    endpoint_id,
                    *claim,
                    &view,
                    out,
                );
            }
            Payload::SlotRelease { endpoint_id, retire } => {
                self.slots.handle_release(sender, endpoint_id, *retire);
            }
            Payload::Candidacy | Payload::LeaderAnnounce | Payload::Leave => {}
        }
        true
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    unsubscribe: Option<Unsubscribe>,
}

struct Inner {
    peer_id: PeerId,
    priority: u32,
    config: CoordConfig,
    topic: String,
    transport: DegradationManager,
    state: Mutex<ContextState>,
    lifecycle: Mutex<Lifecycle>,
    leader_events: Subscribers<LeaderChange>,
    slot_events: Subscribers<SlotEvent>,
    corrupt_messages: AtomicU64,
    stale_messages: AtomicU64,
}

impl Inner {
    /// Stamp the outbox with the current term and collect slot events
    fn seal(&self, st: &mut ContextState, effects: Effects) -> Dispatch {
        let envelopes = if st.mode == Mode::Standalone {
            Vec::new()
        } else {
            let term = st.election.term();
            effects
                .outbox
                .into_iter()
                .map(|payload| Envelope::new(self.peer_id.clone(), self.priority, term, payload))
                .collect()
        };
        Dispatch {
            envelopes,
            leader_changes: effects.leader_changes,
            slot_events: st.slots.drain_events(),
        }
    }

    /// Send and notify outside the lock. A failed send re-checks the mode
    /// and may step down, which can produce one more round of effects.
    async fn dispatch(&self, dispatch: Dispatch) {
        let mut next = Some(dispatch);
        let mut rounds = 0;

        while let Some(dispatch) = next.take() {
            rounds += 1;
            let mut failed = false;
            for envelope in dispatch.envelopes {
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Failed to encode {}: {}", envelope.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = self.transport.send(&self.topic, frame).await {
                    tracing::debug!("Dropped {} from {}: {}", envelope.kind(), self.peer_id, e);
                    failed = true;
                    break;
                }
            }

            for change in &dispatch.leader_changes {
                self.leader_events.notify(change);
            }
            for event in &dispatch.slot_events {
                self.slot_events.notify(event);
            }

            if failed && rounds < 2 {
                next = self.after_send_failure().await;
            }
        }
    }

    async fn after_send_failure(&self) -> Option<Dispatch> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let now = Instant::now();
        let mut effects = Effects::default();
        let mode = self.transport.mode();

        if mode == st.mode && st.election.is_leader() && mode != Mode::Standalone {
            tracing::warn!("Broadcast failed while leading term {}; stepping down", st.election.term());
            if let Some(change) = st.election.step_down(now) {
                st.apply_leader_change(change, now, &mut effects);
            }
        }
        st.apply_mode(mode, &self.config, now, &mut effects);
        Some(self.seal(st, effects))
    }

    async fn tick(&self) {
        let probe_due = {
            let mut st = self.state.lock().await;
            let now = Instant::now();
            let due = st.mode != Mode::Full
                && now.saturating_duration_since(st.last_probe) >= self.config.probe_interval();
            if due {
                st.last_probe = now;
            }
            due
        };
        if probe_due {
            self.transport.evaluate().await;
        }

        let dispatch = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let now = Instant::now();
            let mut effects = Effects::default();
            st.apply_mode(self.transport.mode(), &self.config, now, &mut effects);
            st.tick(now, &mut effects);
            self.seal(st, effects)
        };
        self.dispatch(dispatch).await;
    }

    async fn handle_frame(&self, frame: Vec<u8>) {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.corrupt_messages.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Discarding malformed frame: {}", e);
                return;
            }
        };
        if envelope.sender_id == self.peer_id {
            return;
        }

        let dispatch = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            if !st.joined || st.mode == Mode::Standalone {
                return;
            }
            let now = Instant::now();
            let mut effects = Effects::default();
            if !st.handle(&envelope, now, &mut effects) {
                self.stale_messages.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Discarding stale {} from {} (term {} < {})",
                    envelope.kind(),
                    envelope.sender_id,
                    envelope.term,
                    st.election.term()
                );
            }
            self.seal(st, effects)
        };
        self.dispatch(dispatch).await;
    }

    async fn heartbeat_period(&self) -> Duration {
        self.state.lock().await.timing.heartbeat_interval
    }

    async fn finish_query(&self, query_hash: &str, outcome: QueryOutcome) {
        let dispatch = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let mut effects = Effects::default();
            st.queries.complete(query_hash, outcome, &mut effects.outbox);
            self.seal(st, effects)
        };
        self.dispatch(dispatch).await;
    }
}

/// Background loop: heartbeat ticks and inbound frames
async fn run_loop(
    inner: Arc<Inner>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut period = inner.heartbeat_period().await;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.tick().await;
                let current = inner.heartbeat_period().await;
                if current != period {
                    tracing::debug!("Heartbeat period {:?} -> {:?}", period, current);
                    period = current;
                    ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
            frame = inbound.recv() => match frame {
                Some(frame) => inner.handle_frame(frame).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Event loop for {} stopped", inner.peer_id);
}

/// Finishes a locally executed query if the caller is dropped mid-run
struct ExecutionGuard {
    inner: Arc<Inner>,
    query_hash: String,
    armed: bool,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let query_hash = std::mem::take(&mut self.query_hash);
        handle.spawn(async move {
            inner
                .finish_query(&query_hash, QueryOutcome::Failed("executor cancelled".to_string()))
                .await;
        });
    }
}

fn decode_outcome<T: DeserializeOwned>(query_hash: &str, outcome: QueryOutcome) -> Result<T> {
    match outcome {
        QueryOutcome::Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        QueryOutcome::Failed(message) => Err(Error::QueryFailed(message)),
        QueryOutcome::Stale => Err(Error::StaleTicket(query_hash.to_string())),
    }
}

/// Coordination handle for one context
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator; nothing is sent until `join`
    pub fn new(config: CoordConfig, transports: Transports) -> Result<Self> {
        config.validate()?;
        let peer_id = config.resolve_peer_id();
        let priority = config.node.priority;
        let timing = config.timing(Mode::Full);
        let now = Instant::now();

        let state = ContextState {
            registry: PeerRegistry::new(peer_id.clone(), priority, timing.liveness_timeout),
            election: LeaderElection::new(peer_id.clone(), priority, timing.election_window, now),
            leases: WriteCoordinator::new(peer_id.clone()),
            queries: QueryDeduplicator::new(peer_id.clone()),
            slots: SlotManager::new(peer_id.clone(), priority),
            mode: Mode::Full,
            timing,
            joined: false,
            last_probe: now,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                topic: config.topic(),
                peer_id,
                priority,
                config,
                transport: DegradationManager::new(transports),
                state: Mutex::new(state),
                lifecycle: Mutex::new(Lifecycle::default()),
                leader_events: Subscribers::new(),
                slot_events: Subscribers::new(),
                corrupt_messages: AtomicU64::new(0),
                stale_messages: AtomicU64::new(0),
            }),
        })
    }

    /// This context's ID
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Configuration in use
    pub fn config(&self) -> &CoordConfig {
        &self.inner.config
    }

    /// Probe the transports, subscribe and start the event loop
    pub async fn join(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if lifecycle.task.is_some() {
            return Ok(());
        }
        if inner.state.lock().await.election.state() == ElectionState::Disconnected {
            return Err(Error::ShuttingDown);
        }

        let report = inner.transport.initialize().await;

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handler: MessageHandler = Arc::new(move |frame: Vec<u8>| {
            let _ = tx.send(frame);
        });
        let unsubscribe = inner.transport.subscribe(&inner.topic, handler)?;

        let dispatch = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            let now = Instant::now();
            let mut effects = Effects::default();
            st.apply_mode(report.mode, &inner.config, now, &mut effects);
            st.joined = true;
            st.last_probe = now;
            inner.seal(st, effects)
        };
        inner.dispatch(dispatch).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        lifecycle.task = Some(tokio::spawn(run_loop(Arc::clone(inner), rx, shutdown_rx)));
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.unsubscribe = Some(unsubscribe);

        tracing::info!(
            "Context {} joined {} (priority {}, {} mode)",
            inner.peer_id,
            inner.topic,
            inner.priority,
            report.mode
        );
        Ok(())
    }

    /// Release everything held, announce departure and stop the event loop
    pub async fn leave(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        let Some(task) = lifecycle.task.take() else {
            return Ok(());
        };

        let dispatch = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            let mut effects = Effects::default();
            st.leases.release_all(&mut effects.outbox);
            st.slots.release_all(&mut effects.outbox);
            effects.outbox.push(Payload::Leave);
            let mut dispatch = inner.seal(st, effects);
            if let Some(change) = st.election.disconnect() {
                dispatch.leader_changes.push(change);
            }
            st.joined = false;
            dispatch
        };
        inner.dispatch(dispatch).await;

        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Err(e) = task.await {
            tracing::warn!("Event loop ended abnormally: {}", e);
        }
        if let Some(unsubscribe) = lifecycle.unsubscribe.take() {
            unsubscribe.unsubscribe();
        }

        tracing::info!("Context {} left {}", inner.peer_id, inner.topic);
        Ok(())
    }

    /// Check if this context is the leader
    pub async fn is_leader(&self) -> bool {
        self.inner.state.lock().await.election.is_leader()
    }

    /// Believed leader and its term
    pub async fn leader(&self) -> Option<(PeerId, Term)> {
        let st = self.inner.state.lock().await;
        st.election
            .leader()
            .map(|id| (id.to_string(), st.election.term()))
    }

    /// Live contexts other than this one, best rank first
    pub async fn live_peers(&self) -> Vec<PeerId> {
        let st = self.inner.state.lock().await;
        st.registry
            .list_live(Instant::now())
            .into_iter()
            .map(|p| p.id.clone())
            .collect()
    }

    /// Acquire a fenced lease on `resource_key`
    pub async fn acquire_write_lock(&self, resource_key: &str, options: LockOptions) -> Result<AcquireOutcome> {
        let (default_hold, backoff) = {
            let st = self.inner.state.lock().await;
            (st.timing.lease_hold, st.timing.heartbeat_interval)
        };
        let hold = options.hold.unwrap_or(default_hold);
        let deadline = options.wait.map(|wait| Instant::now() + wait);

        loop {
            let outcome = self.try_acquire(resource_key, hold).await?;
            let Some(deadline) = deadline else {
                return Ok(outcome);
            };
            let now = Instant::now();
            if outcome.is_granted() || now >= deadline {
                return Ok(outcome);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
        }
    }

    async fn try_acquire(&self, resource_key: &str, hold: Duration) -> Result<AcquireOutcome> {
        let inner = &self.inner;
        let (attempt, dispatch, timeout) = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            st.ensure_joined()?;
            let now = Instant::now();
            let mut effects = Effects::default();
            let view = ClusterView::of(&st.registry, &st.election, now);

            let attempt = if view.is_leader {
                Attempt::Decided(st.leases.grant_local(resource_key, hold, &view, &mut effects.outbox))
            } else if view.live_leader().is_some() {
                let (request_id, receiver) = st.leases.request(resource_key, hold, None, now, &mut effects.outbox);
                Attempt::Waiting(request_id, receiver)
            } else {
                Attempt::Decided(AcquireOutcome::Denied(Denial::NoLeader))
            };
            (attempt, inner.seal(st, effects), st.timing.request_timeout)
        };
        inner.dispatch(dispatch).await;

        let (request_id, receiver) = match attempt {
            Attempt::Decided(outcome) => return Ok(outcome),
            Attempt::Waiting(request_id, receiver) => (request_id, receiver),
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(LeaseReply::Granted(lease))) => Ok(AcquireOutcome::Granted(lease)),
            Ok(Ok(LeaseReply::Denied(DenyReason::Held { holder, remaining_ms }))) => {
                Ok(AcquireOutcome::Denied(Denial::Held {
                    holder,
                    remaining: Duration::from_millis(remaining_ms),
                }))
            }
            Ok(Ok(LeaseReply::Denied(DenyReason::Expired))) | Ok(Err(_)) => {
                Ok(AcquireOutcome::Denied(Denial::NoLeader))
            }
            Err(_) => {
                inner.state.lock().await.leases.cancel(request_id);
                Ok(AcquireOutcome::Denied(Denial::Timeout))
            }
        }
    }

    /// Extend a held lease by its hold duration
    pub async fn refresh_lease(&self, lease: &Lease) -> Result<Lease> {
        let inner = &self.inner;
        let expired = || Error::Expired {
            resource_key: lease.resource_key.clone(),
        };

        let (attempt, dispatch, timeout) = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            st.ensure_joined()?;
            let now = Instant::now();
            if !st.leases.holds(lease, now) {
                return Err(expired());
            }
            let mut effects = Effects::default();
            let view = ClusterView::of(&st.registry, &st.election, now);

            let attempt = if view.is_leader {
                Attempt::Decided(st.leases.renew_local(lease, &view, &mut effects.outbox))
            } else if view.live_leader().is_some() {
                let (request_id, receiver) = st.leases.request(
                    &lease.resource_key,
                    lease.hold,
                    Some(lease.fencing_token),
                    now,
                    &mut effects.outbox,
                );
                Attempt::Waiting(request_id, receiver)
            } else {
                // Nobody can extend it; it stays valid until it expires
                Attempt::Decided(Some(lease.clone()))
            };
            (attempt, inner.seal(st, effects), st.timing.request_timeout)
        };
        inner.dispatch(dispatch).await;

        let (request_id, receiver) = match attempt {
            Attempt::Decided(renewed) => return renewed.ok_or_else(expired),
            Attempt::Waiting(request_id, receiver) => (request_id, receiver),
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(LeaseReply::Granted(renewed))) => Ok(renewed),
            Ok(Ok(LeaseReply::Denied(_))) => {
                inner.state.lock().await.leases.forget(&lease.resource_key);
                Err(expired())
            }
            Ok(Err(_)) | Err(_) => {
                inner.state.lock().await.leases.cancel(request_id);
                if lease.is_expired(Instant::now()) {
                    Err(expired())
                } else {
                    tracing::warn!("Could not refresh lease on {}; keeping current expiry", lease.resource_key);
                    Ok(lease.clone())
                }
            }
        }
    }

    /// Give a lease back
    pub async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let inner = &self.inner;
        let dispatch = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            let mut effects = Effects::default();
            if !st.leases.release(lease, &mut effects.outbox) {
                tracing::debug!("Release of {} ignored: not held", lease.resource_key);
            }
            inner.seal(st, effects)
        };
        inner.dispatch(dispatch).await;
        Ok(())
    }

    /// Run `execute` at most once across all contexts asking for
    /// `query_hash` at the same time; everyone gets the same result
    pub async fn run_deduped<T, E, F, Fut>(&self, query_hash: &str, execute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let inner = &self.inner;
        let enlisted = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            st.ensure_joined()?;
            if st.mode == Mode::Standalone {
                None
            } else {
                let mut effects = Effects::default();
                let view = ClusterView::of(&st.registry, &st.election, Instant::now());
                let enlisted = st.queries.enlist(query_hash, &view, &mut effects.outbox);
                Some((enlisted, inner.seal(st, effects), st.timing.dedup_timeout))
            }
        };

        let Some((enlisted, dispatch, dedup_timeout)) = enlisted else {
            return execute().await.map_err(|e| Error::QueryFailed(e.to_string()));
        };
        inner.dispatch(dispatch).await;

        let mut receiver = match enlisted {
            Enlisted::Execute => return self.execute_query(query_hash, execute).await,
            Enlisted::Wait(receiver) => receiver,
        };

        loop {
            match tokio::time::timeout(dedup_timeout, &mut receiver).await {
                Ok(Ok(WaiterSignal::Execute)) => return self.execute_query(query_hash, execute).await,
                Ok(Ok(WaiterSignal::Finished(outcome))) => return decode_outcome(query_hash, outcome),
                Ok(Err(_)) => return Err(Error::StaleTicket(query_hash.to_string())),
                Err(_) => {
                    let st = inner.state.lock().await;
                    if st.queries.made_progress(query_hash, Instant::now(), dedup_timeout) {
                        continue;
                    }
                    break;
                }
            }
        }

        drop(receiver);
        inner.state.lock().await.queries.abandon(query_hash);
        tracing::warn!("Gave up waiting for query {} after {:?}", query_hash, dedup_timeout);
        Err(Error::StaleTicket(query_hash.to_string()))
    }

    async fn execute_query<T, E, F, Fut>(&self, query_hash: &str, execute: F) -> Result<T>
    where
        T: Serialize,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut guard = ExecutionGuard {
            inner: Arc::clone(&self.inner),
            query_hash: query_hash.to_string(),
            armed: true,
        };
        let result = execute().await;
        guard.armed = false;

        let outcome = match &result {
            Ok(value) => match serde_json::to_vec(value) {
                Ok(bytes) => QueryOutcome::Ok(bytes),
                Err(e) => QueryOutcome::Failed(format!("result encoding failed: {}", e)),
            },
            Err(e) => QueryOutcome::Failed(e.to_string()),
        };
        self.inner.finish_query(query_hash, outcome).await;
        result.map_err(|e| Error::QueryFailed(e.to_string()))
    }

    /// Claim the live connection to a remote sync endpoint
    pub async fn claim_sync_slot(&self, endpoint_id: &str) -> Result<SlotClaim> {
        let inner = &self.inner;
        let (claim, dispatch) = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            st.ensure_joined()?;
            let mut effects = Effects::default();
            let view = ClusterView::of(&st.registry, &st.election, Instant::now());
            let claim = st.slots.claim(endpoint_id, &view, &mut effects.outbox);
            (claim, inner.seal(st, effects))
        };
        inner.dispatch(dispatch).await;
        Ok(claim)
    }

    /// Stop syncing an endpoint
    pub async fn release_sync_slot(&self, endpoint_id: &str) -> Result<()> {
        let inner = &self.inner;
        let dispatch = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            let mut effects = Effects::default();
            st.slots.release(endpoint_id, &mut effects.outbox);
            inner.seal(st, effects)
        };
        inner.dispatch(dispatch).await;
        Ok(())
    }

    /// Current capabilities and mode
    pub fn capabilities(&self) -> CapabilityReport {
        self.inner.transport.report()
    }

    /// Called with every leader change
    pub fn on_leader_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LeaderChange) + Send + Sync + 'static,
    {
        self.inner.leader_events.subscribe(handler)
    }

    /// Called once per operating-mode transition
    pub fn on_capability_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CapabilityChange) + Send + Sync + 'static,
    {
        self.inner.transport.on_change(handler)
    }

    /// Called when this context gains or loses a sync slot
    pub fn on_slot_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SlotEvent) + Send + Sync + 'static,
    {
        self.inner.slot_events.subscribe(handler)
    }

    /// Remove any handler registered through this coordinator
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.leader_events.unsubscribe(id)
            || self.inner.slot_events.unsubscribe(id)
            || self.inner.transport.unsubscribe(id)
    }

    /// Snapshot for diagnostics
    pub async fn stats(&self) -> CoordinatorStats {
        let st = self.inner.state.lock().await;
        let now = Instant::now();
        CoordinatorStats {
            peer_id: self.inner.peer_id.clone(),
            priority: st.registry.self_priority(),
            mode: st.mode,
            role: st.election.state().role(),
            term: st.election.term(),
            leader_id: st.election.leader().map(str::to_string),
            live_peers: st.registry.live_count(now),
            held_leases: st.leases.held_count(),
            held_slots: st.slots.held(),
            open_tickets: st.queries.ticket_count(),
            pending_requests: st.leases.pending_count() + st.queries.pending_requests(),
            corrupt_messages: self.inner.corrupt_messages.load(Ordering::Relaxed),
            stale_messages: self.inner.stale_messages.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBus;

    fn config(id: &str, priority: u32) -> CoordConfig {
        let mut config = CoordConfig::default();
        config.node.id = Some(id.to_string());
        config.node.priority = priority;
        config.coordination.heartbeat_interval_ms = 100;
        config.fallback.enabled = false;
        config
    }

    fn coordinator(bus: &MemoryBus, id: &str, priority: u32) -> Coordinator {
        let transport: Arc<dyn Transport> = Arc::new(bus.endpoint());
        Coordinator::new(config(id, priority), Transports::primary(transport)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_join() {
        let bus = MemoryBus::new();
        let a = coordinator(&bus, "a", 1);
        assert!(matches!(
            a.acquire_write_lock("x", LockOptions::default()).await,
            Err(Error::NotJoined)
        ));
        assert!(matches!(a.claim_sync_slot("ep").await, Err(Error::NotJoined)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_context_becomes_leader() {
        let bus = MemoryBus::new();
        let a = coordinator(&bus, "a", 1);
        a.join().await.unwrap();
        assert!(!a.is_leader().await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(a.is_leader().await);
        assert_eq!(a.leader().await, Some(("a".to_string(), 1)));

        let lease = a
            .acquire_write_lock("todos", LockOptions::default())
            .await
            .unwrap()
            .lease()
            .unwrap();
        assert_eq!(lease.fencing_token, 1);
        a.release_lease(&lease).await.unwrap();

        let stats = a.stats().await;
        assert_eq!(stats.priority, 1);
        assert_eq!(stats.live_peers, 1);
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.held_leases, 0);
        a.leave().await.unwrap();
        assert!(matches!(a.join().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_frames_are_counted() {
        let bus = MemoryBus::new();
        let a = coordinator(&bus, "a", 1);
        a.join().await.unwrap();

        bus.inject("wolfcoord/default", b"definitely not a frame");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.stats().await.corrupt_messages, 1);
        a.leave().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_without_transport() {
        let bus = MemoryBus::new();
        let endpoint = Arc::new(bus.endpoint());
        endpoint.set_online(false);
        let transport: Arc<dyn Transport> = endpoint.clone();
        let a = Coordinator::new(config("a", 1), Transports::primary(transport)).unwrap();
        a.join().await.unwrap();

        let report = a.capabilities();
        assert_eq!(report.mode, Mode::Standalone);
        assert!(report.duplicate_write_risk());
        assert!(a.is_leader().await);

        let value: u32 = a
            .run_deduped("q", || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(a
            .acquire_write_lock("x", LockOptions::default())
            .await
            .unwrap()
            .is_granted());
        assert_eq!(a.claim_sync_slot("ep").await.unwrap(), SlotClaim::Granted);
    }
}
