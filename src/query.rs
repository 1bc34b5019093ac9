//! Query Deduplicator
//!
//! Collapses identical expensive operations issued from several contexts
//! into one execution. The leader owns a ticket per query hash and names a
//! single executor; every other caller waits for the broadcast result. If
//! the executor dies the ticket is reopened for the next waiter in arrival
//! order, and a ticket that makes no progress for the dedup timeout is
//! failed so its waiters can retry.
//!
//! Within one context identical calls are coalesced before any message is
//! sent.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::{Payload, PeerId, QueryOutcome, RequestId};
use crate::state::ClusterView;

/// Ticket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// Executor named, no progress seen yet
    Pending,
    /// Executor reported the query running
    Running,
}

/// The leader's (and replicas') record of one in-flight query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTicket {
    pub query_hash: String,
    /// Context that first asked
    pub origin: PeerId,
    pub executor: PeerId,
    pub state: TicketState,
    /// Other contexts waiting, in arrival order
    pub waiters: Vec<PeerId>,
    pub created_at: Instant,
    /// Last sign of life from the executor
    pub progress_at: Instant,
}

/// Sent to a local caller waiting on a query
#[derive(Debug)]
pub(crate) enum WaiterSignal {
    /// This caller must run the query itself
    Execute,
    /// The query finished elsewhere
    Finished(QueryOutcome),
}

/// What a local caller should do after enlisting
#[derive(Debug)]
pub(crate) enum Enlisted {
    /// Run the query now
    Execute,
    /// Wait for a signal
    Wait(oneshot::Receiver<WaiterSignal>),
}

/// Local bookkeeping for one hash
#[derive(Debug, Default)]
struct LocalQuery {
    /// A local caller is running the query
    executing: bool,
    /// Callers waiting, in arrival order
    waiters: VecDeque<oneshot::Sender<WaiterSignal>>,
}

/// A QueryStart the leader has not answered yet
#[derive(Debug)]
struct PendingStart {
    query_hash: String,
    sent_at: Instant,
}

/// Query dedup state for one context
pub struct QueryDeduplicator {
    self_id: PeerId,
    /// Tickets known to this context (authoritative on the leader)
    tickets: HashMap<String, QueryTicket>,
    /// Calls made from this context
    local: HashMap<String, LocalQuery>,
    /// Outstanding QueryStart requests
    pending: HashMap<RequestId, PendingStart>,
    next_request: RequestId,
}

impl QueryDeduplicator {
    /// Create an empty deduplicator
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            tickets: HashMap::new(),
            local: HashMap::new(),
            pending: HashMap::new(),
            next_request: 1,
        }
    }

    /// Get a ticket
    pub fn ticket(&self, query_hash: &str) -> Option<&QueryTicket> {
        self.tickets.get(query_hash)
    }

    /// Number of known tickets
    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    /// Hashes this context is executing, advertised on heartbeats
    pub fn running_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .local
            .iter()
            .filter(|(_, q)| q.executing)
            .map(|(hash, _)| hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    /// Register a local call
    pub(crate) fn enlist(&mut self, query_hash: &str, view: &ClusterView<'_>, out: &mut Vec<Payload>) -> Enlisted {
        if let Some(local) = self.local.get_mut(query_hash) {
            let (tx, rx) = oneshot::channel();
            local.waiters.push_back(tx);
            return Enlisted::Wait(rx);
        }

        if view.is_leader {
            let self_id = self.self_id.clone();
            let executor = self.assign(&self_id, query_hash, None, view, out);
            if executor == self.self_id {
                self.local.insert(
                    query_hash.to_string(),
                    LocalQuery {
                        executing: true,
                        waiters: VecDeque::new(),
                    },
                );
                return Enlisted::Execute;
            }
            return self.wait_locally(query_hash);
        }

        if view.live_leader().is_none() {
            tracing::warn!("No leader for query {}; executing locally", query_hash);
            self.local.insert(
                query_hash.to_string(),
                LocalQuery {
                    executing: true,
                    waiters: VecDeque::new(),
                },
            );
            return Enlisted::Execute;
        }

        self.request(query_hash, view.now, out);
        self.wait_locally(query_hash)
    }

    /// Ask the leader for a ticket
    fn request(&mut self, query_hash: &str, now: Instant, out: &mut Vec<Payload>) {
        let request_id = self.next_request;
        self.next_request += 1;
        self.pending.insert(
            request_id,
            PendingStart {
                query_hash: query_hash.to_string(),
                sent_at: now,
            },
        );
        out.push(Payload::QueryStart {
            request_id,
            query_hash: query_hash.to_string(),
        });
    }

    /// Number of QueryStart requests still waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Retry requests the leader left unanswered for `request_timeout`.
    /// A leader (possibly this context, elected meanwhile) is asked again;
    /// with no live leader the first local waiter runs the query.
    pub(crate) fn expire_requests(&mut self, view: &ClusterView<'_>, request_timeout: Duration, out: &mut Vec<Payload>) {
        let mut expired: Vec<String> = Vec::new();
        self.pending.retain(|_, start| {
            if view.now.saturating_duration_since(start.sent_at) < request_timeout {
                return true;
            }
            if !expired.contains(&start.query_hash) {
                expired.push(start.query_hash.clone());
            }
            false
        });

        for hash in expired {
            let waiting = self
                .local
                .get(&hash)
                .map(|q| !q.executing && q.waiters.iter().any(|w| !w.is_closed()))
                .unwrap_or(false);
            let outstanding = self.pending.values().any(|p| p.query_hash == hash);
            if !waiting || outstanding {
                continue;
            }

            if view.is_leader {
                let self_id = self.self_id.clone();
                let executor = self.assign(&self_id, &hash, None, view, out);
                if executor == self.self_id {
                    self.signal_execute(&hash, out);
                }
            } else if view.live_leader().is_some() {
                tracing::debug!("No answer for query {}; asking the leader again", hash);
                self.request(&hash, view.now, out);
            } else {
                tracing::warn!("No answer for query {} and no leader; executing locally", hash);
                self.signal_execute(&hash, out);
            }
        }
    }

    fn wait_locally(&mut self, query_hash: &str) -> Enlisted {
        let (tx, rx) = oneshot::channel();
        let local = self.local.entry(query_hash.to_string()).or_default();
        local.waiters.push_back(tx);
        Enlisted::Wait(rx)
    }

    /// Leader: name the executor for `requester`, broadcasting the decision
    fn assign(
        &mut self,
        requester: &str,
        query_hash: &str,
        request_id: Option<RequestId>,
        view: &ClusterView<'_>,
        out: &mut Vec<Payload>,
    ) -> PeerId {
        let executor = match self.tickets.get_mut(query_hash) {
            Some(ticket) if view.is_live(&ticket.executor) => {
                if ticket.executor != requester && !ticket.waiters.iter().any(|w| w == requester) {
                    ticket.waiters.push(requester.to_string());
                }
                ticket.executor.clone()
            }
            Some(ticket) => {
                // Executor is gone; the requester takes over
                ticket.executor = requester.to_string();
                ticket.state = TicketState::Pending;
                ticket.progress_at = view.now;
                ticket.waiters.retain(|w| w != requester);
                requester.to_string()
            }
            None => {
                self.tickets.insert(
                    query_hash.to_string(),
                    QueryTicket {
                        query_hash: query_hash.to_string(),
                        origin: requester.to_string(),
                        executor: requester.to_string(),
                        state: TicketState::Pending,
                        waiters: Vec::new(),
                        created_at: view.now,
                        progress_at: view.now,
                    },
                );
                requester.to_string()
            }
        };

        out.push(Payload::QueryAssign {
            request_id,
            requester: requester.to_string(),
            query_hash: query_hash.to_string(),
            executor: executor.clone(),
            reopened: false,
        });
        executor
    }

    /// Leader: a peer asked for a ticket
    pub fn handle_start(
        &mut self,
        requester: &str,
        request_id: RequestId,
        query_hash: &str,
        view: &ClusterView<'_>,
        out: &mut Vec<Payload>,
    ) {
        let executor = self.assign(requester, query_hash, Some(request_id), view, out);
        tracing::debug!("Query {} from {} assigned to {}", query_hash, requester, executor);
    }

    /// Apply an assignment broadcast by the leader
    pub fn apply_assign(
        &mut self,
        request_id: Option<RequestId>,
        requester: &str,
        query_hash: &str,
        executor: &str,
        reopened: bool,
        now: Instant,
        out: &mut Vec<Payload>,
    ) {
        let ticket = self
            .tickets
            .entry(query_hash.to_string())
            .or_insert_with(|| QueryTicket {
                query_hash: query_hash.to_string(),
                origin: requester.to_string(),
                executor: executor.to_string(),
                state: TicketState::Pending,
                waiters: Vec::new(),
                created_at: now,
                progress_at: now,
            });
        if ticket.executor != executor {
            ticket.executor = executor.to_string();
            ticket.state = TicketState::Pending;
            ticket.progress_at = now;
        }
        ticket.waiters.retain(|w| w != executor);
        if requester != executor && !ticket.waiters.iter().any(|w| w == requester) {
            ticket.waiters.push(requester.to_string());
        }

        if requester == self.self_id {
            match request_id {
                Some(id) => {
                    self.pending.remove(&id);
                }
                None => self.pending.retain(|_, p| p.query_hash != query_hash),
            }
        }

        let ours = executor == self.self_id;
        let asked = requester == self.self_id || reopened;
        if ours && asked {
            self.signal_execute(query_hash, out);
        }
    }

    /// Hand execution to the first local waiter still listening
    fn signal_execute(&mut self, query_hash: &str, out: &mut Vec<Payload>) {
        let Some(local) = self.local.get_mut(query_hash) else {
            tracing::debug!("Assigned query {} with no local caller; declining", query_hash);
            self.decline(query_hash, out);
            return;
        };
        if local.executing {
            return;
        }

        while let Some(waiter) = local.waiters.pop_front() {
            if waiter.send(WaiterSignal::Execute).is_ok() {
                local.executing = true;
                return;
            }
        }

        self.local.remove(query_hash);
        self.decline(query_hash, out);
    }

    /// Give up a ticket nobody here can run, so waiters elsewhere retry
    fn decline(&mut self, query_hash: &str, out: &mut Vec<Payload>) {
        self.tickets.remove(query_hash);
        out.push(Payload::QueryResult {
            query_hash: query_hash.to_string(),
            executor: self.self_id.clone(),
            outcome: QueryOutcome::Stale,
        });
    }

    /// The local executor finished; resolve local waiters and broadcast
    pub(crate) fn complete(&mut self, query_hash: &str, outcome: QueryOutcome, out: &mut Vec<Payload>) {
        if let Some(local) = self.local.remove(query_hash) {
            for waiter in local.waiters {
                let _ = waiter.send(WaiterSignal::Finished(outcome.clone()));
            }
        }
        self.tickets.remove(query_hash);
        self.pending.retain(|_, p| p.query_hash != query_hash);
        out.push(Payload::QueryResult {
            query_hash: query_hash.to_string(),
            executor: self.self_id.clone(),
            outcome,
        });
    }

    /// Apply a result broadcast by an executor
    pub fn apply_result(&mut self, query_hash: &str, executor: &str, outcome: QueryOutcome) {
        let current = self.tickets.get(query_hash).map(|t| t.executor.clone());
        if outcome == QueryOutcome::Stale && current.as_deref().map(|e| e != executor).unwrap_or(false) {
            // A declined assignment that has since been reassigned
            return;
        }
        self.tickets.remove(query_hash);
        self.pending.retain(|_, p| p.query_hash != query_hash);

        if let Some(local) = self.local.get_mut(query_hash) {
            for waiter in local.waiters.drain(..) {
                let _ = waiter.send(WaiterSignal::Finished(outcome.clone()));
            }
            if !local.executing {
                self.local.remove(query_hash);
            }
        }
    }

    /// Executor heartbeat listing the queries it is running
    pub fn observe_running(&mut self, executor: &str, hashes: &[String], now: Instant) {
        for hash in hashes {
            if let Some(ticket) = self.tickets.get_mut(hash) {
                if ticket.executor == executor {
                    ticket.state = TicketState::Running;
                    ticket.progress_at = now;
                }
            }
        }
    }

    /// Check whether the ticket for `query_hash` made progress within `window`
    pub fn made_progress(&self, query_hash: &str, now: Instant, window: Duration) -> bool {
        self.tickets
            .get(query_hash)
            .map(|t| now.saturating_duration_since(t.progress_at) < window)
            .unwrap_or(false)
    }

    /// A local caller stopped waiting
    pub(crate) fn abandon(&mut self, query_hash: &str) {
        let empty = match self.local.get_mut(query_hash) {
            Some(local) => {
                local.waiters.retain(|w| !w.is_closed());
                local.waiters.is_empty() && !local.executing
            }
            None => false,
        };
        if empty {
            self.local.remove(query_hash);
            self.pending.retain(|_, p| p.query_hash != query_hash);
        }
    }

    /// Coordination is gone; every local caller still waiting on another
    /// context runs its query itself
    pub(crate) fn take_over_local(&mut self) {
        self.tickets.clear();
        self.pending.clear();
        let waiting: Vec<String> = self
            .local
            .iter()
            .filter(|(_, q)| !q.executing)
            .map(|(hash, _)| hash.clone())
            .collect();
        let mut discarded = Vec::new();
        for hash in waiting {
            self.signal_execute(&hash, &mut discarded);
        }
    }

    /// Drop a departed peer from every waiter list
    pub fn on_peer_removed(&mut self, peer_id: &str) {
        for ticket in self.tickets.values_mut() {
            ticket.waiters.retain(|w| w != peer_id);
        }
    }

    /// Periodic maintenance. The leader reopens tickets whose executor died
    /// and fails tickets that stopped making progress.
    pub fn sweep(&mut self, view: &ClusterView<'_>, dedup_timeout: Duration, out: &mut Vec<Payload>) {
        if !view.is_leader {
            // Replicas forget tickets the leader has evidently dropped
            self.tickets
                .retain(|_, t| view.now.saturating_duration_since(t.progress_at) < dedup_timeout * 2);
            return;
        }

        let hashes: Vec<String> = self.tickets.keys().cloned().collect();
        for hash in hashes {
            let Some(ticket) = self.tickets.get_mut(&hash) else {
                continue;
            };

            // The leader's own running queries count as progress
            let running_here =
                ticket.executor == self.self_id && self.local.get(&hash).map(|q| q.executing).unwrap_or(false);
            if running_here {
                ticket.progress_at = view.now;
                continue;
            }

            if view.now.saturating_duration_since(ticket.progress_at) >= dedup_timeout {
                tracing::warn!("Query {} made no progress on {}; failing ticket", hash, ticket.executor);
                let executor = ticket.executor.clone();
                self.tickets.remove(&hash);
                out.push(Payload::QueryResult {
                    query_hash: hash.clone(),
                    executor: executor.clone(),
                    outcome: QueryOutcome::Stale,
                });
                self.apply_result(&hash, &executor, QueryOutcome::Stale);
                continue;
            }

            if view.is_live(&ticket.executor) {
                continue;
            }

            let next = ticket.waiters.iter().position(|w| view.is_live(w));
            match next {
                Some(index) => {
                    let successor = ticket.waiters.remove(index);
                    tracing::info!(
                        "Executor {} of query {} is gone; reopening for {}",
                        ticket.executor,
                        hash,
                        successor
                    );
                    ticket.executor = successor.clone();
                    ticket.state = TicketState::Pending;
                    ticket.progress_at = view.now;
                    out.push(Payload::QueryAssign {
                        request_id: None,
                        requester: successor.clone(),
                        query_hash: hash.clone(),
                        executor: successor.clone(),
                        reopened: true,
                    });
                    if successor == self.self_id {
                        self.signal_execute(&hash, out);
                    }
                }
                None => {
                    let local_waiting = self.local.get(&hash).map(|q| !q.waiters.is_empty()).unwrap_or(false);
                    if local_waiting {
                        // The leader itself is waiting; it takes over
                        ticket.executor = self.self_id.clone();
                        ticket.state = TicketState::Pending;
                        ticket.progress_at = view.now;
                        out.push(Payload::QueryAssign {
                            request_id: None,
                            requester: self.self_id.clone(),
                            query_hash: hash.clone(),
                            executor: self.self_id.clone(),
                            reopened: true,
                        });
                        self.signal_execute(&hash, out);
                    } else {
                        tracing::debug!("Dropping query {}: executor and waiters are gone", hash);
                        self.tickets.remove(&hash);
                    }
                }
            }
        }
    }
}
