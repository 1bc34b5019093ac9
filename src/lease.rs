//! Write Coordinator
//!
//! Fenced, time-bounded leases over named resources. The leader decides
//! every grant; each context keeps a replica of the lease table built from
//! broadcast grants, releases and heartbeat advertisements, so fencing
//! tokens keep increasing across leader changes.
//!
//! A lease is valid until its expiry or until its holder stops being live,
//! whichever comes first. A holder that may have outlived its lease (a
//! suspended context, say) can still act on a stale token; downstream
//! writers must compare fencing tokens and reject the lower one.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::{DenyReason, HeldLease, Payload, PeerId, RequestId, Term};
use crate::state::ClusterView;

/// A granted lease, as seen by its holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_key: String,
    pub holder_id: PeerId,
    /// Term of the leader that granted it
    pub term: Term,
    /// Strictly increasing per resource
    pub fencing_token: u64,
    /// Local expiry, measured from when the request was sent
    pub expires_at: Instant,
    /// Requested hold, reused on refresh
    pub hold: Duration,
}

impl Lease {
    /// Check whether the lease has run out
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Why an acquisition did not produce a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// Someone else holds the resource
    Held { holder: PeerId, remaining: Duration },
    /// No leader is known to ask
    NoLeader,
    /// The leader did not answer in time
    Timeout,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::Held { holder, remaining } => {
                write!(f, "held by {} for another {:?}", holder, remaining)
            }
            Denial::NoLeader => write!(f, "no leader"),
            Denial::Timeout => write!(f, "leader did not answer"),
        }
    }
}

/// Result of `acquire_write_lock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(Lease),
    Denied(Denial),
}

impl AcquireOutcome {
    /// Check if a lease was granted
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted(_))
    }

    /// The lease, if granted
    pub fn lease(self) -> Option<Lease> {
        match self {
            AcquireOutcome::Granted(lease) => Some(lease),
            AcquireOutcome::Denied(_) => None,
        }
    }
}

/// Options for `acquire_write_lock`
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Lease duration; the configured default when unset
    pub hold: Option<Duration>,
    /// Keep retrying until this much time has passed
    pub wait: Option<Duration>,
}

impl LockOptions {
    /// Set the hold duration
    pub fn hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Retry for up to `wait`
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// Replica entry for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: PeerId,
    pub term: Term,
    pub fencing_token: u64,
    pub expires_at: Instant,
}

/// Leader's answer to a pending request, delivered to the waiting caller
#[derive(Debug)]
pub(crate) enum LeaseReply {
    Granted(Lease),
    Denied(DenyReason),
}

struct PendingLease {
    resource_key: String,
    sent_at: Instant,
    hold: Duration,
    reply: oneshot::Sender<LeaseReply>,
}

/// Authority decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Grant { fencing_token: u64 },
    Deny(DenyReason),
}

/// Lease state for one context
pub struct WriteCoordinator {
    self_id: PeerId,
    /// Replica of every known lease
    records: HashMap<String, LeaseRecord>,
    /// Highest fencing token ever seen per resource
    tokens: HashMap<String, u64>,
    /// Leases this context holds
    held: HashMap<String, Lease>,
    /// Requests awaiting the leader's answer
    pending: HashMap<RequestId, PendingLease>,
    next_request: RequestId,
}

impl WriteCoordinator {
    /// Create an empty coordinator
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            records: HashMap::new(),
            tokens: HashMap::new(),
            held: HashMap::new(),
            pending: HashMap::new(),
            next_request: 1,
        }
    }

    /// Replica record for a resource, if still valid
    pub fn active_record(&self, resource_key: &str, view: &ClusterView<'_>) -> Option<&LeaseRecord> {
        self.records
            .get(resource_key)
            .filter(|r| r.expires_at > view.now && view.is_live(&r.holder))
    }

    /// Highest fencing token seen for a resource
    pub fn high_water(&self, resource_key: &str) -> u64 {
        self.tokens.get(resource_key).copied().unwrap_or(0)
    }

    fn raise_token(&mut self, resource_key: &str, token: u64) {
        let entry = self.tokens.entry(resource_key.to_string()).or_insert(0);
        if token > *entry {
            *entry = token;
        }
    }

    /// Grant/deny logic; only the leader (or a standalone context) calls this
    fn decide(
        &mut self,
        requester: &str,
        resource_key: &str,
        hold: Duration,
        renew_token: Option<u64>,
        view: &ClusterView<'_>,
    ) -> Decision {
        let active = self.active_record(resource_key, view).cloned();

        match (renew_token, active) {
            (Some(token), Some(record)) if record.holder == requester && record.fencing_token == token => {
                self.extend(resource_key, view.now + hold);
                Decision::Grant { fencing_token: token }
            }
            (Some(_), _) => Decision::Deny(DenyReason::Expired),
            (None, Some(record)) if record.holder == requester => {
                // Re-acquire by the current holder keeps its token
                self.extend(resource_key, view.now + hold);
                Decision::Grant {
                    fencing_token: record.fencing_token,
                }
            }
            (None, Some(record)) => Decision::Deny(DenyReason::Held {
                remaining_ms: record.expires_at.saturating_duration_since(view.now).as_millis() as u64,
                holder: record.holder,
            }),
            (None, None) => {
                let fencing_token = self.high_water(resource_key) + 1;
                self.raise_token(resource_key, fencing_token);
                self.records.insert(
                    resource_key.to_string(),
                    LeaseRecord {
                        holder: requester.to_string(),
                        term: view.term,
                        fencing_token,
                        expires_at: view.now + hold,
                    },
                );
                Decision::Grant { fencing_token }
            }
        }
    }

    fn extend(&mut self, resource_key: &str, expires_at: Instant) {
        if let Some(record) = self.records.get_mut(resource_key) {
            record.expires_at = expires_at;
        }
    }

    /// Acquire as the leader (or while standalone): decide locally and
    /// broadcast the grant so replicas learn the token
    pub fn grant_local(
        &mut self,
        resource_key: &str,
        hold: Duration,
        view: &ClusterView<'_>,
        out: &mut Vec<Payload>,
    ) -> AcquireOutcome {
        let self_id = self.self_id.clone();
        match self.decide(&self_id, resource_key, hold, None, view) {
            Decision::Grant { fencing_token } => {
                out.push(Payload::LeaseGrant {
                    request_id: None,
                    requester: self_id.clone(),
                    resource_key: resource_key.to_string(),
                    fencing_token,
                    hold_ms: hold.as_millis() as u64,
                });
                let lease = Lease {
                    resource_key: resource_key.to_string(),
                    holder_id: self_id,
                    term: view.term,
                    fencing_token,
                    expires_at: view.now + hold,
                    hold,
                };
                self.held.insert(resource_key.to_string(), lease.clone());
                tracing::debug!("Granted {} to self with token {}", resource_key, fencing_token);
                AcquireOutcome::Granted(lease)
            }
            Decision::Deny(DenyReason::Held { holder, remaining_ms }) => AcquireOutcome::Denied(Denial::Held {
                holder,
                remaining: Duration::from_millis(remaining_ms),
            }),
            Decision::Deny(DenyReason::Expired) => AcquireOutcome::Denied(Denial::NoLeader),
        }
    }

    /// Renew as the leader (or while standalone)
    pub fn renew_local(&mut self, lease: &Lease, view: &ClusterView<'_>, out: &mut Vec<Payload>) -> Option<Lease> {
        let self_id = self.self_id.clone();
        match self.decide(&self_id, &lease.resource_key, lease.hold, Some(lease.fencing_token), view) {
            Decision::Grant { fencing_token } => {
                out.push(Payload::LeaseGrant {
                    request_id: None,
                    requester: self_id,
                    resource_key: lease.resource_key.clone(),
                    fencing_token,
                    hold_ms: lease.hold.as_millis() as u64,
                });
                let renewed = Lease {
                    expires_at: view.now + lease.hold,
                    ..lease.clone()
                };
                self.held.insert(lease.resource_key.clone(), renewed.clone());
                Some(renewed)
            }
            Decision::Deny(_) => {
                if self.holds_token(&lease.resource_key, lease.fencing_token) {
                    self.held.remove(&lease.resource_key);
                }
                None
            }
        }
    }

    /// Ask the leader for a lease (or a renewal, with `renew_token`)
    pub(crate) fn request(
        &mut self,
        resource_key: &str,
        hold: Duration,
        renew_token: Option<u64>,
        now: Instant,
        out: &mut Vec<Payload>,
    ) -> (RequestId, oneshot::Receiver<LeaseReply>) {
        let request_id = self.next_request;
        self.next_request += 1;

        let (reply, receiver) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingLease {
                resource_key: resource_key.to_string(),
                sent_at: now,
                hold,
                reply,
            },
        );
        out.push(Payload::LeaseRequest {
            request_id,
            resource_key: resource_key.to_string(),
            hold_ms: hold.as_millis() as u64,
            renew_token,
        });
        (request_id, receiver)
    }

    /// Forget a request the caller stopped waiting for
    pub(crate) fn cancel(&mut self, request_id: RequestId) {
        self.pending.remove(&request_id);
    }

    /// Leader: answer a peer's request
    #[allow(clippy::too_many_arguments)]
    pub fn handle_request(
        &mut self,
        requester: &str,
        request_id: RequestId,
        resource_key: &str,
        hold_ms: u64,
        renew_token: Option<u64>,
        view: &ClusterView<'_>,
        out: &mut Vec<Payload>,
    ) {
        let hold = Duration::from_millis(hold_ms);
        match self.decide(requester, resource_key, hold, renew_token, view) {
            Decision::Grant { fencing_token } => {
                tracing::debug!(
                    "Granted {} to {} with token {}",
                    resource_key,
                    requester,
                    fencing_token
                );
                out.push(Payload::LeaseGrant {
                    request_id: Some(request_id),
                    requester: requester.to_string(),
                    resource_key: resource_key.to_string(),
                    fencing_token,
                    hold_ms,
                });
            }
            Decision::Deny(reason) => {
                out.push(Payload::LeaseDeny {
                    request_id,
                    requester: requester.to_string(),
                    resource_key: resource_key.to_string(),
                    reason,
                });
            }
        }
    }

    /// Apply a grant broadcast by the leader
    #[allow(clippy::too_many_arguments)]
    pub fn apply_grant(
        &mut self,
        request_id: Option<RequestId>,
        requester: &str,
        resource_key: &str,
        fencing_token: u64,
        hold_ms: u64,
        term: Term,
        now: Instant,
        out: &mut Vec<Payload>,
    ) {
        let hold = Duration::from_millis(hold_ms);
        self.raise_token(resource_key, fencing_token);

        let replace = match self.records.get(resource_key) {
            Some(record) => record.fencing_token <= fencing_token,
            None => true,
        };
        if replace {
            self.records.insert(
                resource_key.to_string(),
                LeaseRecord {
                    holder: requester.to_string(),
                    term,
                    fencing_token,
                    expires_at: now + hold,
                },
            );
        }

        if requester != self.self_id {
            // Someone else owns it now; any lease we thought we held is gone
            if self.held.get(resource_key).map(|l| l.fencing_token < fencing_token).unwrap_or(false) {
                tracing::warn!("Lease on {} superseded by token {}", resource_key, fencing_token);
                self.held.remove(resource_key);
            }
            return;
        }

        let pending = request_id.and_then(|id| self.pending.remove(&id));
        match pending {
            Some(pending) if pending.resource_key == resource_key => {
                let lease = Lease {
                    resource_key: resource_key.to_string(),
                    holder_id: self.self_id.clone(),
                    term,
                    fencing_token,
                    expires_at: pending.sent_at + pending.hold,
                    hold: pending.hold,
                };
                self.held.insert(resource_key.to_string(), lease.clone());
                if pending.reply.send(LeaseReply::Granted(lease)).is_err() {
                    tracing::debug!("Caller gave up on {}; releasing token {}", resource_key, fencing_token);
                    self.release_token(resource_key, fencing_token, out);
                }
            }
            _ => {
                if !self.holds_token(resource_key, fencing_token) {
                    // Grant for a request nobody waits on any more
                    tracing::debug!("Releasing orphaned grant on {} (token {})", resource_key, fencing_token);
                    self.release_token(resource_key, fencing_token, out);
                }
            }
        }
    }

    /// Apply a denial broadcast by the leader
    pub fn apply_deny(&mut self, request_id: RequestId, requester: &str, reason: DenyReason) {
        if requester != self.self_id {
            return;
        }
        if let Some(pending) = self.pending.remove(&request_id) {
            if reason == DenyReason::Expired {
                self.held.remove(&pending.resource_key);
            }
            let _ = pending.reply.send(LeaseReply::Denied(reason));
        }
    }

    /// Apply a release broadcast by the holder
    pub fn apply_release(&mut self, resource_key: &str, holder: &str, fencing_token: u64) {
        self.raise_token(resource_key, fencing_token);
        let matches = self
            .records
            .get(resource_key)
            .map(|r| r.holder == holder && r.fencing_token == fencing_token)
            .unwrap_or(false);
        if matches {
            self.records.remove(resource_key);
        }
    }

    fn release_token(&mut self, resource_key: &str, fencing_token: u64, out: &mut Vec<Payload>) {
        self.held.remove(resource_key);
        let self_id = self.self_id.clone();
        self.apply_release(resource_key, &self_id, fencing_token);
        out.push(Payload::LeaseRelease {
            resource_key: resource_key.to_string(),
            holder: self_id,
            fencing_token,
        });
    }

    /// Give a lease back; returns false if it was not held
    pub fn release(&mut self, lease: &Lease, out: &mut Vec<Payload>) -> bool {
        let held = self.holds_token(&lease.resource_key, lease.fencing_token);
        if held {
            self.release_token(&lease.resource_key, lease.fencing_token, out);
        }
        held
    }

    /// Release everything this context holds (graceful leave)
    pub fn release_all(&mut self, out: &mut Vec<Payload>) {
        let held: Vec<(String, u64)> = self
            .held
            .values()
            .map(|l| (l.resource_key.clone(), l.fencing_token))
            .collect();
        for (resource_key, token) in held {
            self.release_token(&resource_key, token, out);
        }
    }

    fn holds_token(&self, resource_key: &str, fencing_token: u64) -> bool {
        self.held
            .get(resource_key)
            .map(|l| l.fencing_token == fencing_token)
            .unwrap_or(false)
    }

    /// Check that this context still holds `lease` unexpired
    pub fn holds(&self, lease: &Lease, now: Instant) -> bool {
        self.held
            .get(&lease.resource_key)
            .map(|l| l.fencing_token == lease.fencing_token && !l.is_expired(now))
            .unwrap_or(false)
    }

    /// Drop a held lease without telling anyone (it already expired)
    pub fn forget(&mut self, resource_key: &str) {
        self.held.remove(resource_key);
    }

    /// Merge leases a peer advertised on its heartbeat
    pub fn observe_held(&mut self, holder: &str, leases: &[HeldLease], term: Term, now: Instant) {
        for advertised in leases {
            self.raise_token(&advertised.resource_key, advertised.fencing_token);
            let expires_at = now + Duration::from_millis(advertised.remaining_ms);

            match self.records.get_mut(&advertised.resource_key) {
                Some(record) if record.holder == holder && record.fencing_token == advertised.fencing_token => {
                    if expires_at > record.expires_at {
                        record.expires_at = expires_at;
                    }
                }
                Some(record) if record.fencing_token >= advertised.fencing_token => {}
                _ => {
                    self.records.insert(
                        advertised.resource_key.clone(),
                        LeaseRecord {
                            holder: holder.to_string(),
                            term,
                            fencing_token: advertised.fencing_token,
                            expires_at,
                        },
                    );
                }
            }
        }
    }

    /// Drop every record held by a departed peer
    pub fn on_peer_removed(&mut self, peer_id: &str) {
        self.records.retain(|_, r| r.holder != peer_id);
    }

    /// Expire records and stale requests
    pub fn tick(&mut self, now: Instant, request_timeout: Duration) {
        self.records.retain(|_, r| r.expires_at > now);

        let expired: Vec<String> = self
            .held
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.resource_key.clone())
            .collect();
        for resource_key in expired {
            tracing::debug!("Lease on {} expired", resource_key);
            self.held.remove(&resource_key);
        }

        self.pending.retain(|_, p| {
            !p.reply.is_closed() && now.saturating_duration_since(p.sent_at) < request_timeout * 2
        });
    }

    /// Leases to advertise on the next heartbeat
    pub fn held_leases(&self, now: Instant) -> Vec<HeldLease> {
        let mut leases: Vec<HeldLease> = self
            .held
            .values()
            .filter(|l| !l.is_expired(now))
            .map(|l| HeldLease {
                resource_key: l.resource_key.clone(),
                fencing_token: l.fencing_token,
                remaining_ms: l.remaining(now).as_millis() as u64,
            })
            .collect();
        leases.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        leases
    }

    /// Number of leases held by this context
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Number of requests awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LeaderElection, PeerRegistry};

    const HOLD: Duration = Duration::from_millis(500);
    const LIVENESS: Duration = Duration::from_millis(300);

    struct World {
        registry: PeerRegistry,
        election: LeaderElection,
    }

    impl World {
        fn new(self_id: &str, now: Instant) -> Self {
            Self {
                registry: PeerRegistry::new(self_id.to_string(), 1, LIVENESS),
                election: LeaderElection::new(self_id.to_string(), 1, Duration::from_millis(100), now),
            }
        }

        fn view(&self, now: Instant) -> ClusterView<'_> {
            ClusterView::of(&self.registry, &self.election, now)
        }
    }

    #[test]
    fn test_local_grant_and_deny() {
        let now = Instant::now();
        let mut world = World::new("a", now);
        world.registry.join("b", 2, now);

        let mut leader = WriteCoordinator::new("a".to_string());
        let mut out = Vec::new();

        let lease = leader.grant_local("doc", HOLD, &world.view(now), &mut out).lease().unwrap();
        assert_eq!(lease.fencing_token, 1);
        assert!(matches!(out[0], Payload::LeaseGrant { request_id: None, .. }));

        // A different requester is denied while the lease is live
        out.clear();
        leader.handle_request("b", 7, "doc", 500, None, &world.view(now), &mut out);
        match &out[0] {
            Payload::LeaseDeny { request_id, reason: DenyReason::Held { holder, .. }, .. } => {
                assert_eq!(*request_id, 7);
                assert_eq!(holder, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tokens_increase_after_expiry() {
        let now = Instant::now();
        let mut world = World::new("a", now);
        world.registry.join("b", 2, now);

        let mut leader = WriteCoordinator::new("a".to_string());
        let mut out = Vec::new();
        leader.handle_request("b", 1, "doc", 200, None, &world.view(now), &mut out);
        assert!(matches!(out[0], Payload::LeaseGrant { fencing_token: 1, .. }));

        // Holder stops heartbeating; the lease is free once b is dead
        let later = now + LIVENESS + Duration::from_millis(1);
        out.clear();
        let lease = leader.grant_local("doc", HOLD, &world.view(later), &mut out).lease().unwrap();
        assert_eq!(lease.fencing_token, 2);
        assert_eq!(leader.high_water("doc"), 2);
    }

    #[test]
    fn test_reacquire_by_holder_keeps_token() {
        let now = Instant::now();
        let world = World::new("a", now);
        let mut leader = WriteCoordinator::new("a".to_string());
        let mut out = Vec::new();

        let first = leader.grant_local("doc", HOLD, &world.view(now), &mut out).lease().unwrap();
        let later = now + Duration::from_millis(100);
        let second = leader.grant_local("doc", HOLD, &world.view(later), &mut out).lease().unwrap();
        assert_eq!(first.fencing_token, second.fencing_token);
        assert!(second.expires_at > first.expires_at);
    }

    #[test]
    fn test_renew_requires_matching_token() {
        let now = Instant::now();
        let world = World::new("a", now);
        let mut leader = WriteCoordinator::new("a".to_string());
        let mut out = Vec::new();

        let lease = leader.grant_local("doc", HOLD, &world.view(now), &mut out).lease().unwrap();
        let renewed = leader
            .renew_local(&lease, &world.view(now + Duration::from_millis(400)), &mut out)
            .unwrap();
        assert_eq!(renewed.fencing_token, lease.fencing_token);
        assert_eq!(renewed.expires_at, now + Duration::from_millis(400) + HOLD);

        let forged = Lease {
            fencing_token: 99,
            ..lease.clone()
        };
        assert!(leader.renew_local(&forged, &world.view(now), &mut out).is_none());

        // After expiry the renewal is refused
        let late = now + Duration::from_secs(5);
        assert!(leader.renew_local(&renewed, &world.view(late), &mut out).is_none());
    }

    #[tokio::test]
    async fn test_remote_request_round_trip() {
        let now = Instant::now();
        let mut requester = WriteCoordinator::new("b".to_string());
        let mut out = Vec::new();

        let (request_id, receiver) = requester.request("doc", HOLD, None, now, &mut out);
        assert!(matches!(out[0], Payload::LeaseRequest { renew_token: None, .. }));
        out.clear();

        requester.apply_grant(Some(request_id), "b", "doc", 4, 500, 2, now, &mut out);
        assert!(out.is_empty());

        match receiver.await.unwrap() {
            LeaseReply::Granted(lease) => {
                assert_eq!(lease.fencing_token, 4);
                assert_eq!(lease.term, 2);
                assert_eq!(lease.expires_at, now + HOLD);
                assert!(requester.holds(&lease, now));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_grant_after_caller_gave_up_is_released() {
        let now = Instant::now();
        let mut requester = WriteCoordinator::new("b".to_string());
        let mut out = Vec::new();

        let (request_id, receiver) = requester.request("doc", HOLD, None, now, &mut out);
        drop(receiver);
        out.clear();

        requester.apply_grant(Some(request_id), "b", "doc", 3, 500, 1, now, &mut out);
        assert_eq!(
            out,
            vec![Payload::LeaseRelease {
                resource_key: "doc".to_string(),
                holder: "b".to_string(),
                fencing_token: 3,
            }]
        );
        assert_eq!(requester.held_count(), 0);
    }

    #[test]
    fn test_replica_tracks_tokens_across_leaders() {
        let now = Instant::now();
        let mut world = World::new("c", now);
        world.registry.join("a", 1, now);
        world.registry.join("b", 2, now);

        let mut replica = WriteCoordinator::new("c".to_string());
        let mut out = Vec::new();
        replica.apply_grant(None, "a", "doc", 5, 200, 1, now, &mut out);
        replica.observe_held(
            "b",
            &[HeldLease {
                resource_key: "other".to_string(),
                fencing_token: 9,
                remaining_ms: 100,
            }],
            1,
            now,
        );

        assert_eq!(replica.active_record("doc", &world.view(now)).unwrap().holder, "a");
        assert_eq!(replica.high_water("other"), 9);

        // c becomes leader after a's lease lapses; the token keeps climbing
        let later = now + Duration::from_millis(250);
        world.registry.heartbeat("a", 1, later);
        let lease = replica.grant_local("doc", HOLD, &world.view(later), &mut out).lease().unwrap();
        assert_eq!(lease.fencing_token, 6);
    }

    #[test]
    fn test_release_and_peer_removal() {
        let now = Instant::now();
        let mut world = World::new("a", now);
        world.registry.join("b", 2, now);
        let mut coordinator = WriteCoordinator::new("a".to_string());
        let mut out = Vec::new();

        let lease = coordinator.grant_local("x", HOLD, &world.view(now), &mut out).lease().unwrap();
        assert!(coordinator.release(&lease, &mut out));
        assert!(!coordinator.release(&lease, &mut out));
        assert!(coordinator.active_record("x", &world.view(now)).is_none());

        coordinator.apply_grant(None, "b", "y", 1, 500, 1, now, &mut out);
        coordinator.on_peer_removed("b");
        assert!(coordinator.active_record("y", &world.view(now)).is_none());
        assert_eq!(coordinator.high_water("y"), 1);
    }

    #[test]
    fn test_tick_expires_held_leases() {
        let now = Instant::now();
        let world = World::new("a", now);
        let mut coordinator = WriteCoordinator::new("a".to_string());
        let mut out = Vec::new();
        coordinator.grant_local("x", HOLD, &world.view(now), &mut out);
        assert_eq!(coordinator.held_leases(now).len(), 1);

        coordinator.tick(now + HOLD, Duration::from_secs(1));
        assert_eq!(coordinator.held_count(), 0);
        assert!(coordinator.held_leases(now + HOLD).is_empty());
    }
}
