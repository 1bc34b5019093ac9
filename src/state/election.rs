//! Leader Election
//!
//! Heartbeat-driven election with priority tie-breaks. A context runs for
//! leader once it has gone a full liveness timeout (plus a little random
//! jitter) without hearing from a live leader; the best-ranked live context
//! seen during one election window wins. A leader announcement with a higher
//! term is adopted unconditionally, which settles split votes without a
//! second round.
//!
//! The state machine does no I/O. Callers feed it envelopes and clock ticks
//! and broadcast the payloads it pushes into the outbox.

use std::collections::HashMap;
use std::time::Duration;
use rand::Rng;
use tokio::time::Instant;

use crate::protocol::{Envelope, Payload, PeerId, Term};
use crate::state::{rank, PeerRegistry, PeerRole};

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Following a leader (or waiting for one)
    Follower,
    /// Running for election
    Candidate,
    /// Won the election
    Leader,
    /// Left for good
    Disconnected,
}

impl ElectionState {
    /// Role advertised on heartbeats
    pub fn role(&self) -> PeerRole {
        match self {
            ElectionState::Follower => PeerRole::Follower,
            ElectionState::Candidate => PeerRole::Candidate,
            ElectionState::Leader => PeerRole::Leader,
            ElectionState::Disconnected => PeerRole::Unknown,
        }
    }
}

/// Emitted whenever the believed leader changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
    pub term: Term,
    pub leader_id: Option<PeerId>,
    /// This context is now the leader
    pub is_self: bool,
}

/// An election in progress
#[derive(Debug)]
struct Candidacy {
    window_ends: Instant,
    /// Candidates heard during the window, with their priority
    contenders: HashMap<PeerId, u32>,
}

/// Election state machine for one context
pub struct LeaderElection {
    /// This context's ID
    self_id: PeerId,
    /// This context's priority
    priority: u32,
    /// Current state
    state: ElectionState,
    /// Highest term known
    term: Term,
    /// Believed leader for `term`
    leader_id: Option<PeerId>,
    /// Last evidence of a live leader (or the last reset)
    leader_seen_at: Instant,
    /// Random extra wait before the next candidacy
    jitter: Duration,
    /// Election window
    window: Duration,
    /// Open candidacy, when a candidate
    candidacy: Option<Candidacy>,
}

impl LeaderElection {
    /// Create a new election state machine
    pub fn new(self_id: PeerId, priority: u32, window: Duration, now: Instant) -> Self {
        Self {
            self_id,
            priority,
            state: ElectionState::Follower,
            term: 0,
            leader_id: None,
            leader_seen_at: now,
            jitter: Self::random_jitter(window),
            window,
            candidacy: None,
        }
    }

    /// Generate a random candidacy jitter of up to half a window
    fn random_jitter(window: Duration) -> Duration {
        let max_ms = (window.as_millis() / 2) as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }

    /// Get current state
    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Get current term
    pub fn term(&self) -> Term {
        self.term
    }

    /// Get the believed leader
    pub fn leader(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    /// Check if this context is the leader
    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    /// Change the election window (mode change)
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Raise the known term without changing leadership
    fn observe_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
        }
    }

    /// Snapshot used to detect leader changes
    fn snapshot(&self) -> (Option<PeerId>, bool) {
        (self.leader_id.clone(), self.is_leader())
    }

    /// Compare against a snapshot and report a change
    fn change_since(&self, before: (Option<PeerId>, bool)) -> Option<LeaderChange> {
        if before == self.snapshot() {
            return None;
        }
        Some(LeaderChange {
            term: self.term,
            leader_id: self.leader_id.clone(),
            is_self: self.is_leader(),
        })
    }

    /// Periodic check, called once per heartbeat interval
    pub fn tick(
        &mut self,
        now: Instant,
        registry: &PeerRegistry,
        out: &mut Vec<Payload>,
    ) -> Option<LeaderChange> {
        let before = self.snapshot();

        match self.state {
            ElectionState::Disconnected | ElectionState::Leader => {}
            ElectionState::Follower => {
                if let Some(leader) = &self.leader_id {
                    if !registry.is_live(leader, now) {
                        tracing::info!("Leader {} is no longer live (term {})", leader, self.term);
                        self.leader_id = None;
                    }
                }

                let silent_for = now.saturating_duration_since(self.leader_seen_at);
                if self.leader_id.is_none() && silent_for >= registry.liveness_timeout() + self.jitter {
                    self.start_candidacy(self.term + 1, now, out);
                }
            }
            ElectionState::Candidate => {
                let window_over = self
                    .candidacy
                    .as_ref()
                    .map(|c| now >= c.window_ends)
                    .unwrap_or(true);
                if window_over {
                    self.resolve(now, registry, out);
                }
            }
        }

        self.change_since(before)
    }

    /// Become a candidate for `term` and broadcast the candidacy
    fn start_candidacy(&mut self, term: Term, now: Instant, out: &mut Vec<Payload>) {
        self.term = term.max(self.term);
        self.state = ElectionState::Candidate;
        self.leader_id = None;

        let mut contenders = HashMap::new();
        contenders.insert(self.self_id.clone(), self.priority);
        self.candidacy = Some(Candidacy {
            window_ends: now + self.window,
            contenders,
        });

        tracing::info!(
            "Starting election for term {} (peer: {}, priority {})",
            self.term,
            self.self_id,
            self.priority
        );
        out.push(Payload::Candidacy);
    }

    /// Close the election window and pick the winner
    fn resolve(&mut self, now: Instant, registry: &PeerRegistry, out: &mut Vec<Payload>) {
        let candidacy = self.candidacy.take();

        let mut best_id = registry.best_live(now);
        let mut best_priority = registry.priority_of(&best_id).unwrap_or(self.priority);
        if let Some(c) = &candidacy {
            for (id, priority) in &c.contenders {
                if registry.is_live(id, now) && rank(*priority, id) < rank(best_priority, &best_id) {
                    best_id = id.clone();
                    best_priority = *priority;
                }
            }
        }

        if best_id == self.self_id {
            self.become_leader(out);
        } else {
            // Give the winner a full timeout to announce itself
            tracing::info!(
                "Election for term {} goes to {}; waiting for its announcement",
                self.term,
                best_id
            );
            self.state = ElectionState::Follower;
            self.leader_seen_at = now;
            self.jitter = Self::random_jitter(self.window);
        }
    }

    /// Become the leader
    fn become_leader(&mut self, out: &mut Vec<Payload>) {
        self.state = ElectionState::Leader;
        self.leader_id = Some(self.self_id.clone());
        self.candidacy = None;

        tracing::info!("Won election for term {}, becoming LEADER", self.term);
        out.push(Payload::LeaderAnnounce);
    }

    /// Follow `leader_id` at `term`
    fn adopt(&mut self, leader_id: &str, term: Term, now: Instant) {
        if leader_id == self.self_id {
            return;
        }

        if self.state == ElectionState::Leader {
            tracing::info!(
                "Stepping down: {} leads term {} (we had term {})",
                leader_id,
                term,
                self.term
            );
        } else if self.leader_id.as_deref() != Some(leader_id) {
            tracing::info!("Following leader {} for term {}", leader_id, term);
        }

        self.term = term.max(self.term);
        self.state = ElectionState::Follower;
        self.leader_id = Some(leader_id.to_string());
        self.leader_seen_at = now;
        self.candidacy = None;
    }

    /// Handle an envelope from another context
    pub fn handle(
        &mut self,
        envelope: &Envelope,
        registry: &PeerRegistry,
        now: Instant,
        out: &mut Vec<Payload>,
    ) -> Option<LeaderChange> {
        if self.state == ElectionState::Disconnected || envelope.sender_id == self.self_id {
            return None;
        }

        let before = self.snapshot();
        let sender = envelope.sender_id.as_str();
        let term = envelope.term;

        // Anything the current leader says proves it is alive
        if self.leader_id.as_deref() == Some(sender) && term == self.term {
            self.leader_seen_at = now;
        }

        match &envelope.payload {
            Payload::Heartbeat { role, leader_id, .. } => {
                let claims_leadership =
                    *role == PeerRole::Leader && leader_id.as_deref() == Some(sender);

                if term > self.term {
                    match leader_id {
                        Some(leader) if leader != &self.self_id => self.adopt(leader, term, now),
                        _ => {
                            // Newer term but no leader we can follow yet
                            self.observe_term(term);
                            if self.state != ElectionState::Follower {
                                tracing::info!("Stepping down: saw term {} from {}", term, sender);
                            }
                            self.state = ElectionState::Follower;
                            self.leader_id = None;
                            self.candidacy = None;
                        }
                    }
                } else if term == self.term && claims_leadership {
                    self.handle_leader_claim(sender, envelope.sender_priority, term, registry, now, out);
                } else if term < self.term && claims_leadership {
                    tracing::debug!(
                        "Ignoring stale leadership claim from {} (term {} < {})",
                        sender,
                        term,
                        self.term
                    );
                }
            }
            Payload::Candidacy => {
                self.handle_candidacy(sender, envelope.sender_priority, term, registry, now, out);
            }
            Payload::LeaderAnnounce => {
                if term > self.term {
                    self.adopt(sender, term, now);
                } else if term == self.term {
                    self.handle_leader_claim(sender, envelope.sender_priority, term, registry, now, out);
                } else {
                    tracing::debug!(
                        "Discarding stale leader announcement from {} (term {} < {})",
                        sender,
                        term,
                        self.term
                    );
                }
            }
            Payload::Leave => {
                if self.leader_id.as_deref() == Some(sender) {
                    tracing::info!("Leader {} left (term {})", sender, self.term);
                    self.leader_id = None;
                }
            }
            _ => {}
        }

        self.change_since(before)
    }

    /// Another context claims leadership of our current term
    fn handle_leader_claim(
        &mut self,
        sender: &str,
        sender_priority: u32,
        term: Term,
        registry: &PeerRegistry,
        now: Instant,
        out: &mut Vec<Payload>,
    ) {
        let current = match self.leader_id.clone() {
            None => {
                self.adopt(sender, term, now);
                return;
            }
            Some(current) if current == sender => return,
            Some(current) => current,
        };

        // Two leaders for one term: the better rank keeps it
        let current_priority = registry.priority_of(&current).unwrap_or(u32::MAX);
        if rank(sender_priority, sender) < rank(current_priority, &current) {
            self.adopt(sender, term, now);
        } else if current == self.self_id {
            tracing::info!(
                "Reasserting leadership of term {} over {}",
                term,
                sender
            );
            out.push(Payload::LeaderAnnounce);
        }
    }

    /// Another context is running for leader
    fn handle_candidacy(
        &mut self,
        sender: &str,
        sender_priority: u32,
        term: Term,
        registry: &PeerRegistry,
        now: Instant,
        out: &mut Vec<Payload>,
    ) {
        match self.state {
            ElectionState::Leader => {
                // A live leader that outranks the candidate wins that election too
                if term > self.term && rank(self.priority, &self.self_id) < rank(sender_priority, sender) {
                    self.term = term;
                    tracing::info!(
                        "Candidate {} outranked; re-announcing leadership at term {}",
                        sender,
                        term
                    );
                    out.push(Payload::LeaderAnnounce);
                }
            }
            ElectionState::Candidate => {
                self.observe_term(term);
                if let Some(c) = self.candidacy.as_mut() {
                    c.contenders.insert(sender.to_string(), sender_priority);
                }
            }
            ElectionState::Follower => {
                let leader_live = self
                    .leader_id
                    .as_deref()
                    .map(|l| registry.is_live(l, now))
                    .unwrap_or(false);

                if !leader_live && term >= self.term {
                    // Join the election so the best rank is always in the window
                    self.start_candidacy(term, now, out);
                    if let Some(c) = self.candidacy.as_mut() {
                        c.contenders.insert(sender.to_string(), sender_priority);
                    }
                }
            }
            ElectionState::Disconnected => {}
        }
    }

    /// Give up leadership after a transport failure
    pub fn step_down(&mut self, now: Instant) -> Option<LeaderChange> {
        let before = self.snapshot();
        if matches!(self.state, ElectionState::Leader | ElectionState::Candidate) {
            tracing::info!("Stepping down to follower for term {}", self.term);
            self.state = ElectionState::Follower;
            self.leader_id = None;
            self.candidacy = None;
            self.leader_seen_at = now;
        }
        self.change_since(before)
    }

    /// Assume sole leadership with no coordination available
    pub fn enter_standalone(&mut self) -> Option<LeaderChange> {
        let before = self.snapshot();
        if self.state != ElectionState::Disconnected {
            self.state = ElectionState::Leader;
            self.leader_id = Some(self.self_id.clone());
            self.candidacy = None;
        }
        self.change_since(before)
    }

    /// Coordination is back; rejoin the election as a follower
    pub fn exit_standalone(&mut self, now: Instant) -> Option<LeaderChange> {
        let before = self.snapshot();
        if self.state != ElectionState::Disconnected {
            self.state = ElectionState::Follower;
            self.leader_id = None;
            self.candidacy = None;
            self.leader_seen_at = now;
        }
        self.change_since(before)
    }

    /// Terminal state on shutdown
    pub fn disconnect(&mut self) -> Option<LeaderChange> {
        let before = self.snapshot();
        self.state = ElectionState::Disconnected;
        self.leader_id = None;
        self.candidacy = None;
        self.change_since(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);
    const LIVENESS: Duration = Duration::from_millis(300);

    fn setup(id: &str, priority: u32, now: Instant) -> (LeaderElection, PeerRegistry) {
        (
            LeaderElection::new(id.to_string(), priority, WINDOW, now),
            PeerRegistry::new(id.to_string(), priority, LIVENESS),
        )
    }

    fn envelope(sender: &str, priority: u32, term: Term, payload: Payload) -> Envelope {
        Envelope::new(sender.to_string(), priority, term, payload)
    }

    fn leader_heartbeat(sender: &str, priority: u32, term: Term) -> Envelope {
        envelope(
            sender,
            priority,
            term,
            Payload::Heartbeat {
                role: PeerRole::Leader,
                leader_id: Some(sender.to_string()),
                leases: vec![],
                slots: vec![],
                running_queries: vec![],
            },
        )
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..50 {
            let jitter = LeaderElection::random_jitter(WINDOW);
            assert!(jitter <= WINDOW / 2);
        }
        assert_eq!(LeaderElection::random_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_lone_context_elects_itself() {
        let start = Instant::now();
        let (mut election, registry) = setup("tab-a", 1, start);
        let mut out = Vec::new();

        assert_eq!(election.state(), ElectionState::Follower);
        assert!(election.tick(start, &registry, &mut out).is_none());

        let timeout = start + LIVENESS + WINDOW;
        election.tick(timeout, &registry, &mut out);
        assert_eq!(election.state(), ElectionState::Candidate);
        assert_eq!(election.term(), 1);
        assert_eq!(out, vec![Payload::Candidacy]);

        let change = election
            .tick(timeout + WINDOW, &registry, &mut out)
            .expect("leader change");
        assert!(change.is_self);
        assert_eq!(change.term, 1);
        assert!(election.is_leader());
        assert_eq!(out.last(), Some(&Payload::LeaderAnnounce));
    }

    #[test]
    fn test_candidate_defers_to_better_rank() {
        let start = Instant::now();
        let (mut election, mut registry) = setup("tab-b", 2, start);
        let mut out = Vec::new();

        let t = start + LIVENESS + WINDOW;
        registry.join("tab-a", 1, t);
        election.tick(t, &registry, &mut out);
        assert_eq!(election.state(), ElectionState::Candidate);

        election.handle(&envelope("tab-a", 1, 1, Payload::Candidacy), &registry, t, &mut out);
        election.tick(t + WINDOW, &registry, &mut out);
        assert_eq!(election.state(), ElectionState::Follower);
        assert!(!out.contains(&Payload::LeaderAnnounce));

        let change = election
            .handle(&envelope("tab-a", 1, 1, Payload::LeaderAnnounce), &registry, t + WINDOW, &mut out)
            .unwrap();
        assert_eq!(change.leader_id.as_deref(), Some("tab-a"));
        assert!(!change.is_self);
    }

    #[test]
    fn test_higher_term_announcement_wins_regardless_of_candidacy() {
        let start = Instant::now();
        let (mut election, registry) = setup("tab-a", 1, start);
        let mut out = Vec::new();

        election.tick(start + LIVENESS + WINDOW, &registry, &mut out);
        assert_eq!(election.state(), ElectionState::Candidate);

        // A worse-ranked context announces a newer term: adopt it anyway
        election.handle(
            &envelope("tab-z", 9, 5, Payload::LeaderAnnounce),
            &registry,
            start + LIVENESS + WINDOW,
            &mut out,
        );
        assert_eq!(election.state(), ElectionState::Follower);
        assert_eq!(election.term(), 5);
        assert_eq!(election.leader(), Some("tab-z"));
    }

    #[test]
    fn test_stale_announcement_discarded() {
        let start = Instant::now();
        let (mut election, registry) = setup("tab-b", 2, start);
        let mut out = Vec::new();

        election.handle(&envelope("tab-c", 3, 4, Payload::LeaderAnnounce), &registry, start, &mut out);
        assert_eq!(election.leader(), Some("tab-c"));

        let change = election.handle(&envelope("tab-a", 1, 3, Payload::LeaderAnnounce), &registry, start, &mut out);
        assert!(change.is_none());
        assert_eq!(election.leader(), Some("tab-c"));
        assert_eq!(election.term(), 4);
    }

    #[test]
    fn test_resumed_leader_adopts_newer_term() {
        let start = Instant::now();
        let (mut election, mut registry) = setup("tab-a", 1, start);
        let mut out = Vec::new();

        election.tick(start + LIVENESS + WINDOW, &registry, &mut out);
        election.tick(start + LIVENESS + WINDOW * 2, &registry, &mut out);
        assert!(election.is_leader());
        assert_eq!(election.term(), 1);

        // Meanwhile tab-b took over at term 2
        let later = start + Duration::from_secs(5);
        registry.join("tab-b", 2, later);
        let change = election
            .handle(&leader_heartbeat("tab-b", 2, 2), &registry, later, &mut out)
            .unwrap();
        assert!(!change.is_self);
        assert_eq!(election.state(), ElectionState::Follower);
        assert_eq!(election.term(), 2);
        assert_eq!(election.leader(), Some("tab-b"));
    }

    #[test]
    fn test_equal_term_split_resolved_by_rank() {
        let start = Instant::now();
        let (mut election, mut registry) = setup("tab-c", 3, start);
        let mut out = Vec::new();
        registry.join("tab-a", 1, start);
        registry.join("tab-b", 1, start);

        election.handle(&envelope("tab-b", 1, 2, Payload::LeaderAnnounce), &registry, start, &mut out);
        assert_eq!(election.leader(), Some("tab-b"));

        // Same priority, smaller id wins the tie
        election.handle(&envelope("tab-a", 1, 2, Payload::LeaderAnnounce), &registry, start, &mut out);
        assert_eq!(election.leader(), Some("tab-a"));

        election.handle(&envelope("tab-b", 1, 2, Payload::LeaderAnnounce), &registry, start, &mut out);
        assert_eq!(election.leader(), Some("tab-a"));
    }

    #[test]
    fn test_leader_outranking_candidate_reannounces() {
        let start = Instant::now();
        let (mut election, mut registry) = setup("tab-a", 1, start);
        let mut out = Vec::new();
        election.tick(start + LIVENESS + WINDOW, &registry, &mut out);
        election.tick(start + LIVENESS + WINDOW * 2, &registry, &mut out);
        assert!(election.is_leader());
        out.clear();

        registry.join("tab-b", 2, start);
        election.handle(&envelope("tab-b", 2, 2, Payload::Candidacy), &registry, start, &mut out);
        assert!(election.is_leader());
        assert_eq!(election.term(), 2);
        assert_eq!(out, vec![Payload::LeaderAnnounce]);
    }

    #[test]
    fn test_follower_keeps_live_leader() {
        let start = Instant::now();
        let (mut election, mut registry) = setup("tab-b", 2, start);
        let mut out = Vec::new();

        let mut now = start;
        for _ in 0..20 {
            registry.heartbeat("tab-a", 1, now);
            election.handle(&leader_heartbeat("tab-a", 1, 1), &registry, now, &mut out);
            election.tick(now, &registry, &mut out);
            now += Duration::from_millis(100);
        }
        assert_eq!(election.state(), ElectionState::Follower);
        assert_eq!(election.leader(), Some("tab-a"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_standalone_and_disconnect() {
        let start = Instant::now();
        let (mut election, _registry) = setup("tab-a", 1, start);

        let change = election.enter_standalone().unwrap();
        assert!(change.is_self);
        assert!(election.is_leader());

        let change = election.exit_standalone(start).unwrap();
        assert_eq!(change.leader_id, None);
        assert_eq!(election.state(), ElectionState::Follower);

        election.disconnect();
        assert_eq!(election.state(), ElectionState::Disconnected);
        assert!(election.enter_standalone().is_none());
    }
}
