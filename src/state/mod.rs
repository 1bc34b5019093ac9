//! State Management Module
//!
//! Tracks the peer contexts this one knows about and decides which of
//! them leads.

mod registry;
pub mod election;

pub use registry::{rank, Peer, PeerRegistry, PeerRole};
pub use election::{ElectionState, LeaderChange, LeaderElection};

use tokio::time::Instant;

use crate::protocol::Term;

/// Read-only snapshot of membership and leadership at one instant,
/// handed to the lease, query and slot state machines
#[derive(Clone, Copy)]
pub struct ClusterView<'a> {
    pub now: Instant,
    pub term: Term,
    pub registry: &'a PeerRegistry,
    pub leader: Option<&'a str>,
    pub is_leader: bool,
}

impl<'a> ClusterView<'a> {
    /// Build a view from the registry and election state
    pub fn of(registry: &'a PeerRegistry, election: &'a LeaderElection, now: Instant) -> Self {
        Self {
            now,
            term: election.term(),
            registry,
            leader: election.leader(),
            is_leader: election.is_leader(),
        }
    }

    /// This context's ID
    pub fn self_id(&self) -> &'a str {
        self.registry.self_id()
    }

    /// Check if a peer (or this context) is live
    pub fn is_live(&self, id: &str) -> bool {
        self.registry.is_live(id, self.now)
    }

    /// The believed leader, if it is live
    pub fn live_leader(&self) -> Option<&'a str> {
        self.leader.filter(|id| self.registry.is_live(id, self.now))
    }

    /// Priority of a peer, if known
    pub fn priority_of(&self, id: &str) -> Option<u32> {
        self.registry.priority_of(id)
    }
}
