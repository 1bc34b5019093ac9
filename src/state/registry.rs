//! Peer Registry
//!
//! Tracks the other contexts this one has heard from, their liveness
//! and the role they last advertised.

use std::collections::HashMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::PeerId;

/// Role of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Context is the leader
    Leader,
    /// Context follows a leader
    Follower,
    /// Context is running for leader
    Candidate,
    /// Context has not said yet
    Unknown,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Leader => write!(f, "LEADER"),
            PeerRole::Follower => write!(f, "FOLLOWER"),
            PeerRole::Candidate => write!(f, "CANDIDATE"),
            PeerRole::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Election rank: lower priority wins, ties go to the smaller id
pub fn rank(priority: u32, id: &str) -> (u32, &str) {
    (priority, id)
}

/// State of a single peer context
#[derive(Debug, Clone)]
pub struct Peer {
    /// Unique context identifier
    pub id: PeerId,
    /// Election priority (lower wins)
    pub priority: u32,
    /// Last time anything was heard from the peer
    pub last_heartbeat_at: Instant,
    /// Last advertised role
    pub role: PeerRole,
    /// When the peer was first seen
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl Peer {
    /// Create a new peer record
    pub fn new(id: PeerId, priority: u32, now: Instant) -> Self {
        Self {
            id,
            priority,
            last_heartbeat_at: now,
            role: PeerRole::Unknown,
            joined_at: chrono::Utc::now(),
        }
    }

    /// Check if the peer has been heard from within the timeout
    pub fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat_at) < timeout
    }

    /// Time since last heartbeat
    pub fn time_since_heartbeat(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat_at)
    }
}

/// Registry of known peer contexts
pub struct PeerRegistry {
    /// This context's ID
    self_id: PeerId,
    /// This context's priority
    self_priority: u32,
    /// Other contexts, keyed by id
    peers: HashMap<PeerId, Peer>,
    /// A peer silent for this long is dead
    liveness_timeout: Duration,
}

impl PeerRegistry {
    /// Create a new registry
    pub fn new(self_id: PeerId, self_priority: u32, liveness_timeout: Duration) -> Self {
        Self {
            self_id,
            self_priority,
            peers: HashMap::new(),
            liveness_timeout,
        }
    }

    /// Get this context's ID
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Get this context's priority
    pub fn self_priority(&self) -> u32 {
        self.self_priority
    }

    /// Current liveness timeout
    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Change the liveness timeout (mode change)
    pub fn set_liveness_timeout(&mut self, timeout: Duration) {
        self.liveness_timeout = timeout;
    }

    /// Register a peer; returns true if it was not known
    pub fn join(&mut self, id: &str, priority: u32, now: Instant) -> bool {
        if id == self.self_id {
            return false;
        }

        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.priority = priority;
                peer.last_heartbeat_at = now;
                false
            }
            None => {
                tracing::info!("Peer {} joined (priority {})", id, priority);
                self.peers.insert(id.to_string(), Peer::new(id.to_string(), priority, now));
                true
            }
        }
    }

    /// Record a heartbeat; an unknown peer is an implicit join
    pub fn heartbeat(&mut self, id: &str, priority: u32, now: Instant) -> bool {
        self.join(id, priority, now)
    }

    /// Update the role a peer advertised
    pub fn set_role(&mut self, id: &str, role: PeerRole) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.role = role;
        }
    }

    /// Remove a peer that announced its departure
    pub fn leave(&mut self, id: &str) -> Option<Peer> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            tracing::info!("Peer {} left", id);
        }
        removed
    }

    /// Get a peer's state
    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Check whether a context is live (this context always is)
    pub fn is_live(&self, id: &str, now: Instant) -> bool {
        if id == self.self_id {
            return true;
        }
        self.peers
            .get(id)
            .map(|p| p.is_live(now, self.liveness_timeout))
            .unwrap_or(false)
    }

    /// Priority of a known context
    pub fn priority_of(&self, id: &str) -> Option<u32> {
        if id == self.self_id {
            return Some(self.self_priority);
        }
        self.peers.get(id).map(|p| p.priority)
    }

    /// All live peers (excluding self), best rank first
    pub fn list_live(&self, now: Instant) -> Vec<&Peer> {
        let mut live: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.is_live(now, self.liveness_timeout))
            .collect();
        live.sort_by(|a, b| rank(a.priority, &a.id).cmp(&rank(b.priority, &b.id)));
        live
    }

    /// Number of live contexts, including self
    pub fn live_count(&self, now: Instant) -> usize {
        self.list_live(now).len() + 1
    }

    /// Best-ranked live context, including self
    pub fn best_live(&self, now: Instant) -> PeerId {
        match self.list_live(now).first() {
            Some(peer) if rank(peer.priority, &peer.id) < rank(self.self_priority, &self.self_id) => {
                peer.id.clone()
            }
            _ => self.self_id.clone(),
        }
    }

    /// Drop peers that have been silent past the liveness timeout
    pub fn expire(&mut self, now: Instant) -> Vec<Peer> {
        let timeout = self.liveness_timeout;
        let dead: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| !p.is_live(now, timeout))
            .map(|p| p.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(peer) = self.peers.remove(&id) {
                tracing::info!(
                    "Peer {} timed out after {:?} without a heartbeat",
                    id,
                    peer.time_since_heartbeat(now)
                );
                removed.push(peer);
            }
        }
        removed
    }

    /// Forget every peer (entering standalone operation)
    pub fn clear(&mut self) {
        self.peers.clear();
    }

}
