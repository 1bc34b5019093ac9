//! Sync Slot Manager
//!
//! Ensures at most one context holds the live connection to each remote
//! sync endpoint. The leader holds every slot it knows about; while no
//! leader is reachable the best-ranked live context takes over orphaned
//! slots. Conflicting claims are settled by rank: a claim from the
//! believed leader wins, then higher term, then claim kind, then priority
//! and id.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use crate::protocol::{ClaimKind, Payload, PeerId, Term};
use crate::state::{rank, ClusterView};

/// Answer to `claim_sync_slot`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotClaim {
    /// This context holds the slot
    Granted,
    /// Another context holds (or is about to hold) the slot
    AlreadyHeld { holder: PeerId },
}

/// Slot ownership change for this context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    /// This context now holds the slot and should open the connection
    Acquired { endpoint_id: String },
    /// This context lost the slot and must close the connection
    Lost {
        endpoint_id: String,
        new_holder: Option<PeerId>,
    },
}

/// Current owner of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSlot {
    pub endpoint_id: String,
    pub holder_id: PeerId,
    pub term: Term,
    pub claim: ClaimKind,
    pub holder_priority: u32,
    pub refreshed_at: Instant,
}

/// Slot state for one context
pub struct SlotManager {
    self_id: PeerId,
    priority: u32,
    /// Believed owner per endpoint
    slots: HashMap<String, SyncSlot>,
    /// Endpoints this context holds
    held: BTreeSet<String>,
    /// Every endpoint still wanted by someone
    known: BTreeSet<String>,
    /// Ownership changes not yet delivered
    events: Vec<SlotEvent>,
}

impl SlotManager {
    /// Create an empty manager
    pub fn new(self_id: PeerId, priority: u32) -> Self {
        Self {
            self_id,
            priority,
            slots: HashMap::new(),
            held: BTreeSet::new(),
            known: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    /// Believed owner of an endpoint
    pub fn slot(&self, endpoint_id: &str) -> Option<&SyncSlot> {
        self.slots.get(endpoint_id)
    }

    /// Endpoints held by this context
    pub fn held(&self) -> Vec<String> {
        self.held.iter().cloned().collect()
    }

    /// Check if this context holds an endpoint
    pub fn holds(&self, endpoint_id: &str) -> bool {
        self.held.contains(endpoint_id)
    }

    /// Take pending ownership events
    pub fn drain_events(&mut self) -> Vec<SlotEvent> {
        std::mem::take(&mut self.events)
    }

    fn is_valid(slot: &SyncSlot, self_id: &str, view: &ClusterView<'_>) -> bool {
        if slot.holder_id == self_id {
            return true;
        }
        view.is_live(&slot.holder_id)
            && view.now.saturating_duration_since(slot.refreshed_at) < view.registry.liveness_timeout()
    }

    fn current(&self, endpoint_id: &str, view: &ClusterView<'_>) -> Option<&SyncSlot> {
        self.slots
            .get(endpoint_id)
            .filter(|slot| Self::is_valid(slot, &self.self_id, view))
    }

    /// Order two claims; `Greater` means `a` wins
    fn compare(a: &SyncSlot, b: &SyncSlot, view: &ClusterView<'_>) -> Ordering {
        let from_leader = |s: &SyncSlot| s.claim == ClaimKind::Leader && view.leader == Some(s.holder_id.as_str());
        from_leader(a)
            .cmp(&from_leader(b))
            .then(a.term.cmp(&b.term))
            .then(a.claim.cmp(&b.claim))
            .then_with(|| rank(b.holder_priority, &b.holder_id).cmp(&rank(a.holder_priority, &a.holder_id)))
    }

    fn take(&mut self, endpoint_id: &str, claim: ClaimKind, view: &ClusterView<'_>, out: &mut Vec<Payload>) {
        self.known.insert(endpoint_id.to_string());
        self.slots.insert(
            endpoint_id.to_string(),
            SyncSlot {
                endpoint_id: endpoint_id.to_string(),
                holder_id: self.self_id.clone(),
                term: view.term,
                claim,
                holder_priority: self.priority,
                refreshed_at: view.now,
            },
        );
        if self.held.insert(endpoint_id.to_string()) {
            tracing::info!("Acquired sync slot {} ({:?} claim, term {})", endpoint_id, claim, view.term);
            self.events.push(SlotEvent::Acquired {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        out.push(Payload::SlotClaim {
            endpoint_id: endpoint_id.to_string(),
            claim,
        });
    }

    fn lose(&mut self, endpoint_id: &str, new_holder: Option<PeerId>) {
        if self.held.remove(endpoint_id) {
            tracing::info!("Lost sync slot {} to {:?}", endpoint_id, new_holder);
            self.events.push(SlotEvent::Lost {
                endpoint_id: endpoint_id.to_string(),
                new_holder,
            });
        }
    }

    /// Ask for the slot of `endpoint_id`
    pub fn claim(&mut self, endpoint_id: &str, view: &ClusterView<'_>, out: &mut Vec<Payload>) -> SlotClaim {
        self.known.insert(endpoint_id.to_string());

        if view.is_leader {
            if !self.held.contains(endpoint_id) {
                self.take(endpoint_id, ClaimKind::Leader, view, out);
            }
            return SlotClaim::Granted;
        }

        if let Some(slot) = self.current(endpoint_id, view) {
            if slot.holder_id == self.self_id {
                return SlotClaim::Granted;
            }
            return SlotClaim::AlreadyHeld {
                holder: slot.holder_id.clone(),
            };
        }

        // Without a leader only the best-ranked live context may hold it
        let owner = match view.live_leader() {
            Some(leader) => leader.to_string(),
            None if self.is_fallback_owner(view) => {
                self.take(endpoint_id, ClaimKind::Fallback, view, out);
                return SlotClaim::Granted;
            }
            None => view.registry.best_live(view.now),
        };

        // The owner takes the slot when it sees the request
        out.push(Payload::SlotClaim {
            endpoint_id: endpoint_id.to_string(),
            claim: ClaimKind::Request,
        });
        SlotClaim::AlreadyHeld { holder: owner }
    }

    fn is_fallback_owner(&self, view: &ClusterView<'_>) -> bool {
        view.live_leader().is_none() && view.registry.best_live(view.now) == self.self_id
    }

    /// Stop syncing `endpoint_id` altogether
    pub fn release(&mut self, endpoint_id: &str, out: &mut Vec<Payload>) {
        self.known.remove(endpoint_id);
        let held = self.held.contains(endpoint_id);
        self.lose(endpoint_id, None);
        if held {
            self.slots.remove(endpoint_id);
        }
        out.push(Payload::SlotRelease {
            endpoint_id: endpoint_id.to_string(),
            retire: true,
        });
    }

    /// Hand every held slot back (graceful leave)
    pub fn release_all(&mut self, out: &mut Vec<Payload>) {
        for endpoint_id in self.held() {
            self.lose(&endpoint_id, None);
            self.slots.remove(&endpoint_id);
            out.push(Payload::SlotRelease {
                endpoint_id,
                retire: false,
            });
        }
    }

    /// A peer claimed (or asked for) a slot
    #[allow(clippy::too_many_arguments)]
    pub fn handle_claim(
        &mut self,
        sender: &str,
        sender_priority: u32,
        term: Term,
        endpoint_id: &str,
        claim: ClaimKind,
        view: &ClusterView<'_>,
        out: &mut Vec<Payload>,
    ) {
        self.known.insert(endpoint_id.to_string());

        if claim == ClaimKind::Request {
            if view.is_leader {
                // Re-broadcast even if already held so the requester learns
                self.take(endpoint_id, ClaimKind::Leader, view, out);
            } else if self.is_fallback_owner(view) {
                let holder = self.current(endpoint_id, view).map(|s| s.holder_id.clone());
                if holder.map(|h| h == self.self_id).unwrap_or(true) {
                    self.take(endpoint_id, ClaimKind::Fallback, view, out);
                }
            }
            return;
        }

        let incoming = SyncSlot {
            endpoint_id: endpoint_id.to_string(),
            holder_id: sender.to_string(),
            term,
            claim,
            holder_priority: sender_priority,
            refreshed_at: view.now,
        };

        let wins = match self.current(endpoint_id, view) {
            None => true,
            Some(existing) if existing.holder_id == sender => true,
            Some(existing) => Self::compare(&incoming, existing, view) == Ordering::Greater,
        };

        if wins {
            self.slots.insert(endpoint_id.to_string(), incoming);
            self.lose(endpoint_id, Some(sender.to_string()));
        } else if self.held.contains(endpoint_id) {
            // Reassert so the weaker claimant backs off
            let kind = self.slots.get(endpoint_id).map(|s| s.claim).unwrap_or(ClaimKind::Fallback);
            self.take(endpoint_id, kind, view, out);
        }
    }

    /// A peer released a slot
    pub fn handle_release(&mut self, sender: &str, endpoint_id: &str, retire: bool) {
        let from_holder = self
            .slots
            .get(endpoint_id)
            .map(|s| s.holder_id == sender)
            .unwrap_or(false);
        if from_holder {
            self.slots.remove(endpoint_id);
        }
        if retire && !self.held.contains(endpoint_id) {
            self.known.remove(endpoint_id);
        }
    }

    /// Refresh ownership from the slots a peer advertised on its heartbeat
    pub fn observe_heartbeat(
        &mut self,
        sender: &str,
        sender_priority: u32,
        term: Term,
        advertised: &[String],
        view: &ClusterView<'_>,
    ) {
        // A slot the sender no longer lists was dropped without a release
        let dropped: Vec<String> = self
            .slots
            .values()
            .filter(|s| s.holder_id == sender && !advertised.contains(&s.endpoint_id))
            .map(|s| s.endpoint_id.clone())
            .collect();
        for endpoint_id in dropped {
            self.slots.remove(&endpoint_id);
        }

        for endpoint_id in advertised {
            self.known.insert(endpoint_id.clone());
            let current_holder = self.current(endpoint_id, view).map(|s| s.holder_id.clone());
            match current_holder {
                Some(holder) if holder == sender => {
                    if let Some(slot) = self.slots.get_mut(endpoint_id) {
                        slot.refreshed_at = view.now;
                    }
                }
                Some(_) => {}
                None => {
                    let claim = if view.leader == Some(sender) {
                        ClaimKind::Leader
                    } else {
                        ClaimKind::Fallback
                    };
                    self.slots.insert(
                        endpoint_id.clone(),
                        SyncSlot {
                            endpoint_id: endpoint_id.clone(),
                            holder_id: sender.to_string(),
                            term,
                            claim,
                            holder_priority: sender_priority,
                            refreshed_at: view.now,
                        },
                    );
                }
            }
        }
    }

    /// Migrate slots after leadership moved
    pub fn on_leader_change(&mut self, new_leader: Option<&str>, view: &ClusterView<'_>, out: &mut Vec<Payload>) {
        match new_leader {
            Some(leader) if leader == self.self_id => {
                let known: Vec<String> = self.known.iter().cloned().collect();
                for endpoint_id in known {
                    self.take(&endpoint_id, ClaimKind::Leader, view, out);
                }
            }
            Some(leader) => {
                // Fallback holds end once a leader exists
                for endpoint_id in self.held() {
                    self.lose(&endpoint_id, Some(leader.to_string()));
                    self.slots.remove(&endpoint_id);
                    out.push(Payload::SlotRelease {
                        endpoint_id,
                        retire: false,
                    });
                }
            }
            None => {}
        }
    }

    /// Periodic maintenance: refresh our own slots and pick up orphans
    pub fn tick(&mut self, view: &ClusterView<'_>, out: &mut Vec<Payload>) {
        for endpoint_id in &self.held {
            if let Some(slot) = self.slots.get_mut(endpoint_id) {
                slot.refreshed_at = view.now;
            }
        }

        let self_id = self.self_id.clone();
        self.slots.retain(|_, slot| Self::is_valid(slot, &self_id, view));

        if !view.is_leader && !self.is_fallback_owner(view) {
            return;
        }

        let kind = if view.is_leader {
            ClaimKind::Leader
        } else {
            ClaimKind::Fallback
        };
        let known: Vec<String> = self.known.iter().cloned().collect();
        for endpoint_id in known {
            let holder = self.slots.get(&endpoint_id).map(|s| s.holder_id.clone());
            let reclaim = match holder {
                None => true,
                Some(holder) => view.is_leader && holder != self.self_id,
            };
            if reclaim {
                self.take(&endpoint_id, kind, view, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PeerRegistry;
    use std::time::Duration;

    const LIVENESS: Duration = Duration::from_millis(300);

    fn registry(self_id: &str, priority: u32, peers: &[(&str, u32)], now: Instant) -> PeerRegistry {
        let mut registry = PeerRegistry::new(self_id.to_string(), priority, LIVENESS);
        for (id, p) in peers {
            registry.join(id, *p, now);
        }
        registry
    }

    fn view<'a>(registry: &'a PeerRegistry, leader: Option<&'a str>, term: Term, now: Instant) -> ClusterView<'a> {
        ClusterView {
            now,
            term,
            registry,
            leader,
            is_leader: leader == Some(registry.self_id()),
        }
    }

    #[test]
    fn test_leader_claim_granted() {
        let now = Instant::now();
        let registry = registry("a", 1, &[("b", 2)], now);
        let mut slots = SlotManager::new("a".to_string(), 1);
        let mut out = Vec::new();

        let claim = slots.claim("ep", &view(&registry, Some("a"), 1, now), &mut out);
        assert_eq!(claim, SlotClaim::Granted);
        assert_eq!(
            slots.drain_events(),
            vec![SlotEvent::Acquired {
                endpoint_id: "ep".to_string()
            }]
        );
        assert_eq!(
            out,
            vec![Payload::SlotClaim {
                endpoint_id: "ep".to_string(),
                claim: ClaimKind::Leader
            }]
        );
    }

    #[test]
    fn test_follower_defers_to_leader() {
        let now = Instant::now();
        let registry = registry("b", 2, &[("a", 1)], now);
        let mut slots = SlotManager::new("b".to_string(), 2);
        let mut out = Vec::new();

        let claim = slots.claim("ep", &view(&registry, Some("a"), 1, now), &mut out);
        assert_eq!(
            claim,
            SlotClaim::AlreadyHeld {
                holder: "a".to_string()
            }
        );
        assert!(slots.drain_events().is_empty());
        assert!(matches!(
            out[0],
            Payload::SlotClaim {
                claim: ClaimKind::Request,
                ..
            }
        ));
    }

    #[test]
    fn test_fallback_claim_without_leader() {
        let now = Instant::now();
        let registry = registry("b", 2, &[("c", 3)], now);
        let mut slots = SlotManager::new("b".to_string(), 2);
        let mut out = Vec::new();

        assert_eq!(slots.claim("ep", &view(&registry, None, 1, now), &mut out), SlotClaim::Granted);
        assert!(slots.holds("ep"));
        assert_eq!(slots.slot("ep").unwrap().claim, ClaimKind::Fallback);
    }

    #[test]
    fn test_leaderless_claim_defers_to_best_live() {
        let now = Instant::now();
        let registry_c = registry("c", 3, &[("b", 2)], now);
        let mut slots_c = SlotManager::new("c".to_string(), 3);
        let mut out = Vec::new();

        assert_eq!(
            slots_c.claim("ep", &view(&registry_c, None, 1, now), &mut out),
            SlotClaim::AlreadyHeld {
                holder: "b".to_string()
            }
        );
        assert!(!slots_c.holds("ep"));
        assert!(slots_c.drain_events().is_empty());
        assert_eq!(
            out,
            vec![Payload::SlotClaim {
                endpoint_id: "ep".to_string(),
                claim: ClaimKind::Request
            }]
        );

        // b ranks first among the live contexts and takes it on request
        let registry_b = registry("b", 2, &[("c", 3)], now);
        let mut slots_b = SlotManager::new("b".to_string(), 2);
        let mut out_b = Vec::new();
        slots_b.handle_claim("c", 3, 1, "ep", ClaimKind::Request, &view(&registry_b, None, 1, now), &mut out_b);
        assert!(slots_b.holds("ep"));
        assert_eq!(slots_b.slot("ep").unwrap().claim, ClaimKind::Fallback);

        // c learns the holder from the claim and keeps deferring
        out.clear();
        for payload in &out_b {
            if let Payload::SlotClaim { endpoint_id, claim } = payload {
                slots_c.handle_claim("b", 2, 1, endpoint_id, *claim, &view(&registry_c, None, 1, now), &mut out);
            }
        }
        assert_eq!(
            slots_c.claim("ep", &view(&registry_c, None, 1, now), &mut out),
            SlotClaim::AlreadyHeld {
                holder: "b".to_string()
            }
        );
        assert!(!slots_c.holds("ep"));
    }

    #[test]
    fn test_leader_claim_beats_fallback() {
        let now = Instant::now();
        let mut registry_b = registry("b", 2, &[("c", 3)], now);
        let mut slots = SlotManager::new("b".to_string(), 2);
        let mut out = Vec::new();
        assert_eq!(slots.claim("ep", &view(&registry_b, None, 1, now), &mut out), SlotClaim::Granted);
        slots.drain_events();

        // a shows up as leader
        registry_b.join("a", 1, now);
        slots.handle_claim("a", 1, 1, "ep", ClaimKind::Leader, &view(&registry_b, Some("a"), 1, now), &mut out);
        assert!(!slots.holds("ep"));
        assert_eq!(slots.slot("ep").unwrap().holder_id, "a");
        assert_eq!(
            slots.drain_events(),
            vec![SlotEvent::Lost {
                endpoint_id: "ep".to_string(),
                new_holder: Some("a".to_string())
            }]
        );
    }

    #[test]
    fn test_weaker_claim_is_rebuffed() {
        let now = Instant::now();
        let registry_a = registry("a", 1, &[("c", 3)], now);
        let mut slots = SlotManager::new("a".to_string(), 1);
        let mut out = Vec::new();
        slots.claim("ep", &view(&registry_a, Some("a"), 2, now), &mut out);
        out.clear();

        slots.handle_claim("c", 3, 1, "ep", ClaimKind::Fallback, &view(&registry_a, Some("a"), 2, now), &mut out);
        assert!(slots.holds("ep"));
        assert_eq!(
            out,
            vec![Payload::SlotClaim {
                endpoint_id: "ep".to_string(),
                claim: ClaimKind::Leader
            }]
        );
    }

    #[test]
    fn test_leader_change_migrates_slots() {
        let now = Instant::now();
        let mut registry_b = registry("b", 2, &[], now);

        // b held the slot while there was no leader
        let mut slots_b = SlotManager::new("b".to_string(), 2);
        let mut out = Vec::new();
        assert_eq!(slots_b.claim("ep", &view(&registry_b, None, 1, now), &mut out), SlotClaim::Granted);
        slots_b.drain_events();
        out.clear();

        registry_b.join("a", 1, now);
        slots_b.on_leader_change(Some("a"), &view(&registry_b, Some("a"), 2, now), &mut out);
        assert!(!slots_b.holds("ep"));
        assert_eq!(
            out,
            vec![Payload::SlotRelease {
                endpoint_id: "ep".to_string(),
                retire: false
            }]
        );

        // The new leader claims every endpoint it knows
        let registry_a = registry("a", 1, &[("b", 2)], now);
        let mut slots_a = SlotManager::new("a".to_string(), 1);
        slots_a.observe_heartbeat("b", 2, 1, &["ep".to_string()], &view(&registry_a, None, 1, now));
        out.clear();
        slots_a.on_leader_change(Some("a"), &view(&registry_a, Some("a"), 2, now), &mut out);
        assert!(slots_a.holds("ep"));
        assert_eq!(
            slots_a.drain_events(),
            vec![SlotEvent::Acquired {
                endpoint_id: "ep".to_string()
            }]
        );
    }

    #[test]
    fn test_orphaned_slot_taken_over() {
        let now = Instant::now();
        let mut registry_b = registry("b", 2, &[("a", 1), ("c", 3)], now);
        let mut slots = SlotManager::new("b".to_string(), 2);
        let mut out = Vec::new();
        slots.handle_claim("a", 1, 1, "ep", ClaimKind::Leader, &view(&registry_b, Some("a"), 1, now), &mut out);

        // a dies; b is now the best live context and no leader is live
        let later = now + LIVENESS + Duration::from_millis(1);
        registry_b.heartbeat("c", 3, later);
        slots.tick(&view(&registry_b, Some("a"), 1, later), &mut out);
        assert!(slots.holds("ep"));
        assert_eq!(slots.slot("ep").unwrap().claim, ClaimKind::Fallback);

        // c is not the best live context and leaves it alone
        let registry_c = {
            let mut r = registry("c", 3, &[("b", 2)], later);
            r.heartbeat("b", 2, later);
            r
        };
        let mut slots_c = SlotManager::new("c".to_string(), 3);
        slots_c.observe_heartbeat("a", 1, 1, &[], &view(&registry_c, None, 1, later));
        slots_c.known.insert("ep".to_string());
        let mut out_c = Vec::new();
        slots_c.tick(&view(&registry_c, None, 1, later), &mut out_c);
        assert!(!slots_c.holds("ep"));
        assert!(out_c.is_empty());
    }

    #[test]
    fn test_release_retires_endpoint() {
        let now = Instant::now();
        let registry_a = registry("a", 1, &[("b", 2)], now);
        let mut slots = SlotManager::new("a".to_string(), 1);
        let mut out = Vec::new();
        let leader_view = view(&registry_a, Some("a"), 1, now);
        slots.claim("ep", &leader_view, &mut out);
        slots.release("ep", &mut out);
        slots.drain_events();
        out.clear();

        slots.tick(&leader_view, &mut out);
        assert!(out.is_empty());
        assert!(!slots.holds("ep"));

        // A peer's retirement makes the leader forget the endpoint too
        let mut other = SlotManager::new("a".to_string(), 1);
        other.handle_claim("b", 2, 1, "ep2", ClaimKind::Fallback, &view(&registry_a, None, 1, now), &mut out);
        other.handle_release("b", "ep2", true);
        out.clear();
        other.tick(&leader_view, &mut out);
        assert!(!other.holds("ep2"));
    }
}
