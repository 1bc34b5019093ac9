//! Coordination Protocol
//!
//! Defines the envelope every context broadcasts and the checksummed
//! frame it travels in.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::PeerRole;

/// Context identifier
pub type PeerId = String;
/// Election term
pub type Term = u64;
/// Per-context request identifier
pub type RequestId = u64;

/// Message kinds carried in an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Candidacy,
    LeaderAnnounce,
    Leave,
    LeaseRequest,
    LeaseGrant,
    LeaseDeny,
    LeaseRelease,
    QueryStart,
    QueryAssign,
    QueryResult,
    SlotClaim,
    SlotRelease,
}

impl MessageKind {
    /// Kinds only the leader of a term may send
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            MessageKind::LeaderAnnounce
                | MessageKind::LeaseGrant
                | MessageKind::LeaseDeny
                | MessageKind::QueryAssign
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Candidacy => "candidacy",
            MessageKind::LeaderAnnounce => "leaderAnnounce",
            MessageKind::Leave => "leave",
            MessageKind::LeaseRequest => "leaseRequest",
            MessageKind::LeaseGrant => "leaseGrant",
            MessageKind::LeaseDeny => "leaseDeny",
            MessageKind::LeaseRelease => "leaseRelease",
            MessageKind::QueryStart => "queryStart",
            MessageKind::QueryAssign => "queryAssign",
            MessageKind::QueryResult => "queryResult",
            MessageKind::SlotClaim => "slotClaim",
            MessageKind::SlotRelease => "slotRelease",
        };
        f.write_str(name)
    }
}

/// A lease the sender currently holds, advertised on its heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLease {
    pub resource_key: String,
    pub fencing_token: u64,
    pub remaining_ms: u64,
}

/// Why the leader refused a lease request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// Someone else holds an unexpired lease
    Held { holder: PeerId, remaining_ms: u64 },
    /// Renewal of a lease that is gone or no longer ours
    Expired,
}

/// Outcome of a deduplicated query as broadcast to waiters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOutcome {
    /// JSON-encoded result
    Ok(Vec<u8>),
    /// Executor reported an error
    Failed(String),
    /// Ticket abandoned without progress
    Stale,
}

/// How a slot claim was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClaimKind {
    /// Non-leader asking the leader to take the slot
    Request,
    /// Non-leader holding the slot while no leader is reachable
    Fallback,
    /// Leader holding the slot
    Leader,
}

/// Protocol payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    // ========== Membership / Election ==========
    /// Periodic liveness beat
    Heartbeat {
        role: PeerRole,
        leader_id: Option<PeerId>,
        leases: Vec<HeldLease>,
        slots: Vec<String>,
        running_queries: Vec<String>,
    },

    /// Running for leader at `envelope.term`
    Candidacy,

    /// Won the election for `envelope.term`
    LeaderAnnounce,

    /// Graceful shutdown
    Leave,

    // ========== Leases ==========
    /// Acquire (or renew, with `renew_token`) a lease
    LeaseRequest {
        request_id: RequestId,
        resource_key: String,
        hold_ms: u64,
        renew_token: Option<u64>,
    },

    /// Lease granted (or renewed)
    LeaseGrant {
        request_id: Option<RequestId>,
        requester: PeerId,
        resource_key: String,
        fencing_token: u64,
        hold_ms: u64,
    },

    /// Lease refused
    LeaseDeny {
        request_id: RequestId,
        requester: PeerId,
        resource_key: String,
        reason: DenyReason,
    },

    /// Lease given back
    LeaseRelease {
        resource_key: String,
        holder: PeerId,
        fencing_token: u64,
    },

    // ========== Query dedup ==========
    /// Ask the leader for a ticket
    QueryStart {
        request_id: RequestId,
        query_hash: String,
    },

    /// Leader's ticket decision
    QueryAssign {
        request_id: Option<RequestId>,
        requester: PeerId,
        query_hash: String,
        executor: PeerId,
        reopened: bool,
    },

    /// Ticket finished
    QueryResult {
        query_hash: String,
        executor: PeerId,
        outcome: QueryOutcome,
    },

    // ========== Sync slots ==========
    /// Claim a remote sync endpoint
    SlotClaim {
        endpoint_id: String,
        claim: ClaimKind,
    },

    /// Give a remote sync endpoint back. `retire` means nobody should
    /// pick it up; otherwise it is a handoff to the leader.
    SlotRelease { endpoint_id: String, retire: bool },
}

impl Payload {
    /// Message kind of this payload
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Heartbeat { .. } => MessageKind::Heartbeat,
            Payload::Candidacy => MessageKind::Candidacy,
            Payload::LeaderAnnounce => MessageKind::LeaderAnnounce,
            Payload::Leave => MessageKind::Leave,
            Payload::LeaseRequest { .. } => MessageKind::LeaseRequest,
            Payload::LeaseGrant { .. } => MessageKind::LeaseGrant,
            Payload::LeaseDeny { .. } => MessageKind::LeaseDeny,
            Payload::LeaseRelease { .. } => MessageKind::LeaseRelease,
            Payload::QueryStart { .. } => MessageKind::QueryStart,
            Payload::QueryAssign { .. } => MessageKind::QueryAssign,
            Payload::QueryResult { .. } => MessageKind::QueryResult,
            Payload::SlotClaim { .. } => MessageKind::SlotClaim,
            Payload::SlotRelease { .. } => MessageKind::SlotRelease,
        }
    }
}

/// Coordination message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: PeerId,
    pub sender_priority: u32,
    pub term: Term,
    /// Wall-clock send time, diagnostics only
    pub sent_at_ms: i64,
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload, stamping the current wall-clock time
    pub fn new(sender_id: PeerId, sender_priority: u32, term: Term, payload: Payload) -> Self {
        Self {
            sender_id,
            sender_priority,
            term,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Message kind
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Serialize into a checksummed frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let header = FrameHeader::new(&body);

        let mut frame = Vec::with_capacity(FrameHeader::SIZE + body.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parse a checksummed frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FrameHeader::SIZE {
            return Err(Error::CorruptMessage(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }

        let (head, body) = frame.split_at(FrameHeader::SIZE);
        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(head);
        let header = FrameHeader::from_bytes(&header_bytes);

        if header.length as usize != body.len() {
            return Err(Error::CorruptMessage(format!(
                "length mismatch: header says {}, body has {}",
                header.length,
                body.len()
            )));
        }

        if crc32fast::hash(body) != header.checksum {
            return Err(Error::CorruptMessage("checksum mismatch".into()));
        }

        bincode::deserialize(body).map_err(|e| Error::CorruptMessage(e.to_string()))
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Envelope {
        Envelope::new(
            "tab-1".to_string(),
            1,
            3,
            Payload::Heartbeat {
                role: PeerRole::Leader,
                leader_id: Some("tab-1".to_string()),
                leases: vec![HeldLease {
                    resource_key: "todos".to_string(),
                    fencing_token: 7,
                    remaining_ms: 1200,
                }],
                slots: vec!["wss://sync.example".to_string()],
                running_queries: vec![],
            },
        )
    }

    #[test]
    fn test_envelope_frame() {
        let envelope = heartbeat();
        let frame = envelope.encode().unwrap();
        let restored = Envelope::decode(&frame).unwrap();

        assert_eq!(restored, envelope);
        assert_eq!(restored.kind(), MessageKind::Heartbeat);
        assert_eq!(restored.kind().to_string(), "heartbeat");
    }

    #[test]
    fn test_corrupt_frames_rejected() {
        let mut frame = heartbeat().encode().unwrap();

        // Flip a body byte
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(Envelope::decode(&frame), Err(Error::CorruptMessage(_))));

        // Truncated
        assert!(matches!(Envelope::decode(&frame[..4]), Err(Error::CorruptMessage(_))));
        assert!(matches!(
            Envelope::decode(&frame[..frame.len() - 3]),
            Err(Error::CorruptMessage(_))
        ));
    }

    #[test]
    fn test_authoritative_kinds() {
        assert!(MessageKind::LeaderAnnounce.is_authoritative());
        assert!(MessageKind::LeaseGrant.is_authoritative());
        assert!(MessageKind::QueryAssign.is_authoritative());
        assert!(!MessageKind::Heartbeat.is_authoritative());
        assert!(!MessageKind::QueryResult.is_authoritative());
    }

    #[test]
    fn test_claim_kind_order() {
        assert!(ClaimKind::Leader > ClaimKind::Fallback);
        assert!(ClaimKind::Fallback > ClaimKind::Request);
    }
}
