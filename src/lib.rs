//! WolfCoord - Multi-Context Coordination for Local-First Databases
//!
//! Several contexts (tabs, workers, processes) share one local database and
//! one remote sync target. WolfCoord lets them agree on who does what
//! without a central server: they find each other over a broadcast
//! transport, elect a leader, and route contended work through it.
//!
//! # Architecture
//!
//! Every context runs the same [`Coordinator`]. The leader hands out fenced
//! write leases, assigns each in-flight query to a single executor, and
//! owns the live connection to each remote sync endpoint. When the primary
//! transport is missing the coordinator falls back to a polled SQLite
//! mailbox, and with no transport at all it runs standalone.
//!
//! # Features
//!
//! - Heartbeat membership with priority-ranked leader election
//! - Write leases with monotonically increasing fencing tokens
//! - Cross-context query deduplication
//! - One live connection per remote sync endpoint
//! - Graceful degradation: full, polling and standalone modes

pub mod config;
pub mod degrade;
pub mod error;
pub mod events;
pub mod lease;
pub mod node;
pub mod protocol;
pub mod query;
pub mod slot;
pub mod state;
pub mod transport;

pub use config::CoordConfig;
pub use error::{Error, Result};
pub use node::{Coordinator, CoordinatorStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::CoordConfig;
    pub use crate::degrade::{CapabilityChange, CapabilityReport, Mode, Transports};
    pub use crate::error::{Error, Result};
    pub use crate::events::SubscriptionId;
    pub use crate::lease::{AcquireOutcome, Denial, Lease, LockOptions};
    pub use crate::node::{Coordinator, CoordinatorStats};
    pub use crate::slot::{SlotClaim, SlotEvent};
    pub use crate::state::LeaderChange;
    pub use crate::transport::{MemoryBus, PolledTransport, Transport};
}
