//! Abstract transactional access to the five record families.
//!
//! The contract callers depend on: every lock handed out is an exclusive,
//! per-row write lock; the returned guard's `commit` is the only way a
//! mutation becomes visible, and simply dropping the guard aborts the
//! transaction with no partial write — this is literally "abort-on-drop"
//! rather than a functional `transaction(fn)` wrapper, because
//! RAII guards are the idiomatic Rust expression of the same contract.

pub mod memory;
pub mod records;

use async_trait::async_trait;

use crate::error::EngineError;
use records::{Device, DevAddr, DevEui, IgnoredNode, MulticastChannel, Network, NetworkId, Pending, Profile, ProfileId};

/// Exclusive handle on a single `node` row. Holding one serializes all other
/// `lock_node`/`lock_join` calls for the same devaddr.
pub trait NodeTx<'s>: Send {
    fn node(&self) -> Option<&records::Node>;
    /// Commit the new row value (`None` deletes the row). Consumes the
    /// guard, making this the only way a write becomes visible.
    fn commit(self: Box<Self>, new: Option<records::Node>);
}

/// Exclusive handle on a single `device` row.
pub trait DeviceTx<'s>: Send {
    fn device(&self) -> Option<&Device>;
    fn commit(self: Box<Self>, new: Device);
}

/// Joint exclusive handle on a `device` row and its `node` row, used only by
/// join handling, which must update both atomically.
pub trait JoinTx<'s>: Send {
    fn device(&self) -> Option<&Device>;
    fn node(&self) -> Option<&records::Node>;
    fn commit(self: Box<Self>, device: Device, node: records::Node);
}

/// The store adapter: the only interface into persistence.
#[async_trait]
pub trait Store: Send + Sync {
    async fn lock_node<'s>(&'s self, devaddr: DevAddr) -> Box<dyn NodeTx<'s> + 's>;
    async fn lock_device<'s>(&'s self, deveui: DevEui) -> Box<dyn DeviceTx<'s> + 's>;
    async fn lock_join<'s>(&'s self, deveui: DevEui, devaddr: DevAddr) -> Box<dyn JoinTx<'s> + 's>;

    /// Read-only lookups; profiles/networks are reference data maintained
    /// externally, never mutated by the engine.
    async fn get_profile(&self, id: ProfileId) -> Result<Option<Profile>, EngineError>;
    async fn get_network(&self, id: NetworkId) -> Result<Option<Network>, EngineError>;

    /// `dirty_all_keys` over the `ignored_nodes` family: a full, lock-free
    /// scan used once per uplink.
    async fn ignored_nodes(&self) -> Result<Vec<IgnoredNode>, EngineError>;

    async fn get_multicast(&self, devaddr: DevAddr) -> Result<Option<MulticastChannel>, EngineError>;
    async fn put_multicast(&self, channel: MulticastChannel) -> Result<(), EngineError>;

    /// `dirty_read`: peek at queued downlinks without taking a row lock.
    async fn pending_for(&self, devaddr: DevAddr) -> Result<Vec<Pending>, EngineError>;
    async fn queue_pending(&self, pending: Pending) -> Result<(), EngineError>;
    /// `dirty_delete`: purge queued downlinks on reset/rejoin.
    async fn purge_pending(&self, devaddr: DevAddr) -> Result<(), EngineError>;

    /// Every currently-known devaddr, used by devaddr allocation to avoid
    /// collisions.
    async fn known_devaddrs(&self) -> Result<Vec<DevAddr>, EngineError>;

    /// Every locally-served network, used to tell an unprovisioned devaddr
    /// apart from one that is simply foreign.
    async fn known_networks(&self) -> Result<Vec<Network>, EngineError>;
}
