//! An in-memory [`Store`] backed by per-row `tokio::sync::Mutex` guards.
//!
//! This is the reference backend the engine's own tests and the demo
//! gateway binary run against. A production deployment swaps in a backend
//! over an embedded B-tree or a remote KV store with optimistic CAS; engine
//! code never changes, only this file does.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::EngineError;
use super::records::{
    DevAddr, Device, DevEui, IgnoredNode, MulticastChannel, Network, NetworkId, Node, Pending,
    Profile, ProfileId,
};
use super::{DeviceTx, JoinTx, NodeTx, Store};

#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<DevAddr, Arc<Mutex<Option<Node>>>>>,
    devices: Mutex<HashMap<DevEui, Arc<Mutex<Option<Device>>>>>,
    profiles: Mutex<HashMap<ProfileId, Profile>>,
    networks: Mutex<HashMap<NetworkId, Network>>,
    ignored: Mutex<Vec<IgnoredNode>>,
    multicast: Mutex<HashMap<DevAddr, MulticastChannel>>,
    pending: Mutex<HashMap<DevAddr, Vec<Pending>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn node_row(&self, devaddr: DevAddr) -> Arc<Mutex<Option<Node>>> {
        let mut nodes = self.nodes.lock().await;
        nodes
            .entry(devaddr)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn device_row(&self, deveui: DevEui) -> Arc<Mutex<Option<Device>>> {
        let mut devices = self.devices.lock().await;
        devices
            .entry(deveui)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Seed a device row outside of any transaction (provisioning).
    pub async fn seed_device(&self, device: Device) {
        let row = self.device_row(device.deveui).await;
        *row.lock().await = Some(device);
    }

    /// Seed a node row outside of any transaction (test/demo scaffolding).
    pub async fn seed_node(&self, node: Node) {
        let row = self.node_row(node.devaddr).await;
        *row.lock().await = Some(node);
    }

    pub async fn seed_profile(&self, profile: Profile) {
        self.profiles.lock().await.insert(profile.id, profile);
    }

    pub async fn seed_network(&self, network: Network) {
        self.networks.lock().await.insert(network.id, network.clone());
    }

    pub async fn seed_ignored(&self, ignored: IgnoredNode) {
        self.ignored.lock().await.push(ignored);
    }
}

struct MemoryNodeTx {
    guard: OwnedMutexGuard<Option<Node>>,
}

impl<'s> NodeTx<'s> for MemoryNodeTx {
    fn node(&self) -> Option<&Node> {
        self.guard.as_ref()
    }

    fn commit(self: Box<Self>, new: Option<Node>) {
        let mut this = *self;
        *this.guard = new;
    }
}

struct MemoryDeviceTx {
    guard: OwnedMutexGuard<Option<Device>>,
}

impl<'s> DeviceTx<'s> for MemoryDeviceTx {
    fn device(&self) -> Option<&Device> {
        self.guard.as_ref()
    }

    fn commit(self: Box<Self>, new: Device) {
        let mut this = *self;
        *this.guard = Some(new);
    }
}

struct MemoryJoinTx {
    device_guard: OwnedMutexGuard<Option<Device>>,
    node_guard: OwnedMutexGuard<Option<Node>>,
}

impl<'s> JoinTx<'s> for MemoryJoinTx {
    fn device(&self) -> Option<&Device> {
        self.device_guard.as_ref()
    }

    fn node(&self) -> Option<&Node> {
        self.node_guard.as_ref()
    }

    fn commit(self: Box<Self>, device: Device, node: Node) {
        let mut this = *self;
        *this.device_guard = Some(device);
        *this.node_guard = Some(node);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lock_node<'s>(&'s self, devaddr: DevAddr) -> Box<dyn NodeTx<'s> + 's> {
        let row = self.node_row(devaddr).await;
        let guard = row.lock_owned().await;
        Box::new(MemoryNodeTx { guard })
    }

    async fn lock_device<'s>(&'s self, deveui: DevEui) -> Box<dyn DeviceTx<'s> + 's> {
        let row = self.device_row(deveui).await;
        let guard = row.lock_owned().await;
        Box::new(MemoryDeviceTx { guard })
    }

    async fn lock_join<'s>(&'s self, deveui: DevEui, devaddr: DevAddr) -> Box<dyn JoinTx<'s> + 's> {
        // Fixed lock order (device, then node) — the only other place a node
        // row is locked is `lock_node`, which never also takes a device
        // lock, so this order can never deadlock against it.
        let device_row = self.device_row(deveui).await;
        let device_guard = device_row.lock_owned().await;
        let node_row = self.node_row(devaddr).await;
        let node_guard = node_row.lock_owned().await;
        Box::new(MemoryJoinTx { device_guard, node_guard })
    }

    async fn get_profile(&self, id: ProfileId) -> Result<Option<Profile>, EngineError> {
        Ok(self.profiles.lock().await.get(&id).copied())
    }

    async fn get_network(&self, id: NetworkId) -> Result<Option<Network>, EngineError> {
        Ok(self.networks.lock().await.get(&id).cloned())
    }

    async fn ignored_nodes(&self) -> Result<Vec<IgnoredNode>, EngineError> {
        Ok(self.ignored.lock().await.clone())
    }

    async fn get_multicast(&self, devaddr: DevAddr) -> Result<Option<MulticastChannel>, EngineError> {
        Ok(self.multicast.lock().await.get(&devaddr).cloned())
    }

    async fn put_multicast(&self, channel: MulticastChannel) -> Result<(), EngineError> {
        self.multicast.lock().await.insert(channel.devaddr, channel);
        Ok(())
    }

    async fn pending_for(&self, devaddr: DevAddr) -> Result<Vec<Pending>, EngineError> {
        Ok(self.pending.lock().await.get(&devaddr).cloned().unwrap_or_default())
    }

    async fn queue_pending(&self, pending: Pending) -> Result<(), EngineError> {
        self.pending.lock().await.entry(pending.devaddr).or_default().push(pending);
        Ok(())
    }

    async fn purge_pending(&self, devaddr: DevAddr) -> Result<(), EngineError> {
        self.pending.lock().await.remove(&devaddr);
        Ok(())
    }

    async fn known_devaddrs(&self) -> Result<Vec<DevAddr>, EngineError> {
        Ok(self.nodes.lock().await.keys().copied().collect())
    }

    async fn known_networks(&self) -> Result<Vec<Network>, EngineError> {
        Ok(self.networks.lock().await.values().cloned().collect())
    }
}
