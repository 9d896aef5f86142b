//! Minimal cluster topology: which slots have permanently moved away, and
//! which were imported here.
//!
//! A node starts out serving every slot. Migrating a slot away installs a
//! persistent moved-elsewhere rule so the write path answers `MOVED` even
//! after a restart; importing a slot grants (or restores) local ownership.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use fjall::PartitionHandle;
use serde::{Deserialize, Serialize};

use crate::slot::SlotId;
use crate::storage::Storage;

const TOPOLOGY_KEY: &[u8] = b"topology";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Topology {
    /// Slot -> destination `ip:port` it was migrated to.
    migrated: BTreeMap<SlotId, String>,
    /// Slots imported onto this node.
    imported: BTreeSet<SlotId>,
}

pub struct Cluster {
    partition: PartitionHandle,
    inner: RwLock<Topology>,
}

impl Cluster {
    pub fn open(storage: &Storage) -> anyhow::Result<Self> {
        let partition = storage.open_extra_partition("cluster")?;
        let topology = match partition.get(TOPOLOGY_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Topology::default(),
        };
        Ok(Self {
            partition,
            inner: RwLock::new(topology),
        })
    }

    /// Record that `slot` now lives on `dst`; writes and reads for it answer
    /// `MOVED` from here on.
    pub fn set_slot_migrated(&self, slot: SlotId, dst: &str) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("cluster topology lock poisoned"))?;
        inner.migrated.insert(slot, dst.to_string());
        inner.imported.remove(&slot);
        self.persist(&inner)?;
        tracing::info!(slot, dst, "slot migrated away");
        Ok(())
    }

    /// Record that `slot` was imported here, restoring local ownership.
    pub fn set_slot_imported(&self, slot: SlotId) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("cluster topology lock poisoned"))?;
        inner.migrated.remove(&slot);
        inner.imported.insert(slot);
        self.persist(&inner)?;
        tracing::info!(slot, "slot imported");
        Ok(())
    }

    /// Destination of a moved slot, when one is recorded.
    pub fn migrated_dst(&self, slot: SlotId) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.migrated.get(&slot).cloned())
    }

    pub fn is_migrated(&self, slot: SlotId) -> bool {
        self.migrated_dst(slot).is_some()
    }

    fn persist(&self, topology: &Topology) -> anyhow::Result<()> {
        self.partition
            .insert(TOPOLOGY_KEY, serde_json::to_vec(topology)?)?;
        Ok(())
    }
}
