//! Destination-side import lifecycle for `CLUSTER IMPORT`.
//!
//! The source drives three transitions: START clears any resident keys of
//! the slot and admits restore traffic, SUCCESS grants local ownership, and
//! FAILED rolls the slot back to empty. Only one slot imports at a time.

use std::sync::{Arc, Mutex};

use crate::cluster::Cluster;
use crate::db::Db;
use crate::slot::SlotId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportStatus {
    None,
    Started,
    Success,
    Failed,
}

struct ImportState {
    slot: Option<SlotId>,
    status: ImportStatus,
}

pub struct SlotImporter {
    db: Db,
    cluster: Arc<Cluster>,
    inner: Mutex<ImportState>,
}

impl SlotImporter {
    pub fn new(db: Db, cluster: Arc<Cluster>) -> Self {
        Self {
            db,
            cluster,
            inner: Mutex::new(ImportState {
                slot: None,
                status: ImportStatus::None,
            }),
        }
    }

    pub fn start(&self, slot: SlotId) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        if state.status == ImportStatus::Started {
            anyhow::bail!(
                "only one importing slot is allowed, current slot is {}",
                state.slot.unwrap_or_default()
            );
        }
        // Drop whatever this node still holds for the slot so replayed
        // restore commands start from a clean state.
        let removed = self.db.clear_slot(slot)?;
        state.slot = Some(slot);
        state.status = ImportStatus::Started;
        tracing::info!(slot, removed, "import started");
        Ok(())
    }

    pub fn success(&self, slot: SlotId) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        anyhow::ensure!(
            state.slot == Some(slot) && state.status == ImportStatus::Started,
            "mismatched import slot {slot}"
        );
        self.cluster.set_slot_imported(slot)?;
        state.status = ImportStatus::Success;
        tracing::info!(slot, "import succeeded");
        Ok(())
    }

    pub fn fail(&self, slot: SlotId) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        anyhow::ensure!(state.slot == Some(slot), "mismatched import slot {slot}");
        let removed = self.db.clear_slot(slot)?;
        state.status = ImportStatus::Failed;
        tracing::warn!(slot, removed, "import failed, slot rolled back");
        Ok(())
    }

    /// Slot currently accepting restore traffic, if any.
    pub fn importing_slot(&self) -> Option<SlotId> {
        self.inner
            .lock()
            .ok()
            .and_then(|state| (state.status == ImportStatus::Started).then(|| state.slot).flatten())
    }

    pub fn status(&self) -> (Option<SlotId>, ImportStatus) {
        match self.inner.lock() {
            Ok(state) => (state.slot, state.status),
            Err(_) => (None, ImportStatus::None),
        }
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, ImportState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("import state lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::storage::Storage;

    fn importer() -> (tempfile::TempDir, SlotImporter, Db, Arc<Cluster>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let db = Db::new(storage.clone());
        let cluster = Arc::new(Cluster::open(&storage).unwrap());
        let importer = SlotImporter::new(db.clone(), cluster.clone());
        (dir, importer, db, cluster)
    }

    #[test]
    fn start_clears_resident_keys_and_admits_one_slot() {
        let (_dir, importer, db, _cluster) = importer();
        db.set_string(b"{x}k", b"stale", 0).unwrap();
        let slot = crate::slot::key_slot(b"{x}k");

        importer.start(slot).unwrap();
        assert_eq!(db.get_string(b"{x}k").unwrap(), None);
        assert_eq!(importer.importing_slot(), Some(slot));
        assert!(importer.start(slot.wrapping_add(1) % 16384).is_err());
    }

    #[test]
    fn success_grants_ownership() {
        let (_dir, importer, _db, cluster) = importer();
        cluster.set_slot_migrated(5, "elsewhere:1").unwrap();
        importer.start(5).unwrap();
        importer.success(5).unwrap();
        assert!(!cluster.is_migrated(5));
        assert_eq!(importer.status(), (Some(5), ImportStatus::Success));
        assert_eq!(importer.importing_slot(), None);
    }

    #[test]
    fn fail_rolls_the_slot_back() {
        let (_dir, importer, db, _cluster) = importer();
        let slot = crate::slot::key_slot(b"{y}k");
        importer.start(slot).unwrap();
        db.set_string(b"{y}k", b"partial", 0).unwrap();
        importer.fail(slot).unwrap();
        assert_eq!(db.get_string(b"{y}k").unwrap(), None);
        assert_eq!(importer.status(), (Some(slot), ImportStatus::Failed));
    }

    #[test]
    fn success_for_wrong_slot_is_rejected() {
        let (_dir, importer, _db, _cluster) = importer();
        importer.start(3).unwrap();
        assert!(importer.success(4).is_err());
    }
}
