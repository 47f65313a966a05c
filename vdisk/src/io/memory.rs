use crate::io::{SnapshotStore, StoreError};
use crate::sb::{self, Snapshot};

/// Keeps the encoded snapshot in memory. Snapshots still pass through the
/// binary codec so a load returns exactly what a file store would.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    image: Option<Vec<u8>>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a previously encoded image, e.g. one read from elsewhere.
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            image: Some(image),
            saves: 0,
        }
    }

    /// Number of successful saves since the store was created.
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.image = Some(sb::encode(snapshot));
        self.saves += 1;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        match &self.image {
            Some(image) => sb::decode(image).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsConfig;

    #[test]
    fn empty_store_loads_nothing() {
        let mut store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn save_then_load_returns_same_snapshot() {
        let snapshot = Snapshot::format(&FsConfig::default(), 42).unwrap();
        let mut store = MemoryStore::new();

        store.save(&snapshot).unwrap();

        assert_eq!(store.load().unwrap(), Some(snapshot));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn garbage_image_is_rejected() {
        let mut store = MemoryStore::from_image(vec![0; 64]);
        match store.load() {
            Err(StoreError::BadMagic) => (),
            other => panic!("expected bad magic, got {:?}", other),
        }
    }
}
