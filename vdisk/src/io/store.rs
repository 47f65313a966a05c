use thiserror::Error;

use crate::sb::Snapshot;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot magic constant invalid")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot ended early")]
    Truncated,
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("no snapshot has been saved")]
    Empty,
}

/// Where a volume goes between runs. The filesystem calls `save` once after
/// every completed mutating operation, so a store always holds a state in which
/// the allocator and the namespace agree.
pub trait SnapshotStore {
    /// Persists the full snapshot, replacing whatever was stored before.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be written in full. The
    /// previous snapshot must remain readable in that case.
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;
    /// Reads back the last saved snapshot, or `None` if nothing was saved yet.
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError>;
}
