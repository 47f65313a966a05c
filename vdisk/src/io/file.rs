use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::NamedTempFile;

use crate::io::{SnapshotStore, StoreError};
use crate::sb::{self, Snapshot};

/// Persists snapshots to a single file on the host.
///
/// Each save writes the whole image to a temporary file in the same directory
/// and renames it over the target, so a crash mid-save leaves the previous
/// snapshot intact.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// The file does not have to exist yet. A missing file loads as an empty store.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl SnapshotStore for FileStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let image = sb::encode(snapshot);

        let mut staged = NamedTempFile::new_in(self.parent_dir())?;
        staged.write_all(&image)?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|err| err.error)?;

        debug!("Wrote {} byte snapshot to {}.", image.len(), self.path.display());
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        let image = match fs::read(&self.path) {
            Ok(image) => image,
            // Return an empty store rather than an error if nothing was saved yet.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        sb::decode(&image).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsConfig;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("volume.vdisk"));

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn can_save_and_reload_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.vdisk");
        let snapshot = Snapshot::format(&FsConfig::default(), 1).unwrap();

        FileStore::new(&path).save(&snapshot).unwrap();

        assert!(path.exists());
        assert_eq!(FileStore::new(&path).load().unwrap(), Some(snapshot));
    }

    #[test]
    fn save_replaces_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.vdisk");
        let mut store = FileStore::new(&path);

        let small = Snapshot::format(&FsConfig::new().with_disk_size(4096), 1).unwrap();
        let large = Snapshot::format(&FsConfig::default(), 2).unwrap();
        store.save(&small).unwrap();
        store.save(&large).unwrap();

        assert_eq!(store.load().unwrap(), Some(large));
        // Only the target remains, staged copies are renamed away.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.vdisk");
        let snapshot = Snapshot::format(&FsConfig::default(), 1).unwrap();
        let image = sb::encode(&snapshot);
        fs::write(&path, &image[..image.len() / 2]).unwrap();

        match FileStore::new(&path).load() {
            Err(StoreError::Truncated) => (),
            other => panic!("expected truncated snapshot, got {:?}", other),
        }
    }
}
