use std::convert::TryFrom;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::alloc::{Bitmap, BlockRange, DiskUsage};
use crate::io::{SnapshotStore, StoreError};
use crate::node::{self, Node, NodeId, NodeKind, Timestamp};
use crate::path;
use crate::sb::Snapshot;

/// 1 MiB virtual disk.
pub const DEFAULT_DISK_SIZE: u64 = 1024 * 1024;
/// 512 byte blocks, 2048 of them on a default disk.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not enough contiguous space for {requested} blocks")]
    OutOfSpace { requested: u64 },
    #[error("file {0} has no block allocation")]
    NotAllocated(NodeId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("could not persist volume: {0}")]
    Store(#[from] StoreError),
}

/// Volume geometry used when formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    disk_size: u64,
    block_size: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            disk_size: DEFAULT_DISK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl FsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the virtual disk in bytes. Any remainder smaller than a
    /// block is unusable.
    pub fn with_disk_size(mut self, bytes: u64) -> Self {
        self.disk_size = bytes;
        self
    }

    pub fn with_block_size(mut self, bytes: u32) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> Result<u32, FsError> {
        if self.block_size == 0 {
            return Err(FsError::InvalidArgument("block size must be non-zero".to_string()));
        }
        let blocks = self.disk_size / u64::from(self.block_size);
        if blocks == 0 {
            return Err(FsError::InvalidArgument(format!(
                "disk of {} bytes cannot hold a {} byte block",
                self.disk_size, self.block_size
            )));
        }
        u32::try_from(blocks)
            .map_err(|_| FsError::InvalidArgument(format!("{} blocks is more than a volume can track", blocks)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// What a listing or stat reports about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub id: NodeId,
    pub kind: EntryKind,
    /// File size, or the summed size of every file below a directory.
    pub size_bytes: u64,
    pub created: Timestamp,
    pub modified: Timestamp,
}

/// Where a file lives on the disk. `end_byte` is one past the last byte of
/// file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub start_block: u32,
    pub num_blocks: u32,
    pub start_byte: u64,
    pub end_byte: u64,
    pub size_bytes: u64,
    pub block_size: u32,
}

/// Formats a byte count with one decimal place, stepping through B, KB, MB, GB
/// and TB in powers of 1024.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in &["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

fn default_content(name: &str) -> String {
    format!("This is content of file {}", name)
}

/// A single volume: a directory tree whose files are each backed by one
/// contiguous block range.
///
/// Every file node owns exactly one allocation sized to hold its bytes. Blocks
/// are always claimed before the node is linked into the tree, and released only
/// once every file of a deleted subtree is known to have them, so the tree and
/// the bitmap never disagree between calls.
///
/// Each completed mutating call saves the full snapshot to the store. If that
/// save fails the change stays applied in memory and the call returns
/// [`FsError::Store`]; the next successful save writes it out.
pub struct Filesystem<S: SnapshotStore> {
    state: Snapshot,
    store: S,
}

impl<S: SnapshotStore> Filesystem<S> {
    /// Formats a new, empty volume and saves it to `store`, replacing anything
    /// stored there.
    pub fn create(mut store: S, config: FsConfig) -> Result<Self, FsError> {
        let state = Snapshot::format(&config, node::now())?;
        store.save(&state)?;
        info!(
            "Formatted {} block volume with {} byte blocks.",
            state.allocator.total_blocks(),
            config.block_size()
        );
        Ok(Self { state, store })
    }

    /// Opens the volume saved in `store`.
    pub fn open(mut store: S) -> Result<Self, FsError> {
        let state = store.load()?.ok_or(StoreError::Empty)?;
        info!("Opened volume with {} nodes.", state.tree.total_nodes());
        Ok(Self { state, store })
    }

    /// Opens the volume saved in `store`, formatting a new one with `config`
    /// if the store is empty.
    pub fn open_or_create(mut store: S, config: FsConfig) -> Result<Self, FsError> {
        match store.load()? {
            Some(state) => {
                let alloc = &state.allocator;
                if alloc.block_size() != config.block_size()
                    || config.total_blocks().ok() != Some(alloc.total_blocks())
                {
                    warn!(
                        "Saved volume has {} blocks of {} bytes; ignoring requested geometry.",
                        alloc.total_blocks(),
                        alloc.block_size()
                    );
                }
                info!("Opened volume with {} nodes.", state.tree.total_nodes());
                Ok(Self { state, store })
            }
            None => Self::create(store, config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.state
    }

    pub fn block_size(&self) -> u32 {
        self.state.allocator.block_size()
    }

    fn commit(&mut self) -> Result<(), FsError> {
        self.store.save(&self.state)?;
        info!("Saved volume with {} nodes.", self.state.tree.total_nodes());
        Ok(())
    }

    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        self.state.tree.resolve(self.state.current_dir, path)
    }

    fn resolve_existing(&self, path: &str) -> Result<NodeId, FsError> {
        self.resolve(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn resolve_dir(&self, path: &str) -> Result<NodeId, FsError> {
        let id = self.resolve_existing(path)?;
        match self.state.tree.get(id) {
            Some(node) if node.is_dir() => Ok(id),
            _ => Err(FsError::NotADirectory(path.to_string())),
        }
    }

    /// Resolves `path` to a node that may be unlinked or moved, returning its
    /// parent, its name and its id.
    fn resolve_entry(&self, path: &str) -> Result<(NodeId, String, NodeId), FsError> {
        let chain = self
            .state
            .tree
            .resolve_chain(self.state.current_dir, path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if chain.len() < 2 {
            return Err(FsError::InvalidArgument("the root directory cannot be removed or moved".to_string()));
        }
        let target = chain[chain.len() - 1];
        let parent = chain[chain.len() - 2];
        let name = self
            .state
            .tree
            .name_of(parent, target)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok((parent, name.to_string(), target))
    }

    fn check_name(name: &str) -> Result<(), FsError> {
        if path::is_valid_name(name) {
            Ok(())
        } else {
            Err(FsError::InvalidName(name.to_string()))
        }
    }

    pub fn create_directory(&mut self, name: &str, parent: &str) -> Result<NodeId, FsError> {
        Self::check_name(name)?;
        let parent_id = self.resolve_dir(parent)?;
        let now = node::now();
        let id = self
            .state
            .tree
            .insert(parent_id, name, Node::directory(now), now)?;
        debug!("Created directory {} as {}.", name, id);
        self.commit()?;
        Ok(id)
    }

    pub fn create_file(&mut self, name: &str, size_bytes: u64, parent: &str) -> Result<NodeId, FsError> {
        Self::check_name(name)?;
        let parent_id = self.resolve_dir(parent)?;
        let id = self.link_file(parent_id, name, size_bytes, default_content(name))?;
        self.commit()?;
        Ok(id)
    }

    /// Claims blocks for a new file and then links it under `parent`. If the
    /// blocks can't be found nothing is linked.
    fn link_file(&mut self, parent: NodeId, name: &str, size_bytes: u64, content: String) -> Result<NodeId, FsError> {
        if self.state.tree.lookup(parent, name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let id = self.state.tree.next_id();
        let range = self.state.allocator.allocate_file(id, size_bytes)?;

        let now = node::now();
        let file = Node::file(size_bytes, content, now);
        let linked = match self.state.tree.insert(parent, name, file, now) {
            Ok(linked) => linked,
            Err(err) => {
                self.state.allocator.deallocate_file(id)?;
                return Err(err);
            }
        };
        debug_assert_eq!(linked, id);
        debug!(
            "Created file {} as {} on blocks {}..{}.",
            name,
            id,
            range.start_block,
            range.end_block()
        );
        Ok(id)
    }

    /// Deletes a file, or a directory and everything below it, releasing the
    /// blocks of every file removed.
    pub fn delete(&mut self, path: &str) -> Result<(), FsError> {
        let (parent, name, target) = self.resolve_entry(path)?;

        let cwd_chain = self
            .state
            .tree
            .ancestors(self.state.current_dir)
            .unwrap_or_default();
        if cwd_chain.contains(&target) {
            return Err(FsError::InvalidArgument(format!(
                "cannot delete {}, it contains the current directory",
                path
            )));
        }

        // All or nothing: every file must still own its blocks before any are freed.
        let files = self.state.tree.files_under(target);
        if let Some(missing) = files
            .iter()
            .find(|id| self.state.allocator.allocation(**id).is_none())
        {
            error!(
                "Invariant violated: file {} under {} has no block allocation.",
                missing, path
            );
            return Err(FsError::NotAllocated(*missing));
        }

        let mut released: Vec<BlockRange> = Vec::with_capacity(files.len());
        for id in files {
            released.push(self.state.allocator.deallocate_file(id)?);
        }
        self.state.tree.remove(parent, &name, node::now())?;
        debug!(
            "Deleted {} and released {} blocks.",
            path,
            released.iter().map(|r| u64::from(r.block_count)).sum::<u64>()
        );
        self.commit()
    }

    /// Renames the entry `old_name` of directory `parent`. Allocations are
    /// keyed by file identity, so the allocation table is never touched.
    pub fn rename(&mut self, old_name: &str, new_name: &str, parent: &str) -> Result<(), FsError> {
        Self::check_name(new_name)?;
        let parent_id = self.resolve_dir(parent)?;
        self.state
            .tree
            .rename(parent_id, old_name, new_name, node::now())?;
        self.commit()
    }

    /// Moves the node at `src` into the directory `dest_dir`, keeping its name.
    pub fn move_entry(&mut self, src: &str, dest_dir: &str) -> Result<(), FsError> {
        let (parent, name, _) = self.resolve_entry(src)?;
        let dest = self.resolve_dir(dest_dir)?;
        self.state
            .tree
            .move_node(parent, &name, dest, node::now())?;
        self.commit()
    }

    /// Copies the file at `src` into `dest_dir` under the same name. The copy
    /// gets its own first-fit allocation.
    pub fn copy_file(&mut self, src: &str, dest_dir: &str) -> Result<NodeId, FsError> {
        let (_, name, target) = self.resolve_entry(src)?;
        let (size_bytes, content) = match self.state.tree.get(target).map(|node| &node.kind) {
            Some(NodeKind::File {
                size_bytes,
                content,
            }) => (*size_bytes, content.clone()),
            _ => return Err(FsError::NotAFile(src.to_string())),
        };
        let dest = self.resolve_dir(dest_dir)?;
        let id = self.link_file(dest, &name, size_bytes, content)?;
        self.commit()?;
        Ok(id)
    }

    /// Replaces a file's content and resizes its allocation to fit. The file
    /// keeps its old blocks and content if no run large enough exists.
    pub fn write_file(&mut self, path: &str, content: &str) -> Result<(), FsError> {
        let id = self.resolve_existing(path)?;
        match self.state.tree.get(id) {
            Some(node) if !node.is_dir() => {}
            _ => return Err(FsError::NotAFile(path.to_string())),
        }

        let size = content.len() as u64;
        self.state.allocator.reallocate_file(id, size)?;

        let now = node::now();
        if let Some(file) = self.state.tree.get_mut(id) {
            file.kind = NodeKind::File {
                size_bytes: size,
                content: content.to_string(),
            };
            file.modified = now;
        }
        self.commit()
    }

    pub fn change_directory(&mut self, path: &str) -> Result<(), FsError> {
        let id = self.resolve_dir(path)?;
        self.state.current_dir = id;
        self.commit()
    }

    /// Absolute path of the working directory.
    pub fn current_dir(&self) -> String {
        self.state
            .tree
            .path_of(self.state.current_dir)
            .unwrap_or_else(|| "/".to_string())
    }

    fn entry_info(&self, name: &str, id: NodeId) -> Option<EntryInfo> {
        let node = self.state.tree.get(id)?;
        let kind = match node.kind {
            NodeKind::Directory { .. } => EntryKind::Directory,
            NodeKind::File { .. } => EntryKind::File,
        };
        Some(EntryInfo {
            name: name.to_string(),
            id,
            kind,
            size_bytes: self.state.tree.total_size(id),
            created: node.created,
            modified: node.modified,
        })
    }

    /// Entries of the directory at `path` in the order they were added.
    pub fn list(&self, path: &str) -> Result<Vec<EntryInfo>, FsError> {
        let id = self.resolve_dir(path)?;
        let entries = self
            .state
            .tree
            .get(id)
            .and_then(Node::entries)
            .unwrap_or(&[]);
        Ok(entries
            .iter()
            .filter_map(|entry| self.entry_info(&entry.name, entry.id))
            .collect())
    }

    pub fn stat(&self, path: &str) -> Result<EntryInfo, FsError> {
        let chain = self
            .state
            .tree
            .resolve_chain(self.state.current_dir, path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let id = chain[chain.len() - 1];
        let name = match chain.len() {
            1 => "/",
            len => self.state.tree.name_of(chain[len - 2], id).unwrap_or_default(),
        };
        self.entry_info(name, id)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    pub fn file_content(&self, path: &str) -> Result<&str, FsError> {
        let id = self.resolve_existing(path)?;
        match self.state.tree.get(id).map(|node| &node.kind) {
            Some(NodeKind::File { content, .. }) => Ok(content),
            _ => Err(FsError::NotAFile(path.to_string())),
        }
    }

    pub fn usage(&self) -> DiskUsage {
        self.state.allocator.usage()
    }

    pub fn bitmap(&self) -> &Bitmap {
        self.state.allocator.bitmap()
    }

    /// Block placement of the file at `path`, or `None` if `path` is not a file
    /// with an allocation.
    pub fn allocation_info(&self, path: &str) -> Option<AllocationInfo> {
        let id = self.resolve(path)?;
        let size_bytes = match self.state.tree.get(id)?.kind {
            NodeKind::File { size_bytes, .. } => size_bytes,
            NodeKind::Directory { .. } => return None,
        };
        let range = self.state.allocator.allocation(id)?;
        let block_size = self.block_size();
        let start_byte = u64::from(range.start_block) * u64::from(block_size);
        Some(AllocationInfo {
            start_block: range.start_block,
            num_blocks: range.block_count,
            start_byte,
            end_byte: start_byte + size_bytes,
            size_bytes,
            block_size,
        })
    }
}
