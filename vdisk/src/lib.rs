//! A virtual disk: a hierarchical namespace of files and directories laid over a
//! fixed number of equally sized blocks.
//!
//! Every file owns one contiguous run of blocks, found by a first-fit scan of the
//! block bitmap. The whole volume is saved as a single binary snapshot after each
//! change, either to a host file ([`io::FileStore`]) or to memory
//! ([`io::MemoryStore`]).
//!
//! ```no_run
//! use vdisk::{Filesystem, FsConfig, io::FileStore};
//!
//! let mut fs = Filesystem::open_or_create(FileStore::new("storage.vdisk"), FsConfig::default())?;
//! fs.create_directory("docs", "/")?;
//! fs.create_file("notes.txt", 1500, "/docs")?;
//! println!("{:?}", fs.allocation_info("/docs/notes.txt"));
//! # Ok::<(), vdisk::FsError>(())
//! ```

pub mod alloc;
pub mod fs;
pub mod io;
pub mod node;
pub mod path;
pub mod sb;

pub use crate::alloc::{Bitmap, BlockRange, DiskUsage, State};
pub use crate::fs::{
    format_size, AllocationInfo, EntryInfo, EntryKind, Filesystem, FsConfig, FsError,
    DEFAULT_BLOCK_SIZE, DEFAULT_DISK_SIZE,
};
pub use crate::node::NodeId;
