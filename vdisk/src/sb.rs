use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryInto;
use std::mem::size_of;

use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::alloc::{Bitmap, BlockAllocator, BlockRange, State};
use crate::fs::{FsConfig, FsError};
use crate::io::StoreError;
use crate::node::{DirEntry, Namespace, Node, NodeId, NodeKind, Timestamp};
use crate::path;

const SB_MAGIC: u32 = 0x5644_534B; // VDSK
const SB_VERSION: u32 = 1;

const TAG_DIRECTORY: u8 = 0;
const TAG_FILE: u8 = 1;

/// Everything needed to bring a volume back: the namespace, the bitmap and
/// allocation table, and the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub tree: Namespace,
    pub allocator: BlockAllocator,
    pub current_dir: NodeId,
}

impl Snapshot {
    /// A freshly formatted volume: an empty root directory and an all-free bitmap.
    pub fn format(config: &FsConfig, now: Timestamp) -> Result<Self, FsError> {
        let total_blocks = config.total_blocks()?;
        Ok(Self {
            tree: Namespace::new(now),
            allocator: BlockAllocator::new(total_blocks, config.block_size()),
            current_dir: NodeId::ROOT,
        })
    }

    /// Checks that the tree is well formed and that the allocator agrees with it:
    ///
    /// 1. every file has exactly one allocation sized `ceil(size / block_size)`,
    /// 2. allocations are disjoint and the bitmap marks exactly their blocks,
    /// 3. names are valid and unique within each directory,
    /// 4. the working directory is a live directory.
    pub fn validate(&self) -> Result<(), String> {
        let nodes = self.tree.nodes();
        match nodes.get(&NodeId::ROOT) {
            Some(root) if root.is_dir() => {}
            _ => return Err("root directory missing".to_string()),
        }

        let mut parents: BTreeMap<NodeId, usize> = BTreeMap::new();
        for (id, node) in nodes {
            if id.as_raw() >= self.tree.next_id().as_raw() {
                return Err(format!("node {} is past the id counter", id));
            }
            let entries = match node.entries() {
                Some(entries) => entries,
                None => continue,
            };
            let mut names = BTreeSet::new();
            for entry in entries {
                if !path::is_valid_name(&entry.name) {
                    return Err(format!("invalid name {:?} in {}", entry.name, id));
                }
                if !names.insert(entry.name.as_str()) {
                    return Err(format!("duplicate name {:?} in {}", entry.name, id));
                }
                if entry.id == NodeId::ROOT || !nodes.contains_key(&entry.id) {
                    return Err(format!("{} lists unknown node {}", id, entry.id));
                }
                *parents.entry(entry.id).or_insert(0) += 1;
            }
        }
        for id in nodes.keys().filter(|id| **id != NodeId::ROOT) {
            match parents.get(id).copied() {
                Some(1) => {}
                count => return Err(format!("node {} has {} parents", id, count.unwrap_or(0))),
            }
        }
        if self.tree.post_order(NodeId::ROOT).len() != nodes.len() {
            return Err("namespace contains unreachable nodes".to_string());
        }

        let alloc = &self.allocator;
        if alloc.block_size() == 0 {
            return Err("block size is zero".to_string());
        }
        for (id, node) in nodes {
            if let NodeKind::File { size_bytes, .. } = node.kind {
                let range = alloc
                    .allocation(*id)
                    .ok_or_else(|| format!("file {} has no allocation", id))?;
                if u64::from(range.block_count) != alloc.blocks_for(size_bytes) {
                    return Err(format!("file {} holds {} blocks for {} bytes", id, range.block_count, size_bytes));
                }
            }
        }

        let mut expected = Bitmap::new(alloc.total_blocks());
        for (id, range) in alloc.table() {
            match nodes.get(id) {
                Some(node) if !node.is_dir() => {}
                _ => return Err(format!("allocation for {} which is not a file", id)),
            }
            if range.end_block() > u64::from(alloc.total_blocks()) {
                return Err(format!("allocation of {} runs past the end of the volume", id));
            }
            for blocknr in range.blocks() {
                if expected.get(blocknr) == State::Used {
                    return Err(format!("block {} is allocated twice", blocknr));
                }
                expected.set_reserved(blocknr);
            }
        }
        if expected != *alloc.bitmap() {
            return Err("bitmap disagrees with allocation table".to_string());
        }

        match nodes.get(&self.current_dir) {
            Some(node) if node.is_dir() => Ok(()),
            _ => Err(format!("working directory {} is not a directory", self.current_dir)),
        }
    }
}

/// Fixed-size header at the start of every snapshot image.
///
/// # Layout
/// ==================================================================
/// | Header | Bitmap words | Allocation table | Node records        |
/// ==================================================================
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy, Debug)]
struct SnapshotHeader {
    /// A 32-bit identifying string, in this case VDSK.
    magic: U32<BigEndian>,
    version: U32<BigEndian>,
    block_size: U32<BigEndian>,
    total_blocks: U32<BigEndian>,
    table_len: U32<BigEndian>,
    node_count: U32<BigEndian>,
    next_id: U32<BigEndian>,
    current_dir: U32<BigEndian>,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy, Debug)]
struct TableEntry {
    id: U32<BigEndian>,
    start_block: U32<BigEndian>,
    block_count: U32<BigEndian>,
}

fn be32(value: u32) -> U32<BigEndian> {
    U32::new(value)
}

/// Serializes a snapshot. Multi-byte fields are big endian; strings are
/// length-prefixed UTF-8.
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let alloc = &snapshot.allocator;
    let nodes = snapshot.tree.nodes();

    let header = SnapshotHeader {
        magic: be32(SB_MAGIC),
        version: be32(SB_VERSION),
        block_size: be32(alloc.block_size()),
        total_blocks: be32(alloc.total_blocks()),
        table_len: be32(alloc.table().len() as u32),
        node_count: be32(nodes.len() as u32),
        next_id: be32(snapshot.tree.next_id().as_raw()),
        current_dir: be32(snapshot.current_dir.as_raw()),
    };

    let mut buf = Vec::new();
    buf.extend_from_slice(header.as_bytes());
    for word in alloc.bitmap().words() {
        buf.extend_from_slice(&word.to_be_bytes());
    }
    for (id, range) in alloc.table() {
        let entry = TableEntry {
            id: be32(id.as_raw()),
            start_block: be32(range.start_block),
            block_count: be32(range.block_count),
        };
        buf.extend_from_slice(entry.as_bytes());
    }
    for (id, node) in nodes {
        buf.extend_from_slice(&id.as_raw().to_be_bytes());
        match &node.kind {
            NodeKind::Directory { .. } => buf.push(TAG_DIRECTORY),
            NodeKind::File { .. } => buf.push(TAG_FILE),
        }
        buf.extend_from_slice(&node.created.to_be_bytes());
        buf.extend_from_slice(&node.modified.to_be_bytes());
        match &node.kind {
            NodeKind::Directory { entries } => {
                buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for entry in entries {
                    buf.extend_from_slice(&entry.id.as_raw().to_be_bytes());
                    put_str(&mut buf, &entry.name);
                }
            }
            NodeKind::File {
                size_bytes,
                content,
            } => {
                buf.extend_from_slice(&size_bytes.to_be_bytes());
                put_str(&mut buf, content);
            }
        }
    }
    buf
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Parses and validates a snapshot image produced by [`encode`].
pub fn decode(image: &[u8]) -> Result<Snapshot, StoreError> {
    let mut reader = Reader { buf: image };

    let header: SnapshotHeader = reader.record()?;
    if header.magic.get() != SB_MAGIC {
        return Err(StoreError::BadMagic);
    }
    if header.version.get() != SB_VERSION {
        return Err(StoreError::UnsupportedVersion(header.version.get()));
    }

    let total_blocks = header.total_blocks.get();
    let word_count = (total_blocks as usize + 63) / 64;
    // Take the whole region first so a forged block count can't force a huge allocation.
    let word_bytes = reader.take(word_count * 8)?;
    let words = word_bytes
        .chunks_exact(8)
        .map(|chunk| chunk.try_into().map(u64::from_be_bytes))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| StoreError::Truncated)?;
    let bitmap = Bitmap::from_words(words, total_blocks)
        .ok_or_else(|| StoreError::Corrupt("bitmap marks blocks past the end of the volume".to_string()))?;

    let mut table = BTreeMap::new();
    for _ in 0..header.table_len.get() {
        let entry: TableEntry = reader.record()?;
        let range = BlockRange::new(entry.start_block.get(), entry.block_count.get());
        if table.insert(NodeId::from_raw(entry.id.get()), range).is_some() {
            return Err(StoreError::Corrupt("duplicate allocation table entry".to_string()));
        }
    }

    let mut nodes = BTreeMap::new();
    for _ in 0..header.node_count.get() {
        let id = NodeId::from_raw(reader.u32()?);
        let tag = reader.u8()?;
        let created = reader.u64()?;
        let modified = reader.u64()?;
        let kind = match tag {
            TAG_DIRECTORY => {
                let count = reader.u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let child = NodeId::from_raw(reader.u32()?);
                    let name = reader.string()?;
                    entries.push(DirEntry { name, id: child });
                }
                NodeKind::Directory { entries }
            }
            TAG_FILE => {
                let size_bytes = reader.u64()?;
                let content = reader.string()?;
                NodeKind::File {
                    size_bytes,
                    content,
                }
            }
            other => return Err(StoreError::Corrupt(format!("unknown node tag {}", other))),
        };
        let node = Node {
            kind,
            created,
            modified,
        };
        if nodes.insert(id, node).is_some() {
            return Err(StoreError::Corrupt(format!("node {} appears twice", id)));
        }
    }
    if !reader.buf.is_empty() {
        return Err(StoreError::Corrupt(format!("{} trailing bytes", reader.buf.len())));
    }

    let snapshot = Snapshot {
        tree: Namespace::from_parts(nodes, header.next_id.get()),
        allocator: BlockAllocator::from_parts(header.block_size.get(), bitmap, table),
        current_dir: NodeId::from_raw(header.current_dir.get()),
    };
    snapshot.validate().map_err(StoreError::Corrupt)?;
    Ok(snapshot)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], StoreError> {
        if self.buf.len() < len {
            return Err(StoreError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn record<T: FromBytes>(&mut self) -> Result<T, StoreError> {
        let bytes = self.take(size_of::<T>())?;
        T::read_from(bytes).ok_or(StoreError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, StoreError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().map_err(|_| StoreError::Truncated)?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, StoreError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| StoreError::Truncated)?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn string(&mut self) -> Result<String, StoreError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::Corrupt("string is not valid utf-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Snapshot {
        let mut snapshot = Snapshot::format(&FsConfig::new().with_disk_size(8 * 512), 10).unwrap();
        let tree = &mut snapshot.tree;
        let docs = tree.insert(NodeId::ROOT, "docs", Node::directory(11), 11).unwrap();
        let id = tree.next_id();
        snapshot.allocator.allocate_file(id, 1000).unwrap();
        tree.insert(docs, "a.txt", Node::file(1000, "hello".to_string(), 12), 12).unwrap();
        snapshot.current_dir = docs;
        snapshot
    }

    #[test]
    fn can_encode_and_decode_snapshots() {
        let snapshot = populated();
        let parsed = decode(&encode(&snapshot)).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn header_is_fixed_size_big_endian() {
        let image = encode(&populated());
        assert_eq!(size_of::<SnapshotHeader>(), 32);
        assert_eq!(&image[0..4], b"VDSK");
        assert_eq!(&image[8..12], &512u32.to_be_bytes());
    }

    #[test]
    fn deep_trees_decode_and_validate() {
        let mut snapshot = Snapshot::format(&FsConfig::default(), 1).unwrap();
        let mut current = NodeId::ROOT;
        for _ in 0..100_000 {
            current = snapshot.tree.insert(current, "d", Node::directory(1), 1).unwrap();
        }
        snapshot.current_dir = current;

        let parsed = decode(&encode(&snapshot)).unwrap();
        assert_eq!(parsed.tree.ancestors(current).map(|chain| chain.len()), Some(100_001));
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let mut image = encode(&populated());
        image[0] = b'X';
        assert!(matches!(decode(&image), Err(StoreError::BadMagic)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut image = encode(&populated());
        image[4..8].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(decode(&image), Err(StoreError::UnsupportedVersion(9))));
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(decode(&[0; 8]), Err(StoreError::Truncated)));
        let image = encode(&populated());
        assert!(matches!(decode(&image[..image.len() - 1]), Err(StoreError::Truncated)));
    }

    #[test]
    fn bitmap_that_disagrees_with_table_is_corrupt() {
        let mut image = encode(&populated());
        // First bitmap word follows the 32 byte header; flip the highest used bit off.
        image[32 + 7] = 0b01;
        match decode(&image) {
            Err(StoreError::Corrupt(msg)) => assert!(msg.contains("bitmap")),
            other => panic!("expected corrupt snapshot, got {:?}", other),
        }
    }

    #[test]
    fn validate_catches_missing_allocation() {
        let mut snapshot = populated();
        let file = snapshot.tree.resolve(NodeId::ROOT, "/docs/a.txt").unwrap();
        snapshot.allocator.deallocate_file(file).unwrap();

        let err = snapshot.validate().unwrap_err();
        assert!(err.contains("no allocation"), "{}", err);
    }

    #[test]
    fn validate_catches_stale_working_directory() {
        let mut snapshot = populated();
        snapshot.current_dir = snapshot.tree.resolve(NodeId::ROOT, "/docs/a.txt").unwrap();
        assert!(snapshot.validate().is_err());
    }
}
