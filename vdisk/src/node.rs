use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs::FsError;
use crate::path;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

pub fn now() -> Timestamp {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_secs())
    .unwrap_or(0)
}

/// Stable identity of a node. Ids are never reused, so a file's id doubles as
/// the key of its block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
  pub const ROOT: NodeId = NodeId(0);

  pub fn from_raw(raw: u32) -> Self {
    NodeId(raw)
  }

  pub fn as_raw(self) -> u32 {
    self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  pub name: String,
  pub id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
  /// Children in insertion order.
  Directory { entries: Vec<DirEntry> },
  File { size_bytes: u64, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
  pub kind: NodeKind,
  /// The time the node was created in seconds since epoch.
  pub created: Timestamp,
  /// The time the node was last renamed, moved or written.
  pub modified: Timestamp,
}

impl Node {
  pub fn directory(now: Timestamp) -> Self {
    Self {
      kind: NodeKind::Directory { entries: Vec::new() },
      created: now,
      modified: now,
    }
  }

  pub fn file(size_bytes: u64, content: String, now: Timestamp) -> Self {
    Self {
      kind: NodeKind::File { size_bytes, content },
      created: now,
      modified: now,
    }
  }

  pub fn is_dir(&self) -> bool {
    matches!(self.kind, NodeKind::Directory { .. })
  }

  pub fn entries(&self) -> Option<&[DirEntry]> {
    match &self.kind {
      NodeKind::Directory { entries } => Some(entries),
      NodeKind::File { .. } => None,
    }
  }
}

/// Every directory and file on the volume, addressed by id. Directories hold
/// name to id entries. A child to parent index sits alongside and is rebuilt
/// from the entries whenever a namespace is reassembled, so walking up from a
/// node costs its depth.
///
/// The tree never touches block allocations. Callers pair removals and inserts
/// of file nodes with the allocator themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
  nodes: BTreeMap<NodeId, Node>,
  next_id: u32,
  parents: BTreeMap<NodeId, NodeId>,
}

impl Namespace {
  pub fn new(now: Timestamp) -> Self {
    let mut nodes = BTreeMap::new();
    nodes.insert(NodeId::ROOT, Node::directory(now));
    Self {
      nodes,
      next_id: 1,
      parents: BTreeMap::new(),
    }
  }

  pub(crate) fn from_parts(nodes: BTreeMap<NodeId, Node>, next_id: u32) -> Self {
    let mut parents = BTreeMap::new();
    for (id, node) in &nodes {
      for entry in node.entries().unwrap_or(&[]) {
        parents.insert(entry.id, *id);
      }
    }
    Self {
      nodes,
      next_id,
      parents,
    }
  }

  pub fn nodes(&self) -> &BTreeMap<NodeId, Node> {
    &self.nodes
  }

  /// The id the next inserted node will receive.
  pub fn next_id(&self) -> NodeId {
    NodeId(self.next_id)
  }

  pub fn total_nodes(&self) -> usize {
    self.nodes.len()
  }

  pub fn get(&self, id: NodeId) -> Option<&Node> {
    self.nodes.get(&id)
  }

  pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
    self.nodes.get_mut(&id)
  }

  /// Finds `name` among the entries of `dir`. Returns `None` if `dir` is a file.
  pub fn lookup(&self, dir: NodeId, name: &str) -> Option<NodeId> {
    self
      .get(dir)?
      .entries()?
      .iter()
      .find(|entry| entry.name == name)
      .map(|entry| entry.id)
  }

  pub fn name_of(&self, dir: NodeId, child: NodeId) -> Option<&str> {
    self
      .get(dir)?
      .entries()?
      .iter()
      .find(|entry| entry.id == child)
      .map(|entry| entry.name.as_str())
  }

  pub fn resolve(&self, cwd: NodeId, path: &str) -> Option<NodeId> {
    self.resolve_chain(cwd, path)?.last().copied()
  }

  /// Walks `path` and returns every node from the root down to the target.
  /// Relative paths start at `cwd`. Fails as soon as a segment is missing or a
  /// segment other than the last names a file.
  pub fn resolve_chain(&self, cwd: NodeId, path: &str) -> Option<Vec<NodeId>> {
    let normalized = path::normalize(path);
    let mut chain = if path::is_absolute(&normalized) {
      vec![NodeId::ROOT]
    } else {
      self.ancestors(cwd)?
    };

    for segment in path::segments(&normalized) {
      let current = *chain.last()?;
      if !self.get(current)?.is_dir() {
        return None;
      }
      match segment {
        "." => {}
        ".." => {
          if chain.len() > 1 {
            chain.pop();
          }
        }
        name => chain.push(self.lookup(current, name)?),
      }
    }
    Some(chain)
  }

  /// Directory holding `id`. The root has none.
  pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
    self.parents.get(&id).copied()
  }

  /// The chain of ids from the root to `target`, both ends included.
  pub fn ancestors(&self, target: NodeId) -> Option<Vec<NodeId>> {
    self.get(target)?;
    let mut chain = vec![target];
    let mut current = target;
    while current != NodeId::ROOT {
      // A parent loop in a damaged tree would otherwise never reach the root.
      if chain.len() > self.nodes.len() {
        return None;
      }
      current = self.parent_of(current)?;
      chain.push(current);
    }
    chain.reverse();
    Some(chain)
  }

  /// Absolute path of `id`, or `None` if the node is not reachable from the root.
  pub fn path_of(&self, id: NodeId) -> Option<String> {
    let chain = self.ancestors(id)?;
    let mut path = String::from("/");
    for pair in chain.windows(2) {
      let name = self.name_of(pair[0], pair[1])?;
      path = path::join(&path, name);
    }
    Some(path)
  }

  /// Every node below `id` and `id` itself, children before their parent.
  pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    self.walk_post_order(id, &mut out);
    out
  }

  fn walk_post_order(&self, id: NodeId, out: &mut Vec<NodeId>) {
    let mut stack = vec![(id, false)];
    while let Some((id, expanded)) = stack.pop() {
      if expanded {
        out.push(id);
        continue;
      }
      stack.push((id, true));
      if let Some(entries) = self.get(id).and_then(Node::entries) {
        stack.extend(entries.iter().rev().map(|entry| (entry.id, false)));
      }
    }
  }

  /// File nodes at or below `id`, children before their parent.
  pub fn files_under(&self, id: NodeId) -> Vec<NodeId> {
    self
      .post_order(id)
      .into_iter()
      .filter(|id| self.get(*id).map_or(false, |node| !node.is_dir()))
      .collect()
  }

  /// Size of a file, or the summed size of every file below a directory.
  pub fn total_size(&self, id: NodeId) -> u64 {
    self
      .post_order(id)
      .into_iter()
      .filter_map(|id| match self.get(id).map(|node| &node.kind) {
        Some(NodeKind::File { size_bytes, .. }) => Some(*size_bytes),
        _ => None,
      })
      .sum()
  }

  fn dir_mut(&mut self, dir: NodeId) -> Result<(&mut Vec<DirEntry>, &mut Timestamp), FsError> {
    match self.nodes.get_mut(&dir) {
      Some(Node {
        kind: NodeKind::Directory { entries },
        modified,
        ..
      }) => Ok((entries, modified)),
      Some(_) => Err(FsError::NotADirectory(dir.to_string())),
      None => Err(FsError::NotFound(dir.to_string())),
    }
  }

  /// Adds `node` under `parent` as `name` and returns its new id.
  pub fn insert(&mut self, parent: NodeId, name: &str, node: Node, now: Timestamp) -> Result<NodeId, FsError> {
    let id = NodeId(self.next_id);
    let next_id = self
      .next_id
      .checked_add(1)
      .ok_or_else(|| FsError::InvalidArgument("node ids exhausted".to_string()))?;

    let (entries, modified) = self.dir_mut(parent)?;
    if entries.iter().any(|entry| entry.name == name) {
      return Err(FsError::AlreadyExists(name.to_string()));
    }
    entries.push(DirEntry {
      name: name.to_string(),
      id,
    });
    *modified = now;

    self.next_id = next_id;
    self.nodes.insert(id, node);
    self.parents.insert(id, parent);
    Ok(id)
  }

  /// Unlinks `name` from `parent` and drops it along with everything below it.
  /// Returns the ids that were dropped, children first.
  pub fn remove(&mut self, parent: NodeId, name: &str, now: Timestamp) -> Result<Vec<NodeId>, FsError> {
    let (entries, modified) = self.dir_mut(parent)?;
    let pos = entries
      .iter()
      .position(|entry| entry.name == name)
      .ok_or_else(|| FsError::NotFound(name.to_string()))?;
    let entry = entries.remove(pos);
    *modified = now;

    let dropped = self.post_order(entry.id);
    for id in &dropped {
      self.nodes.remove(id);
      self.parents.remove(id);
    }
    Ok(dropped)
  }

  /// Renames an entry of `parent`. The renamed entry moves to the end of the
  /// directory listing.
  pub fn rename(&mut self, parent: NodeId, old: &str, new: &str, now: Timestamp) -> Result<NodeId, FsError> {
    let (entries, modified) = self.dir_mut(parent)?;
    let pos = entries
      .iter()
      .position(|entry| entry.name == old)
      .ok_or_else(|| FsError::NotFound(old.to_string()))?;
    if old == new {
      return Ok(entries[pos].id);
    }
    if entries.iter().any(|entry| entry.name == new) {
      return Err(FsError::AlreadyExists(new.to_string()));
    }

    let mut entry = entries.remove(pos);
    entry.name = new.to_string();
    let id = entry.id;
    entries.push(entry);
    *modified = now;

    if let Some(node) = self.nodes.get_mut(&id) {
      node.modified = now;
    }
    Ok(id)
  }

  /// Moves entry `name` from `src` into directory `dest`, keeping its name and id.
  pub fn move_node(&mut self, src: NodeId, name: &str, dest: NodeId, now: Timestamp) -> Result<NodeId, FsError> {
    let id = self
      .lookup(src, name)
      .ok_or_else(|| FsError::NotFound(name.to_string()))?;
    match self.get(dest) {
      Some(node) if node.is_dir() => {}
      Some(_) => return Err(FsError::NotADirectory(dest.to_string())),
      None => return Err(FsError::NotFound(dest.to_string())),
    }
    if src == dest {
      return Ok(id);
    }
    if self.ancestors(dest).map_or(false, |chain| chain.contains(&id)) {
      return Err(FsError::InvalidArgument(format!(
        "cannot move {} into itself",
        name
      )));
    }
    if self.lookup(dest, name).is_some() {
      return Err(FsError::AlreadyExists(name.to_string()));
    }

    let (entries, modified) = self.dir_mut(src)?;
    let pos = entries
      .iter()
      .position(|entry| entry.id == id)
      .ok_or_else(|| FsError::NotFound(name.to_string()))?;
    let entry = entries.remove(pos);
    *modified = now;

    let (entries, modified) = self.dir_mut(dest)?;
    entries.push(entry);
    *modified = now;
    self.parents.insert(id, dest);

    if let Some(node) = self.nodes.get_mut(&id) {
      node.modified = now;
    }
    Ok(id)
  }
}
