use tempfile::TempDir;
use vdisk::io::{FileStore, MemoryStore, StoreError};
use vdisk::{Filesystem, FsConfig, FsError};

fn volume_path(dir: &TempDir) -> std::path::PathBuf {
  dir.path().join("storage.vdisk")
}

fn assert_consistent<S: vdisk::io::SnapshotStore>(fs: &Filesystem<S>) {
  if let Err(msg) = fs.snapshot().validate() {
    panic!("volume is inconsistent: {}", msg);
  }
}

#[test]
fn can_initialize_disk_with_filesystem() {
  let dir = tempfile::tempdir().unwrap();

  // Prepare the store with a fresh volume.
  Filesystem::create(FileStore::new(volume_path(&dir)), FsConfig::default()).unwrap();

  // Open it again and verify the initial layout.
  let fs = Filesystem::open(FileStore::new(volume_path(&dir))).unwrap();
  assert_eq!(fs.current_dir(), "/");
  assert!(fs.list("/").unwrap().is_empty());
  assert_eq!(fs.usage().used_blocks, 0);
  assert_eq!(fs.usage().total_blocks, 2048);
}

#[test]
fn opening_missing_volume_fails() {
  let dir = tempfile::tempdir().unwrap();

  match Filesystem::open(FileStore::new(volume_path(&dir))) {
    Err(FsError::Store(StoreError::Empty)) => (),
    other => panic!("expected empty store, got {:?}", other.map(|_| ())),
  }
}

#[test]
fn garbage_volume_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  std::fs::write(volume_path(&dir), vec![0xab; 64]).unwrap();

  match Filesystem::open(FileStore::new(volume_path(&dir))) {
    Err(FsError::Store(StoreError::BadMagic)) => (),
    other => panic!("expected bad magic, got {:?}", other.map(|_| ())),
  }
}

#[test]
fn nested_tree_survives_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let mut fs =
    Filesystem::create(FileStore::new(volume_path(&dir)), FsConfig::default()).unwrap();
  fs.create_directory("docs", "/").unwrap();
  fs.create_directory("drafts", "/docs").unwrap();
  fs.create_file("a.txt", 1000, "/docs").unwrap();
  fs.create_file("b.txt", 0, "/docs/drafts").unwrap();
  fs.write_file("/docs/a.txt", "hello").unwrap();
  fs.change_directory("/docs/drafts").unwrap();
  let snapshot = fs.snapshot().clone();
  drop(fs);

  let fs = Filesystem::open(FileStore::new(volume_path(&dir))).unwrap();
  assert_eq!(fs.snapshot(), &snapshot);
  assert_eq!(fs.current_dir(), "/docs/drafts");
  assert_eq!(fs.file_content("../a.txt").unwrap(), "hello");
  assert_eq!(fs.stat("b.txt").unwrap().size_bytes, 0);
  assert_consistent(&fs);
}

#[test]
fn full_disk_round_trips() {
  let config = FsConfig::new().with_disk_size(64 * 512);
  let mut fs = Filesystem::create(MemoryStore::new(), config).unwrap();
  for i in 0..32 {
    fs.create_file(&format!("f{}", i), 1024, "/").unwrap();
  }
  assert_eq!(fs.usage().free_blocks, 0);
  assert!(matches!(
    fs.create_file("one-more", 1, "/"),
    Err(FsError::OutOfSpace { requested: 1 })
  ));

  let fs = Filesystem::open(fs.into_store()).unwrap();
  assert_eq!(fs.usage().used_blocks, 64);
  assert_eq!(fs.list("/").unwrap().len(), 32);
  assert_consistent(&fs);
}

#[test]
fn freed_space_is_reused_first_fit() {
  let config = FsConfig::new().with_disk_size(16 * 512);
  let mut fs = Filesystem::create(MemoryStore::new(), config).unwrap();
  fs.create_file("a", 2 * 512, "/").unwrap();
  fs.create_file("b", 3 * 512, "/").unwrap();
  fs.create_file("c", 512, "/").unwrap();

  fs.delete("/b").unwrap();
  fs.create_file("d", 2 * 512, "/").unwrap();
  fs.create_file("e", 2 * 512, "/").unwrap();

  assert_eq!(fs.allocation_info("/d").unwrap().start_block, 2);
  assert_eq!(fs.allocation_info("/e").unwrap().start_block, 6);
  assert_consistent(&fs);
}

#[test]
fn recursive_delete_clears_bitmap() {
  let mut fs = Filesystem::create(MemoryStore::new(), FsConfig::default()).unwrap();
  fs.create_directory("dir", "/").unwrap();
  fs.create_directory("sub", "/dir").unwrap();
  fs.create_file("a.txt", 1000, "/dir").unwrap();
  fs.create_file("b.txt", 1000, "/dir/sub").unwrap();

  fs.delete("dir").unwrap();

  let fs = Filesystem::open(fs.into_store()).unwrap();
  assert!(fs.resolve("/dir").is_none());
  assert_eq!(fs.usage().used_blocks, 0);
  assert!(fs.snapshot().allocator.table().is_empty());
}

#[test]
fn rename_and_move_keep_blocks() {
  let mut fs = Filesystem::create(MemoryStore::new(), FsConfig::default()).unwrap();
  fs.create_directory("inbox", "/").unwrap();
  fs.create_directory("archive", "/").unwrap();
  fs.create_file("old.txt", 2000, "/inbox").unwrap();
  let placed = fs.allocation_info("/inbox/old.txt").unwrap();

  fs.rename("old.txt", "new.txt", "/inbox").unwrap();
  fs.move_entry("/inbox/new.txt", "/archive").unwrap();

  let fs = Filesystem::open(fs.into_store()).unwrap();
  assert_eq!(fs.allocation_info("/archive/new.txt").unwrap(), placed);
  assert!(fs.resolve("/inbox/old.txt").is_none());
  assert_consistent(&fs);
}

#[test]
fn open_or_create_keeps_existing_volume() {
  let dir = tempfile::tempdir().unwrap();
  let mut fs =
    Filesystem::open_or_create(FileStore::new(volume_path(&dir)), FsConfig::default()).unwrap();
  fs.create_file("keep", 10, "/").unwrap();
  drop(fs);

  // Geometry of the saved volume wins over the requested one.
  let small = FsConfig::new().with_disk_size(8 * 512);
  let fs = Filesystem::open_or_create(FileStore::new(volume_path(&dir)), small).unwrap();
  assert!(fs.resolve("/keep").is_some());
  assert_eq!(fs.usage().total_blocks, 2048);
}
