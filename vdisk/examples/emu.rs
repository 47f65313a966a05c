use vdisk::io::FileStore;
use vdisk::{format_size, Filesystem, FsConfig};

pub fn main() -> Result<(), vdisk::FsError> {
    let dir = tempfile::tempdir().map_err(vdisk::io::StoreError::from)?;
    let store = FileStore::new(dir.path().join("emu.vdisk"));

    // An 8 block disk is small enough to watch first-fit at work.
    let config = FsConfig::new().with_disk_size(8 * 512).with_block_size(512);
    let mut fs = Filesystem::create(store, config)?;

    for name in &["a", "b", "c", "d"] {
        fs.create_file(name, 1024, "/")?;
    }
    fs.delete("/b")?;
    fs.delete("/d")?;
    print_map(&fs);

    // Four blocks are free, but no run of three exists.
    match fs.create_file("big", 3 * 512, "/") {
        Err(err) => println!("big: {}", err),
        Ok(_) => println!("big: unexpectedly placed"),
    }

    fs.create_file("small", 700, "/")?;
    print_map(&fs);
    if let Some(info) = fs.allocation_info("/small") {
        println!(
            "small: blocks {}..{}, bytes {}..{}",
            info.start_block,
            info.start_block + info.num_blocks,
            info.start_byte,
            info.end_byte
        );
    }

    let usage = fs.usage();
    println!(
        "{} of {} used ({:.1}%)",
        format_size(usage.used_bytes),
        format_size(usage.total_bytes),
        usage.percent_used()
    );
    Ok(())
}

fn print_map(fs: &Filesystem<FileStore>) {
    let map: String = fs
        .bitmap()
        .iter()
        .map(|state| match state {
            vdisk::State::Used => '#',
            vdisk::State::Free => '.',
        })
        .collect();
    println!("[{}]", map);
}
