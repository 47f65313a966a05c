use clap::Parser;
use std::path::PathBuf;
use vdisk::{FsConfig, DEFAULT_BLOCK_SIZE, DEFAULT_DISK_SIZE};

/// Interactive terminal for a virtual disk volume
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Snapshot file holding the volume
    #[arg(long, short, default_value = "storage.vdisk")]
    pub store: PathBuf,

    /// Disk size in bytes, used when a new volume is formatted
    #[arg(long, default_value_t = DEFAULT_DISK_SIZE)]
    pub disk_size: u64,

    /// Block size in bytes, used when a new volume is formatted
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Format a fresh volume, discarding whatever the store holds
    #[arg(long)]
    pub format: bool,

    /// Run one command and exit instead of starting the shell
    #[arg(long, short = 'c')]
    pub command: Option<String>,
}

impl Cli {
    pub fn config(&self) -> FsConfig {
        FsConfig::new()
            .with_disk_size(self.disk_size)
            .with_block_size(self.block_size)
    }
}
