use thiserror::Error;
use vdisk::io::SnapshotStore;
use vdisk::node::Timestamp;
use vdisk::{format_size, EntryKind, Filesystem, FsError, State};

const DEFAULT_TOUCH_SIZE: u64 = 1024;
const MAP_WIDTH: usize = 64;

const HELP: &str = "\
Commands:
  ls [path]              list a directory
  cd <dir>               change the working directory
  pwd                    print the working directory
  mkdir <name>           create a directory here
  touch <name> [bytes]   create a file here (default 1024 bytes)
  rm <path>              delete a file or a directory tree
  mv <path> <dir>        move an entry into another directory
  rename <old> <new>     rename an entry of the working directory
  cp <file> <dir>        copy a file into another directory
  cat <file>             show file content
  write <file> <text>    replace file content
  df                     show disk usage
  info <file>            show where a file is stored
  stat <path>            show entry details
  map                    draw the block bitmap
  help                   show this text
  exit                   leave the shell";

pub enum Outcome {
    Output(String),
    Exit,
}

#[derive(Error, Debug)]
enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid size: {0}")]
    BadSize(String),
    #[error("unknown command, try help")]
    Unknown,
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// What follows the first `skip` words of `line`, with its inner spacing kept.
fn remainder(line: &str, skip: usize) -> &str {
    let mut rest = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
    for _ in 0..skip {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = &rest[end..];
    }
    rest.trim_start()
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &'static str) -> Result<&'a str, CommandError> {
    args.get(index).copied().ok_or(CommandError::Usage(usage))
}

/// Formats epoch seconds as a UTC calendar date and time.
pub fn format_timestamp(secs: Timestamp) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    // Days since 1970-01-01 to a proleptic Gregorian date, with years starting in March.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

/// Line oriented front end over a [`Filesystem`].
pub struct Shell<S: SnapshotStore> {
    fs: Filesystem<S>,
}

impl<S: SnapshotStore> Shell<S> {
    pub fn new(fs: Filesystem<S>) -> Self {
        Self { fs }
    }

    #[cfg(test)]
    pub fn filesystem(&self) -> &Filesystem<S> {
        &self.fs
    }

    pub fn prompt(&self) -> String {
        format!("{}> ", self.fs.current_dir())
    }

    /// Runs one command line. Errors are reported as output, prefixed with the
    /// command name.
    pub fn execute(&mut self, line: &str) -> Outcome {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (command, args) = match parts.split_first() {
            Some((command, args)) => (*command, args),
            None => return Outcome::Output(String::new()),
        };
        if command == "exit" || command == "quit" {
            return Outcome::Exit;
        }
        match self.run(command, args, line) {
            Ok(text) => Outcome::Output(text),
            Err(err) => Outcome::Output(format!("{}: {}", command, err)),
        }
    }

    fn run(&mut self, command: &str, args: &[&str], line: &str) -> Result<String, CommandError> {
        let fs = &mut self.fs;
        match command {
            "help" => Ok(HELP.to_string()),
            "ls" => {
                let path = args.first().copied().unwrap_or(".");
                let names: Vec<String> = fs
                    .list(path)?
                    .into_iter()
                    .map(|entry| match entry.kind {
                        EntryKind::Directory => format!("{}/", entry.name),
                        EntryKind::File => entry.name,
                    })
                    .collect();
                if names.is_empty() {
                    Ok("(empty)".to_string())
                } else {
                    Ok(names.join("  "))
                }
            }
            "cd" => {
                fs.change_directory(arg(args, 0, "cd <dir>")?)?;
                Ok(String::new())
            }
            "pwd" => Ok(fs.current_dir()),
            "mkdir" => {
                fs.create_directory(arg(args, 0, "mkdir <name>")?, ".")?;
                Ok(String::new())
            }
            "touch" => {
                let name = arg(args, 0, "touch <name> [bytes]")?;
                let size = match args.get(1) {
                    Some(raw) => raw
                        .parse::<u64>()
                        .map_err(|_| CommandError::BadSize(raw.to_string()))?,
                    None => DEFAULT_TOUCH_SIZE,
                };
                fs.create_file(name, size, ".")?;
                Ok(String::new())
            }
            "rm" => {
                fs.delete(arg(args, 0, "rm <path>")?)?;
                Ok(String::new())
            }
            "mv" => {
                let usage = "mv <path> <dir>";
                fs.move_entry(arg(args, 0, usage)?, arg(args, 1, usage)?)?;
                Ok(String::new())
            }
            "rename" => {
                let usage = "rename <old> <new>";
                fs.rename(arg(args, 0, usage)?, arg(args, 1, usage)?, ".")?;
                Ok(String::new())
            }
            "cp" => {
                let usage = "cp <file> <dir>";
                fs.copy_file(arg(args, 0, usage)?, arg(args, 1, usage)?)?;
                Ok(String::new())
            }
            "cat" => Ok(fs.file_content(arg(args, 0, "cat <file>")?)?.to_string()),
            "write" => {
                let usage = "write <file> <text>";
                let path = arg(args, 0, usage)?;
                arg(args, 1, usage)?;
                fs.write_file(path, remainder(line, 2))?;
                Ok(String::new())
            }
            "df" => {
                let usage = fs.usage();
                Ok(format!(
                    "{} used of {} ({:.1}%), {} free\n{} of {} blocks used, {} bytes per block",
                    format_size(usage.used_bytes),
                    format_size(usage.total_bytes),
                    usage.percent_used(),
                    format_size(usage.free_bytes),
                    usage.used_blocks,
                    usage.total_blocks,
                    usage.block_size
                ))
            }
            "info" => {
                let path = arg(args, 0, "info <file>")?;
                let info = match fs.allocation_info(path) {
                    Some(info) => info,
                    None => {
                        fs.stat(path)?;
                        return Err(FsError::NotAFile(path.to_string()).into());
                    }
                };
                Ok(format!(
                    "start block: {}\nblocks: {}\nstart byte: {}\nend byte: {}\nsize: {} bytes",
                    info.start_block, info.num_blocks, info.start_byte, info.end_byte, info.size_bytes
                ))
            }
            "stat" => {
                let entry = fs.stat(arg(args, 0, "stat <path>")?)?;
                let kind = match entry.kind {
                    EntryKind::Directory => "directory",
                    EntryKind::File => "file",
                };
                Ok(format!(
                    "name: {}\ntype: {}\nsize: {} ({} bytes)\ncreated: {}\nmodified: {}",
                    entry.name,
                    kind,
                    format_size(entry.size_bytes),
                    entry.size_bytes,
                    format_timestamp(entry.created),
                    format_timestamp(entry.modified)
                ))
            }
            "map" => {
                let cells: Vec<char> = fs
                    .bitmap()
                    .iter()
                    .map(|state| match state {
                        State::Used => '#',
                        State::Free => '.',
                    })
                    .collect();
                Ok(cells
                    .chunks(MAP_WIDTH)
                    .map(|row| row.iter().collect::<String>())
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            _ => Err(CommandError::Unknown),
        }
    }
}
