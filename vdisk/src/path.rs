//! Path strings as callers type them.
//!
//! Every entry point into the namespace runs its input through [`normalize`] so a
//! location has exactly one spelling no matter how it was supplied.

pub const SEPARATOR: char = '/';

/// Characters that may never appear in a file or directory name.
const RESERVED_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Converts backslashes to `/`, collapses repeated separators and drops any
/// trailing separator. An empty relative path becomes `.`.
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let joined = unified
        .split(SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if unified.starts_with(SEPARATOR) {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

/// Yields the named segments of a normalized path, `.` and `..` included.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}

/// Appends `name` to a directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with(SEPARATOR) {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// A name is valid if it is non-empty, free of reserved and control characters,
/// and not one of the relative segments `.` or `..`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    name.chars()
        .all(|c| !RESERVED_CHARS.contains(&c) && !c.is_control())
}
