//! I/O helpers for the compiler and runtime.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

pub mod config;
pub mod process;
pub mod registry;
pub mod spec_store;
pub mod templates;

/// Write a file atomically (unique temp sibling + rename), creating parent directories.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut builder = tempfile::Builder::new();
    // Temp files default to 0600; shared outputs keep the usual mode.
    #[cfg(unix)]
    builder.permissions(<fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o644));
    let mut tmp = builder
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("write temp file {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_replacements_leave_one_file_and_no_temp_siblings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("record.json");
        std::thread::scope(|scope| {
            for writer in 0..8u8 {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..20 {
                        write_atomic(path, &[b'0' + writer; 64]).expect("write");
                    }
                });
            }
        });
        let contents = fs::read(&path).expect("read");
        assert_eq!(contents.len(), 64);
        assert!(contents.iter().all(|b| *b == contents[0]));
        let entries: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
