//! Atomic file writes shared by checkpoints, CSV export and config snapshots.
//!
//! Every artifact under a run's save directory is written to a `.tmp` sibling
//! and renamed into place, so a crash mid-write never leaves a truncated
//! `last.pth` or `storage.csv` behind.

use std::io;
use std::path::Path;

/// Atomically write raw bytes to a file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically write a YAML document.
pub fn atomic_write_yaml<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let yaml = serde_yaml::to_string(data).map_err(io::Error::other)?;
    atomic_write(path, yaml.as_bytes())
}

// `with_extension("tmp")` would map `last.pth` and `last.pt` onto the same
// temporary file, so the suffix is appended instead.
fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Minimal CSV field escaping: wrap the value in double-quotes if it contains
/// a comma, newline, or double-quote, doubling any embedded double-quotes.
pub fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        let escaped = value.replace('"', "\"\"");
        format!("\"{}\"", escaped)
    } else {
        value.to_string()
    }
}
