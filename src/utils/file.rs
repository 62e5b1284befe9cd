use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};


/// Creates a hidden temp file next to `path`, so the final rename never
/// crosses a filesystem boundary.
///
/// # Arguments
///
/// * `path` - Final destination the temp file will be persisted to.
///
/// # Returns
/// io::Result<NamedTempFile>, removed on drop unless persisted.
pub fn temp_sibling(path: &Path) -> io::Result<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".tmp")
        .tempfile_in(dir)
}


/// Writes a file all-or-nothing: the content goes to a temp sibling and is
/// renamed over `path` only after `write` returns Ok. On error the temp file
/// is removed and `path` is left untouched.
pub fn write_atomic_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut tmp = temp_sibling(path)?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(contents))
}

pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Declared outputs that are absent or empty.
pub fn missing_outputs(outputs: &[PathBuf]) -> Vec<&PathBuf> {
    outputs.iter().filter(|p| !is_non_empty_file(p)).collect()
}

pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
