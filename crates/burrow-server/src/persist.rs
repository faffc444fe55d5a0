//! Atomic file writes for the flat-file stores

use std::io::Write;
use std::path::Path;

use uuid::Uuid;

/// Write `contents` to `path` via a sibling temp file and rename.
///
/// `mode` is applied to the temp file before the rename, so the final file is
/// never visible with looser permissions.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        set_mode(&tmp_path, mode)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Serialize `value` as JSON and write it atomically
pub fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
    mode: u32,
) -> std::io::Result<()> {
    let contents = serde_json::to_vec(value)?;
    write_atomic(path, &contents, mode)
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
