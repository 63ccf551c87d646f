//! Atomic file writes and JSON load/save.
//!
//! Checkpoints and run artifacts are written to a `.tmp` sibling first and
//! renamed into place, so a crash mid-write never leaves a torn file behind.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Atomically write JSON data to a file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    atomic_write_with(path, |tmp| std::fs::write(tmp, data))
}

/// Let `write` produce the file at a temporary path, then rename it over
/// `path`. The temporary file is removed if `write` fails.
pub fn atomic_write_with<F, E>(path: &Path, write: F) -> Result<(), E>
where
    F: FnOnce(&Path) -> Result<(), E>,
    E: From<io::Error>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    if let Err(e) = write(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Wrote file");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EpochMarker {
        job: String,
        epoch: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        let data = EpochMarker {
            job: "test-job-1".into(),
            epoch: 4,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<EpochMarker> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("job").join("checkpoint.json");
        atomic_write_json(&path, &"x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<EpochMarker>> =
            load_json(Path::new("/nonexistent/checkpoint.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_tmp_keeps_extension() {
        // model.safetensors must not collide with model.tmp of a sibling
        let tmp = tmp_path(Path::new("/ckpt/model.safetensors"));
        assert_eq!(tmp, PathBuf::from("/ckpt/model.safetensors.tmp"));
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let result: io::Result<()> = atomic_write_with(&path, |tmp| {
            std::fs::write(tmp, b"partial")?;
            Err(io::Error::other("serializer failed"))
        });
        assert!(result.is_err());
        assert!(!path.exists());
        assert!(!tmp_path(&path).exists());
    }
}
