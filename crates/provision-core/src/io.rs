use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `data` via a sibling tempfile, so readers of
/// `config.yaml` never see a half-written file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = prepare_parent(path)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create the directory that will hold `path` (a database or config file)
/// and return it.
pub fn prepare_parent(path: &Path) -> Result<&Path> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir)?;
            Ok(dir)
        }
        _ => Ok(Path::new(".")),
    }
}

/// Write `data` unless `path` already exists. Returns `true` if written.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_provision_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".provision/config.yaml");
        atomic_write(&path, b"retry: {}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "retry: {}");
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn prepare_parent_for_nested_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("a/b/store.redb");
        let parent = prepare_parent(&db).unwrap();
        assert!(parent.is_dir());
        assert!(!db.exists());
    }

    #[test]
    fn write_if_missing_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        assert!(write_if_missing(&path, b"first").unwrap());
        assert!(!write_if_missing(&path, b"second").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");
    }
}
