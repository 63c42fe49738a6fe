use provision_core::paths::PROVISION_DIR;
use std::path::{Path, PathBuf};

/// Resolve the provisioning root directory.
///
/// Priority:
/// 1. `--root` flag / `PROVISION_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.provision/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd).unwrap_or(cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(PROVISION_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        let result = resolve_root(Some(dir.path()));
        assert_eq!(result, dir.path());
    }

    #[test]
    fn finds_provision_dir_from_nested_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(PROVISION_DIR)).unwrap();
        let nested = dir.path().join("envs/prod");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_upward(&nested).as_deref(), Some(dir.path()));
    }

    #[test]
    fn no_provision_dir_finds_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(find_upward(dir.path()).is_none());
    }
}
