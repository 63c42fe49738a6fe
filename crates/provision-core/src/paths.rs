use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PROVISION_DIR: &str = ".provision";
pub const CONFIG_FILE: &str = ".provision/config.yaml";
pub const STORE_FILE: &str = ".provision/store.redb";
pub const QUEUE_FILE: &str = ".provision/queue.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn provision_dir(root: &Path) -> PathBuf {
    root.join(PROVISION_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}

pub fn queue_path(root: &Path) -> PathBuf {
    root.join(QUEUE_FILE)
}
