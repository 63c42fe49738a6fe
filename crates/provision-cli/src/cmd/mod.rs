pub mod batch;
pub mod config;
pub mod init;
pub mod op;
pub mod queue;
pub mod recovery;
pub mod resource;
pub mod worker;

use anyhow::Context;
use provision_core::{paths, Provisioner};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

/// Open the store and queue under `root`, which must have been initialized.
pub fn open(root: &Path) -> anyhow::Result<Provisioner> {
    if !paths::provision_dir(root).is_dir() {
        anyhow::bail!(
            "{} is not a provisioning root; run `provision init` first",
            root.display()
        );
    }
    Provisioner::open(root).with_context(|| format!("failed to open {}", root.display()))
}

pub fn parse_id<T>(raw: &str, what: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {what} id '{raw}': {e}"))
}
