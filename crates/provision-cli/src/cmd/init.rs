use crate::output::print_json;
use anyhow::Context;
use provision_core::{paths, Provisioner};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let created = Provisioner::init(root).context("failed to write config.yaml")?;
    // Create both databases so the first real command finds them in place.
    super::open(root)?;

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config_created": created,
        }))?;
        return Ok(());
    }

    println!("Initializing provisioning root in: {}", root.display());
    let status = if created { "created:" } else { "exists: " };
    println!("  {status} {}", paths::CONFIG_FILE);
    println!("  ready:   {}", paths::STORE_FILE);
    println!("  ready:   {}", paths::QUEUE_FILE);
    Ok(())
}
