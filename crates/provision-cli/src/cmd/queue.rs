use crate::output::print_json;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Count visible and in-flight messages
    Stats,
}

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        QueueSubcommand::Stats => stats(root, json),
    }
}

fn stats(root: &Path, json: bool) -> anyhow::Result<()> {
    let provisioner = super::open(root)?;
    let stats = provisioner.queue().stats()?;

    if json {
        print_json(&stats)?;
        return Ok(());
    }
    println!("visible:   {}", stats.visible);
    println!("in flight: {}", stats.invisible);
    Ok(())
}
