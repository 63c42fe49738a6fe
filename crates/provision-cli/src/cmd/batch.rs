use crate::output::{print_json, short_id};
use clap::Subcommand;
use provision_core::types::OperationId;
use std::path::Path;

#[derive(Subcommand)]
pub enum BatchSubcommand {
    /// Enqueue operations as one batch; predecessors are ordered first
    Enqueue {
        #[arg(required = true)]
        operations: Vec<String>,
        #[arg(long, default_value = "operator batch")]
        description: String,
    },
}

pub fn run(root: &Path, subcmd: BatchSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        BatchSubcommand::Enqueue {
            operations,
            description,
        } => enqueue(root, &operations, &description, json),
    }
}

fn enqueue(root: &Path, raw_ids: &[String], description: &str, json: bool) -> anyhow::Result<()> {
    let ids = raw_ids
        .iter()
        .map(|raw| super::parse_id::<OperationId>(raw, "operation"))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let provisioner = super::open(root)?;
    let batch = provisioner.scheduler().enqueue_batch(&ids, description)?;

    if json {
        print_json(&batch)?;
        return Ok(());
    }
    println!("Enqueued batch {} ({} operations)", batch.id, batch.operations.len());
    for (i, id) in batch.operations.iter().enumerate() {
        println!("  {}. {}", i + 1, short_id(id));
    }
    Ok(())
}
