//! Operator recovery: retry, reschedule, soft-delete and stale-claim sweeps.

use crate::output::{print_json, print_table, short_id};
use provision_core::types::ResourceId;
use std::path::Path;
use std::time::Duration;

pub fn retry(root: &Path, resource: &str, json: bool) -> anyhow::Result<()> {
    let resource_id: ResourceId = super::parse_id(resource, "resource")?;
    let provisioner = super::open(root)?;
    let outcome = provisioner.retry_controller().retry_operation(resource_id)?;

    if json {
        print_json(&outcome)?;
        return Ok(());
    }
    let op = &outcome.operation;
    println!(
        "Re-opened {} [{}]: {}/{} tries",
        op.kind, op.id, op.try_count, op.max_try_count
    );
    println!("Enqueued batch {}", outcome.batch_id);
    Ok(())
}

pub fn reschedule(root: &Path, group: &str, json: bool) -> anyhow::Result<()> {
    let group_id: ResourceId = super::parse_id(group, "group")?;
    let provisioner = super::open(root)?;
    let outcome = provisioner
        .retry_controller()
        .reschedule_resource_group(group_id)?;

    if json {
        print_json(&outcome)?;
        return Ok(());
    }
    println!(
        "Rescheduled {} create operation(s) in batch {}",
        outcome.operations.len(),
        outcome.batch_id
    );
    for id in &outcome.operations {
        println!("  {}", short_id(id));
    }
    Ok(())
}

pub fn delete(root: &Path, resource: &str, actor: &str, json: bool) -> anyhow::Result<()> {
    let resource_id: ResourceId = super::parse_id(resource, "resource")?;
    let provisioner = super::open(root)?;
    let outcome = provisioner.soft_delete().mark_deleted(resource_id, actor)?;

    if json {
        print_json(&outcome)?;
        return Ok(());
    }
    if outcome.already_deleted {
        println!("Resource {resource_id} is already deleted; nothing to do.");
        return Ok(());
    }
    println!("Marked {resource_id} deleted by {actor}");
    if !outcome.children.is_empty() {
        println!("  {} group member(s) marked deleted", outcome.children.len());
    }
    if !outcome.aborted.is_empty() {
        println!("  {} pending operation(s) aborted", outcome.aborted.len());
    }
    if let Some(op) = outcome.delete_operation {
        let verb = if outcome.delete_created { "created" } else { "reused" };
        println!("  delete operation {verb}: {op}");
    }
    if let Some(batch) = outcome.batch_id {
        println!("  enqueued batch {batch}");
    }
    Ok(())
}

pub fn recover_stale(root: &Path, max_age_secs: Option<u64>, json: bool) -> anyhow::Result<()> {
    let provisioner = super::open(root)?;
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| provisioner.config().dispatcher.stale_claim_age());
    let recovered = provisioner.store().recover_stale(max_age)?;

    if json {
        print_json(&recovered)?;
        return Ok(());
    }
    if recovered.is_empty() {
        println!("No stale claims older than {}s.", max_age.as_secs());
        return Ok(());
    }
    let rows = recovered
        .iter()
        .map(|op| {
            vec![
                op.id.to_string(),
                short_id(op.resource_id),
                op.kind.to_string(),
                op.status.to_string(),
                format!("{}/{}", op.try_count, op.max_try_count),
            ]
        })
        .collect();
    print_table(&["ID", "RESOURCE", "KIND", "STATUS", "TRIES"], rows);
    Ok(())
}
