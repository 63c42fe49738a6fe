use crate::output::{or_dash, print_json, print_table, short_id};
use anyhow::Context;
use clap::Subcommand;
use provision_core::resource::Resource;
use provision_core::types::{ResourceId, ResourceType};
use std::path::Path;

#[derive(Subcommand)]
pub enum ResourceSubcommand {
    /// Register a resource
    Create {
        /// resource_group, storage_account, network_security_group,
        /// virtual_network, bastion or virtual_machine
        #[arg(long = "type", value_name = "TYPE")]
        resource_type: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        region: String,
        /// Owning resource group id
        #[arg(long)]
        group: Option<String>,
        /// Tag as KEY=VALUE (repeatable)
        #[arg(long = "tag", value_name = "KEY=VALUE")]
        tags: Vec<String>,
    },
    /// Show a resource and its operation history
    Show { id: String },
    /// List resources
    List {
        /// Only the group and its members
        #[arg(long)]
        group: Option<String>,
        /// Include soft-deleted resources
        #[arg(long)]
        all: bool,
    },
}

pub fn run(root: &Path, subcmd: ResourceSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ResourceSubcommand::Create {
            resource_type,
            name,
            region,
            group,
            tags,
        } => create(root, &resource_type, &name, &region, group.as_deref(), &tags, json),
        ResourceSubcommand::Show { id } => show(root, &id, json),
        ResourceSubcommand::List { group, all } => list(root, group.as_deref(), all, json),
    }
}

fn create(
    root: &Path,
    resource_type: &str,
    name: &str,
    region: &str,
    group: Option<&str>,
    tags: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let resource_type: ResourceType = resource_type.parse()?;
    let mut resource = Resource::new(resource_type, name, region);
    if let Some(group) = group {
        resource = resource.in_group(super::parse_id(group, "group")?);
    }
    for tag in tags {
        let (key, value) = tag
            .split_once('=')
            .with_context(|| format!("tag '{tag}' must look like KEY=VALUE"))?;
        resource = resource.with_tag(key.trim(), value.trim());
    }

    let provisioner = super::open(root)?;
    let resource = provisioner
        .scheduler()
        .create_resource(resource)
        .context("failed to create resource")?;

    if json {
        print_json(&resource)?;
    } else {
        println!(
            "Created {} '{}' [{}]",
            resource.resource_type, resource.name, resource.id
        );
    }
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let id: ResourceId = super::parse_id(id, "resource")?;
    let provisioner = super::open(root)?;
    let store = provisioner.store();
    let resource = store.get_resource(id)?;
    let history = store.operations_for_resource(id)?;

    if json {
        print_json(&serde_json::json!({
            "resource": resource,
            "operations": history,
        }))?;
        return Ok(());
    }

    println!("{} '{}' [{}]", resource.resource_type, resource.name, resource.id);
    println!("  region:  {}", resource.region);
    println!("  group:   {}", or_dash(resource.group_id));
    println!("  created: {}", resource.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if resource.deleted {
        println!(
            "  deleted: {} by {}",
            or_dash(resource.deleted_at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC"))),
            or_dash(resource.deleted_by.as_deref())
        );
    }
    for (key, value) in &resource.tags {
        println!("  tag:     {key}={value}");
    }
    for (key, value) in &resource.shared_variables {
        println!("  shared:  {key}={value}");
    }

    if history.is_empty() {
        println!("\nNo operations.");
        return Ok(());
    }
    println!();
    let rows = history
        .iter()
        .map(|op| {
            vec![
                short_id(op.id),
                op.kind.to_string(),
                op.status.to_string(),
                format!("{}/{}", op.try_count, op.max_try_count),
                or_dash(op.depends_on.map(short_id)),
                op.last_error.clone().or(op.abort_reason.clone()).unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["ID", "KIND", "STATUS", "TRIES", "AFTER", "DETAIL"], rows);
    Ok(())
}

fn list(root: &Path, group: Option<&str>, all: bool, json: bool) -> anyhow::Result<()> {
    let provisioner = super::open(root)?;
    let store = provisioner.store();
    let resources = match group {
        Some(group) => store.resources_in_group(super::parse_id(group, "group")?)?,
        None => store.list_resources()?,
    };
    let resources: Vec<Resource> = resources.into_iter().filter(|r| all || !r.deleted).collect();

    if json {
        print_json(&resources)?;
        return Ok(());
    }
    if resources.is_empty() {
        println!("No resources.");
        return Ok(());
    }
    let rows = resources
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.resource_type.to_string(),
                r.name.clone(),
                r.region.clone(),
                or_dash(r.group_id.map(short_id)),
                if r.deleted { "deleted" } else { "" }.to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "TYPE", "NAME", "REGION", "GROUP", ""], rows);
    Ok(())
}
