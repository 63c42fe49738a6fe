use crate::output::{or_dash, print_json, print_table, short_id};
use anyhow::Context;
use clap::Subcommand;
use provision_core::operation::Operation;
use provision_core::types::{OperationId, OperationKind, OperationStatus, ResourceId};
use std::path::Path;

#[derive(Subcommand)]
pub enum OpSubcommand {
    /// Record a NotStarted operation against a resource
    Schedule {
        resource: String,
        /// create, update, delete, ensure_roles or ensure_firewall_rules
        #[arg(long)]
        kind: String,
        /// Payload as a JSON object
        #[arg(long)]
        payload: Option<String>,
        /// Operation that must succeed first
        #[arg(long)]
        depends_on: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Put the operation on the queue as a batch of one
        #[arg(long)]
        enqueue: bool,
    },
    /// Show one operation
    Show { id: String },
    /// List operations
    List {
        /// Filter by status (e.g. failed, in_progress)
        #[arg(long)]
        status: Option<String>,
        /// Only operations of this resource
        #[arg(long)]
        resource: Option<String>,
    },
    /// Abandoned operations that need an operator
    ListAbandoned,
    /// Abort a non-terminal operation
    Abort {
        id: String,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
}

pub fn run(root: &Path, subcmd: OpSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        OpSubcommand::Schedule {
            resource,
            kind,
            payload,
            depends_on,
            description,
            enqueue,
        } => schedule(
            root,
            &resource,
            &kind,
            payload.as_deref(),
            depends_on.as_deref(),
            description,
            enqueue,
            json,
        ),
        OpSubcommand::Show { id } => show(root, &id, json),
        OpSubcommand::List { status, resource } => {
            list(root, status.as_deref(), resource.as_deref(), json)
        }
        OpSubcommand::ListAbandoned => list_abandoned(root, json),
        OpSubcommand::Abort { id, reason } => abort(root, &id, &reason, json),
    }
}

#[allow(clippy::too_many_arguments)]
fn schedule(
    root: &Path,
    resource: &str,
    kind: &str,
    payload: Option<&str>,
    depends_on: Option<&str>,
    description: Option<String>,
    enqueue: bool,
    json: bool,
) -> anyhow::Result<()> {
    let resource_id: ResourceId = super::parse_id(resource, "resource")?;
    let kind: OperationKind = kind.parse()?;
    let raw = match payload {
        Some(text) => serde_json::from_str(text).context("--payload is not valid JSON")?,
        None => serde_json::Value::Null,
    };
    let depends_on = depends_on
        .map(|id| super::parse_id::<OperationId>(id, "operation"))
        .transpose()?;

    let provisioner = super::open(root)?;
    let scheduler = provisioner.scheduler();
    let op = scheduler.schedule_operation(resource_id, kind, raw, depends_on, description)?;
    let batch = if enqueue {
        Some(scheduler.enqueue_batch(&[op.id], &op.description)?)
    } else {
        None
    };

    if json {
        print_json(&serde_json::json!({
            "operation": op,
            "batch_id": batch.as_ref().map(|b| b.id),
        }))?;
        return Ok(());
    }
    println!("Scheduled {} [{}]", op.kind, op.id);
    if let Some(batch) = batch {
        println!("Enqueued batch {}", batch.id);
    }
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let id: OperationId = super::parse_id(id, "operation")?;
    let provisioner = super::open(root)?;
    let op = provisioner.store().get_operation(id)?;

    if json {
        print_json(&op)?;
        return Ok(());
    }
    println!("{} [{}]", op.description, op.id);
    println!("  resource:  {}", op.resource_id);
    println!("  kind:      {}", op.kind);
    println!("  status:    {}", op.status);
    println!("  tries:     {}/{}", op.try_count, op.max_try_count);
    println!("  after:     {}", or_dash(op.depends_on));
    println!("  batch:     {}", or_dash(op.batch_id));
    println!("  session:   {}", or_dash(op.session_id.as_deref()));
    println!("  heartbeat: {}", or_dash(op.heartbeat_at.map(|t| t.to_rfc3339())));
    if let Some(err) = &op.last_error {
        println!("  error:     {err}");
    }
    if let Some(reason) = &op.abort_reason {
        println!("  aborted:   {reason}");
    }
    Ok(())
}

fn list(
    root: &Path,
    status: Option<&str>,
    resource: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let status = status.map(str::parse::<OperationStatus>).transpose()?;
    let provisioner = super::open(root)?;
    let store = provisioner.store();
    let ops: Vec<Operation> = match resource {
        Some(resource) => store
            .operations_for_resource(super::parse_id(resource, "resource")?)?
            .into_iter()
            .filter(|op| status.map_or(true, |s| op.status == s))
            .collect(),
        None => store.list_operations(status)?,
    };

    if json {
        print_json(&ops)?;
        return Ok(());
    }
    if ops.is_empty() {
        println!("No operations.");
        return Ok(());
    }
    let rows = ops
        .iter()
        .map(|op| {
            vec![
                op.id.to_string(),
                short_id(op.resource_id),
                op.kind.to_string(),
                op.status.to_string(),
                format!("{}/{}", op.try_count, op.max_try_count),
                or_dash(op.batch_id.map(short_id)),
            ]
        })
        .collect();
    print_table(&["ID", "RESOURCE", "KIND", "STATUS", "TRIES", "BATCH"], rows);
    Ok(())
}

fn list_abandoned(root: &Path, json: bool) -> anyhow::Result<()> {
    let provisioner = super::open(root)?;
    let items = provisioner.store().list_abandoned()?;

    if json {
        print_json(&items)?;
        return Ok(());
    }
    if items.is_empty() {
        println!("No abandoned operations.");
        return Ok(());
    }
    let rows = items
        .iter()
        .map(|a| {
            vec![
                short_id(a.operation_id),
                format!("{} '{}'", a.resource_type, a.resource_name),
                a.kind.to_string(),
                format!("{}/{}", a.try_count, a.max_try_count),
                a.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["OP", "RESOURCE", "KIND", "TRIES", "LAST ERROR"], rows);
    println!("\nUse `provision retry <resource>` to give an operation more tries.");
    Ok(())
}

fn abort(root: &Path, id: &str, reason: &str, json: bool) -> anyhow::Result<()> {
    let id: OperationId = super::parse_id(id, "operation")?;
    let provisioner = super::open(root)?;
    let op = provisioner
        .store()
        .abort(id, reason)
        .with_context(|| format!("could not abort operation {id}"))?;

    if json {
        print_json(&op)?;
    } else {
        println!("Aborted {} [{}]: {reason}", op.kind, op.id);
    }
    Ok(())
}
