use crate::log_driver::LogDriver;
use crate::output::{print_json, short_id};
use anyhow::Context;
use provision_core::dispatcher::{Disposition, PassReport};
use provision_core::driver::DriverRegistry;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn registry() -> DriverRegistry {
    DriverRegistry::new().with_fallback(Arc::new(LogDriver))
}

pub fn run(root: &Path, once: bool, json: bool) -> anyhow::Result<()> {
    let provisioner = super::open(root)?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    info!(root = %provisioner.root().display(), "worker starting");

    if once {
        let dispatcher = provisioner.dispatcher(registry());
        info!(session = dispatcher.session_id(), "draining visible batches");
        let reports = runtime.block_on(async {
            let mut reports = Vec::new();
            while let Some(report) = dispatcher.process_next().await? {
                reports.push(report);
            }
            Ok::<_, provision_core::ProvisionError>(reports)
        })?;
        return print_summary(&reports, json);
    }

    let pool = provisioner.worker_pool(registry());
    let shutdown = CancellationToken::new();
    runtime.block_on(async {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing in-flight batches");
            }
            signal.cancel();
        });
        pool.run(shutdown).await;
    });
    Ok(())
}

fn disposition_label(disposition: &Disposition) -> String {
    match disposition {
        Disposition::Acknowledged => "acknowledged".to_string(),
        Disposition::Requeued { delay } => format!("requeued (+{}s)", delay.as_secs()),
        Disposition::LeftForRedelivery => "waiting".to_string(),
        Disposition::LeaseLost => "lease lost".to_string(),
    }
}

fn print_summary(reports: &[PassReport], json: bool) -> anyhow::Result<()> {
    if json {
        let passes: Vec<_> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "batch_id": r.batch_id,
                    "message_id": r.message_id,
                    "executed": r.executed.iter()
                        .map(|(id, status)| serde_json::json!({ "operation": id, "status": status }))
                        .collect::<Vec<_>>(),
                    "aborted": r.aborted,
                    "disposition": disposition_label(&r.disposition),
                })
            })
            .collect();
        print_json(&passes)?;
        return Ok(());
    }

    if reports.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for r in reports {
        println!("batch {}: {}", short_id(r.batch_id), disposition_label(&r.disposition));
        for (id, status) in &r.executed {
            println!("  {} {status}", short_id(id));
        }
        for id in &r.aborted {
            println!("  {} aborted", short_id(id));
        }
    }
    Ok(())
}
