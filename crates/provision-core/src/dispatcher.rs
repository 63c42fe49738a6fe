//! Consumes batches from the provisioning queue and drives their operations
//! through the registered drivers.
//!
//! A pass over one delivery walks the batch in order:
//!
//! 1. terminal operations are skipped, which makes redelivery harmless;
//! 2. an operation whose predecessor was aborted or abandoned (or whose
//!    resource is deleted) is aborted, together with everything in the batch
//!    that depends on it;
//! 3. an operation whose predecessor is still pending elsewhere ends the pass
//!    and the message is left to reappear when its window lapses;
//! 4. otherwise the operation is claimed with compare-and-set and its driver
//!    runs while a heartbeat keeps the message hidden and watches for
//!    deletion or abort.
//!
//! The message is deleted once every operation in the batch is terminal. A
//! transient failure re-enqueues the batch with a per-type backoff instead.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ProvisionConfig, RetryConfig};
use crate::driver::{invoke, Driver, DriverOutput, DriverParams, DriverRegistry, DriverResult, ErrorClass};
use crate::error::{ProvisionError, Result};
use crate::operation::{Completion, Operation, ABORT_DEPENDENCY_FAILED, ABORT_RESOURCE_DELETED};
use crate::queue::{Batch, Delivery, DeliveryToken, ProvisioningQueue};
use crate::resource::Resource;
use crate::store::OperationStore;
use crate::types::{BatchId, OperationId, OperationKind, OperationStatus, ResourceId};

// ---------------------------------------------------------------------------
// Settings / reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub visibility_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub cancel_grace: Duration,
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

impl DispatchSettings {
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self {
            visibility_timeout: config.queue.visibility_timeout(),
            heartbeat_interval: config.dispatcher.heartbeat_interval(),
            cancel_grace: config.dispatcher.cancel_grace(),
            poll_interval: config.queue.poll_interval(),
            retry: config.retry.clone(),
        }
    }
}

/// What happened to the queue message at the end of a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Every operation is terminal; the message was deleted.
    Acknowledged,
    /// An operation failed transiently; the batch was re-enqueued.
    Requeued { delay: Duration },
    /// Waiting on work outside this pass; the message reappears after its window.
    LeftForRedelivery,
    /// The window lapsed mid-pass and a newer delivery owns the message.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub batch_id: BatchId,
    pub message_id: Uuid,
    /// Operations driven in this pass, with the status each ended in.
    pub executed: Vec<(OperationId, OperationStatus)>,
    /// Operations aborted without being driven.
    pub aborted: Vec<OperationId>,
    pub disposition: Disposition,
}

enum Gate {
    Ready,
    Abort(&'static str),
    Wait(String),
}

enum Pulse {
    Healthy,
    /// Stop the driver and abort the operation.
    Cancel(&'static str),
    /// The claim belongs to someone else now; stop without touching the record.
    Lost(String),
}

enum Driven {
    Finished(DriverResult),
    Cancelled(&'static str),
    ClaimLost(String),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    store: Arc<dyn OperationStore>,
    queue: Arc<dyn ProvisioningQueue>,
    drivers: Arc<DriverRegistry>,
    settings: DispatchSettings,
    session_id: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OperationStore>,
        queue: Arc<dyn ProvisioningQueue>,
        drivers: Arc<DriverRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            queue,
            drivers,
            settings,
            session_id: format!("dispatcher-{}", Uuid::new_v4()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Poll until `shutdown` fires. An in-flight pass is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(session = %self.session_id, "dispatcher started");
        while !shutdown.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(Some(report)) => {
                    debug!(batch_id = %report.batch_id, disposition = ?report.disposition, "pass finished");
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(session = %self.session_id, error = %e, "dispatch pass failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        info!(session = %self.session_id, "dispatcher stopped");
    }

    /// Take one visible batch off the queue and process it.
    pub async fn process_next(&self) -> Result<Option<PassReport>> {
        let Some(delivery) = self.with_queue(|queue| queue.dequeue()).await? else {
            return Ok(None);
        };
        self.process_delivery(delivery).await.map(Some)
    }

    #[instrument(skip_all, fields(
        session = %self.session_id,
        batch_id = %delivery.batch.id,
        message_id = %delivery.token.message_id,
        attempt = delivery.dequeue_count,
    ))]
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<PassReport> {
        let batch = &delivery.batch;
        let mut report = PassReport {
            batch_id: batch.id,
            message_id: delivery.token.message_id,
            executed: Vec::new(),
            aborted: Vec::new(),
            disposition: Disposition::LeftForRedelivery,
        };
        let mut requeue_after = None;

        for (index, op_id) in batch.operations.iter().enumerate() {
            let Some(op) = self.load(*op_id).await? else {
                warn!(op_id = %op_id, "batch references unknown operation; skipping");
                continue;
            };
            if op.is_terminal() {
                debug!(op_id = %op.id, status = %op.status, "already terminal; skipping");
                continue;
            }

            match self.gate(&op).await? {
                Gate::Ready => {}
                Gate::Abort(reason) => {
                    if self.abort_quietly(op.id, reason).await? {
                        report.aborted.push(op.id);
                    }
                    self.abort_dependents(batch, index, op.id, &mut report).await?;
                    continue;
                }
                Gate::Wait(reason) => {
                    info!(op_id = %op.id, %reason, "operation not ready; leaving batch for redelivery");
                    break;
                }
            }

            let (id, version, session) = (op.id, op.version, self.session_id.clone());
            let claimed = match self
                .with_store(move |store| store.set_in_progress(id, version, &session))
                .await
            {
                Ok(claimed) => claimed,
                Err(e) if e.is_conflict() => {
                    info!(op_id = %op.id, error = %e, "claim rejected; another dispatcher owns it");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let finished = self.run_operation(claimed, &delivery.token).await?;
            report.executed.push((finished.id, finished.status));
            match finished.status {
                OperationStatus::Failed => {
                    let resource = self.resource(finished.resource_id).await?;
                    requeue_after =
                        Some(self.settings.retry.delay_for(resource.resource_type, finished.kind));
                    break;
                }
                OperationStatus::Abandoned | OperationStatus::Aborted => {
                    self.abort_dependents(batch, index, finished.id, &mut report).await?;
                }
                OperationStatus::DoneSuccessful => {}
                OperationStatus::NotStarted | OperationStatus::InProgress => break,
            }
        }

        report.disposition = self.settle(&delivery, requeue_after).await?;
        info!(
            executed = report.executed.len(),
            aborted = report.aborted.len(),
            disposition = ?report.disposition,
            "batch pass complete"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Blocking store / queue access
    // -----------------------------------------------------------------------

    /// Run a store call on the blocking pool; redb I/O must not stall the
    /// runtime's worker threads.
    async fn with_store<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn OperationStore) -> Result<R> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        blocking(move || f(store.as_ref())).await
    }

    async fn with_queue<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn ProvisioningQueue) -> Result<R> + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        blocking(move || f(queue.as_ref())).await
    }

    async fn operation(&self, id: OperationId) -> Result<Operation> {
        self.with_store(move |store| store.get_operation(id)).await
    }

    async fn resource(&self, id: ResourceId) -> Result<Resource> {
        self.with_store(move |store| store.get_resource(id)).await
    }

    // -----------------------------------------------------------------------
    // Ordering / aborts
    // -----------------------------------------------------------------------

    async fn load(&self, id: OperationId) -> Result<Option<Operation>> {
        match self.operation(id).await {
            Ok(op) => Ok(Some(op)),
            Err(ProvisionError::OperationNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn gate(&self, op: &Operation) -> Result<Gate> {
        if op.kind != OperationKind::Delete && self.resource(op.resource_id).await?.deleted {
            return Ok(Gate::Abort(ABORT_RESOURCE_DELETED));
        }
        let Some(dep) = op.depends_on else {
            return Ok(Gate::Ready);
        };
        let predecessor = self.operation(dep).await?;
        Ok(match predecessor.status {
            OperationStatus::DoneSuccessful => Gate::Ready,
            OperationStatus::Aborted | OperationStatus::Abandoned => Gate::Abort(ABORT_DEPENDENCY_FAILED),
            other => Gate::Wait(format!("predecessor {dep} is {other}")),
        })
    }

    /// Abort `id`. Returns `false` if it had already reached a terminal state.
    async fn abort_quietly(&self, id: OperationId, reason: &'static str) -> Result<bool> {
        match self.with_store(move |store| store.abort(id, reason)).await {
            Ok(_) => {
                info!(op_id = %id, %reason, "operation aborted");
                Ok(true)
            }
            Err(ProvisionError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Abort every later operation in the batch that transitively depends on `failed`.
    async fn abort_dependents(
        &self,
        batch: &Batch,
        index: usize,
        failed: OperationId,
        report: &mut PassReport,
    ) -> Result<()> {
        let mut failed_set = HashSet::from([failed]);
        for op_id in &batch.operations[index + 1..] {
            let Some(op) = self.load(*op_id).await? else {
                continue;
            };
            let Some(dep) = op.depends_on else {
                continue;
            };
            if !failed_set.contains(&dep) || op.status == OperationStatus::DoneSuccessful {
                continue;
            }
            if !op.is_terminal() && self.abort_quietly(op.id, ABORT_DEPENDENCY_FAILED).await? {
                report.aborted.push(op.id);
            }
            failed_set.insert(op.id);
        }
        Ok(())
    }

    async fn all_terminal(&self, batch: &Batch) -> Result<bool> {
        for op_id in &batch.operations {
            if let Some(op) = self.load(*op_id).await? {
                if !op.is_terminal() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn settle(&self, delivery: &Delivery, requeue_after: Option<Duration>) -> Result<Disposition> {
        let token = delivery.token;
        let outcome = if self.all_terminal(&delivery.batch).await? {
            self.with_queue(move |queue| queue.delete(&token))
                .await
                .map(|_| Disposition::Acknowledged)
        } else if let Some(delay) = requeue_after {
            let batch = delivery.batch.clone();
            self.with_queue(move |queue| queue.requeue(&token, &batch, delay))
                .await
                .map(|_| Disposition::Requeued { delay })
        } else {
            return Ok(Disposition::LeftForRedelivery);
        };
        match outcome {
            Ok(disposition) => Ok(disposition),
            Err(e @ (ProvisionError::LeaseLost(_) | ProvisionError::MessageNotFound(_))) => {
                warn!(error = %e, "delivery no longer ours; leaving message to its current owner");
                Ok(Disposition::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Driving one operation
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(op_id = %op.id, kind = %op.kind, attempt = op.try_count + 1))]
    async fn run_operation(&self, op: Operation, token: &DeliveryToken) -> Result<Operation> {
        let resource = self.resource(op.resource_id).await?;
        let driver = match self.drivers.get(resource.resource_type) {
            Ok(driver) => driver,
            Err(e) => {
                error!(error = %e, "cannot drive operation");
                return self
                    .finish(&op, Completion::PermanentFailure { error: e.to_string() })
                    .await;
            }
        };

        let params = DriverParams {
            resource_id: resource.id,
            resource_type: resource.resource_type,
            name: resource.name.clone(),
            region: resource.region.clone(),
            tags: resource.tags.clone(),
            payload: op.payload.clone(),
            desired_state: resource.desired_state.clone(),
            shared_variables: self.group_variables(&resource).await?,
            cancel: CancellationToken::new(),
        };
        info!(resource = %resource.name, resource_type = %resource.resource_type, "driving operation");

        let completion = match self.drive(&op, driver.as_ref(), &params, token).await {
            Driven::Finished(Ok(output)) => {
                let output = self
                    .collect_shared_variables(op.kind, driver.as_ref(), &params, output)
                    .await;
                Completion::Succeeded {
                    provider_state: output.provider_state,
                    shared_variables: output.shared_variables,
                }
            }
            Driven::Finished(Err(e)) => match e.class {
                ErrorClass::Transient => Completion::TransientFailure { error: e.message },
                ErrorClass::Permanent => Completion::PermanentFailure { error: e.message },
                ErrorClass::Cancelled => return self.abort_after_cancel(&op, "driver cancelled").await,
            },
            Driven::Cancelled(reason) => return self.abort_after_cancel(&op, reason).await,
            Driven::ClaimLost(reason) => {
                warn!(%reason, "claim lost while driving; outcome left to the record's owner");
                return self.operation(op.id).await;
            }
        };
        self.finish(&op, completion).await
    }

    async fn drive(
        &self,
        op: &Operation,
        driver: &dyn Driver,
        params: &DriverParams,
        token: &DeliveryToken,
    ) -> Driven {
        let call = invoke(driver, op.kind, params);
        tokio::pin!(call);

        let mut ticker =
            tokio::time::interval(self.settings.heartbeat_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let driven = loop {
            tokio::select! {
                result = &mut call => return Driven::Finished(result),
                _ = ticker.tick() => {}
            }
            let pulse = tokio::select! {
                result = &mut call => return Driven::Finished(result),
                pulse = self.heartbeat(op, token) => pulse,
            };
            match pulse {
                Pulse::Healthy => {}
                Pulse::Cancel(reason) => break Driven::Cancelled(reason),
                Pulse::Lost(reason) => break Driven::ClaimLost(reason),
            }
        };

        // The message stays hidden while the driver winds down.
        params.cancel.cancel();
        let grace = tokio::time::sleep(self.settings.cancel_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut call => break,
                _ = &mut grace => {
                    warn!(op_id = %op.id, "driver ignored cancellation; dropping the call");
                    break;
                }
                _ = ticker.tick() => self.extend_visibility(op, token).await,
            }
        }
        driven
    }

    /// Keep the message hidden and check whether the work is still wanted.
    async fn heartbeat(&self, op: &Operation, token: &DeliveryToken) -> Pulse {
        self.extend_visibility(op, token).await;
        let (id, session) = (op.id, self.session_id.clone());
        match self.with_store(move |store| store.heartbeat(id, &session)).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Pulse::Lost(e.to_string()),
            Err(e) => warn!(op_id = %op.id, error = %e, "heartbeat write failed"),
        }
        if op.kind != OperationKind::Delete {
            match self.resource(op.resource_id).await {
                Ok(resource) if resource.deleted => return Pulse::Cancel(ABORT_RESOURCE_DELETED),
                Ok(_) => {}
                Err(e) => warn!(op_id = %op.id, error = %e, "could not check resource state"),
            }
        }
        Pulse::Healthy
    }

    async fn extend_visibility(&self, op: &Operation, token: &DeliveryToken) {
        let (token, window) = (*token, self.settings.visibility_timeout);
        if let Err(e) = self
            .with_queue(move |queue| queue.extend_visibility(&token, window))
            .await
        {
            warn!(op_id = %op.id, error = %e, "could not extend visibility; batch may be redelivered");
        }
    }

    async fn collect_shared_variables(
        &self,
        kind: OperationKind,
        driver: &dyn Driver,
        params: &DriverParams,
        mut output: DriverOutput,
    ) -> DriverOutput {
        if kind == OperationKind::Delete || !output.shared_variables.is_empty() {
            return output;
        }
        match driver.get_shared_variables(params).await {
            Ok(read) => output.shared_variables = read.shared_variables,
            Err(e) => warn!(error = %e, "could not read shared variables"),
        }
        output
    }

    async fn group_variables(&self, resource: &Resource) -> Result<BTreeMap<String, String>> {
        let scope = resource.scope_id();
        let members = self
            .with_store(move |store| store.resources_in_group(scope))
            .await?;
        let mut vars = BTreeMap::new();
        for member in members {
            vars.extend(member.shared_variables);
        }
        Ok(vars)
    }

    async fn finish(&self, op: &Operation, completion: Completion) -> Result<Operation> {
        let (id, session) = (op.id, self.session_id.clone());
        match self
            .with_store(move |store| store.complete(id, &session, completion))
            .await
        {
            Ok(done) => {
                match done.status {
                    OperationStatus::DoneSuccessful => info!(op_id = %done.id, "operation succeeded"),
                    OperationStatus::Abandoned => warn!(
                        op_id = %done.id,
                        tries = done.try_count,
                        error = done.last_error.as_deref().unwrap_or_default(),
                        "operation abandoned"
                    ),
                    status => warn!(
                        op_id = %done.id,
                        %status,
                        tries = done.try_count,
                        max_tries = done.max_try_count,
                        error = done.last_error.as_deref().unwrap_or_default(),
                        "operation failed"
                    ),
                }
                Ok(done)
            }
            Err(e) if e.is_conflict() => {
                warn!(op_id = %op.id, error = %e, "operation changed while driving; outcome discarded");
                self.operation(op.id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn abort_after_cancel(&self, op: &Operation, reason: &'static str) -> Result<Operation> {
        let id = op.id;
        match self.with_store(move |store| store.abort(id, reason)).await {
            Ok(aborted) => {
                info!(op_id = %op.id, %reason, "operation aborted after cancellation");
                Ok(aborted)
            }
            Err(ProvisionError::InvalidTransition { .. }) => self.operation(op.id).await,
            Err(e) => Err(e),
        }
    }
}

/// Run synchronous storage work on tokio's blocking pool.
pub(crate) async fn blocking<R, F>(f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProvisionError::Storage(format!("task join error: {e}")))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
