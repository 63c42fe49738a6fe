//! redb-backed `OperationStore`.
//!
//! # Table design
//!
//! ```text
//! resources         [ resource_id: 16 bytes ]                           -> JSON Resource
//! operations        [ operation_id: 16 bytes ]                          -> JSON Operation
//! resource_history  [ resource_id: 16 | seq: u64 BE | operation_id: 16 ] -> ()
//! sequences         name                                                -> u64
//! ```
//!
//! `resource_history` is an index: because the per-store sequence occupies the
//! middle bytes in big-endian encoding, a prefix range scan over one resource
//! returns its operations in creation order without sorting. Sequences are
//! used instead of timestamps so two operations created within the same
//! millisecond still have a defined order.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use redb::{ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db_file::DbFile;
use crate::error::{storage, ProvisionError, Result};
use crate::operation::{Completion, NewOperation, Operation};
use crate::payload::{DeleteSpec, OperationPayload};
use crate::resource::Resource;
use crate::types::{BatchId, OperationId, OperationKind, OperationStatus, ResourceId};

use super::OperationStore;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const RESOURCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("resources");
const OPERATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("operations");
const RESOURCE_HISTORY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("resource_history");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const RESOURCE_SEQ: &str = "resource";
const OPERATION_SEQ: &str = "operation";

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn history_key(resource_id: ResourceId, seq: u64, op_id: OperationId) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..16].copy_from_slice(resource_id.as_bytes());
    key[16..24].copy_from_slice(&seq.to_be_bytes());
    key[24..].copy_from_slice(op_id.as_bytes());
    key
}

/// Inclusive bounds covering every history entry of one resource.
fn history_bounds(resource_id: ResourceId) -> ([u8; 40], [u8; 40]) {
    let mut lo = [0u8; 40];
    lo[..16].copy_from_slice(resource_id.as_bytes());
    let mut hi = [0xffu8; 40];
    hi[..16].copy_from_slice(resource_id.as_bytes());
    (lo, hi)
}

fn op_id_from_history_key(key: &[u8]) -> Result<OperationId> {
    let uuid = Uuid::from_slice(&key[24..40]).map_err(storage)?;
    Ok(OperationId::from(uuid))
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

fn read_json<T, Tbl>(table: &Tbl, key: &[u8]) -> Result<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(key).map_err(storage)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(table: &mut BytesTable<'_>, key: &[u8], value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice()).map_err(storage)?;
    Ok(())
}

fn next_seq(table: &mut Table<'_, &'static str, u64>, name: &str) -> Result<u64> {
    let current = table.get(name).map_err(storage)?.map(|g| g.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(storage)?;
    Ok(next)
}

fn load_op(ops: &BytesTable<'_>, id: OperationId) -> Result<Operation> {
    read_json(ops, id.as_bytes())?.ok_or(ProvisionError::OperationNotFound(id))
}

fn load_resource(resources: &BytesTable<'_>, id: ResourceId) -> Result<Resource> {
    read_json(resources, id.as_bytes())?.ok_or(ProvisionError::InvalidResource(id))
}

/// Read-modify-write one operation. `f` may reject the transition by
/// returning an error, in which case nothing is written.
fn mutate_op(
    ops: &mut BytesTable<'_>,
    id: OperationId,
    f: impl FnOnce(&mut Operation) -> Result<()>,
) -> Result<Operation> {
    let mut op = load_op(ops, id)?;
    f(&mut op)?;
    op.version += 1;
    op.updated_at = Utc::now();
    write_json(ops, id.as_bytes(), &op)?;
    Ok(op)
}

fn mutate_resource(
    resources: &mut BytesTable<'_>,
    id: ResourceId,
    f: impl FnOnce(&mut Resource) -> Result<()>,
) -> Result<Resource> {
    let mut resource = load_resource(resources, id)?;
    f(&mut resource)?;
    resource.updated_at = Utc::now();
    write_json(resources, id.as_bytes(), &resource)?;
    Ok(resource)
}

fn history_ids(history: &BytesTable<'_>, resource_id: ResourceId) -> Result<Vec<OperationId>> {
    let (lo, hi) = history_bounds(resource_id);
    let mut ids = Vec::new();
    for entry in history
        .range(lo.as_slice()..=hi.as_slice())
        .map_err(storage)?
    {
        let (k, _) = entry.map_err(storage)?;
        ids.push(op_id_from_history_key(k.value())?);
    }
    Ok(ids)
}

/// Count one failed try and pick the resulting status.
fn record_failure(op: &mut Operation, error: String, permanent: bool) {
    op.try_count += 1;
    op.status = if permanent || op.try_count >= op.max_try_count {
        OperationStatus::Abandoned
    } else {
        OperationStatus::Failed
    };
    op.last_error = Some(error);
    op.heartbeat_at = None;
}

fn require_claim(op: &Operation, session_id: &str) -> Result<()> {
    if op.status != OperationStatus::InProgress {
        return Err(ProvisionError::PreconditionFailed {
            op_id: op.id,
            reason: format!("status is {}, not in_progress", op.status),
        });
    }
    if op.session_id.as_deref() != Some(session_id) {
        return Err(ProvisionError::PreconditionFailed {
            op_id: op.id,
            reason: format!("claimed by another session ({:?})", op.session_id),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// Persistent store for resource and operation records.
pub struct RedbStore {
    file: DbFile,
    default_max_try_count: u32,
}

impl RedbStore {
    /// Open or create the redb database at `path`, creating tables if needed.
    ///
    /// New operations get `default_max_try_count` tries. The file stays
    /// closed between calls so other processes on the same root can use it.
    pub fn open(path: &Path, default_max_try_count: u32) -> Result<Self> {
        let file = DbFile::open(path, |wt| {
            wt.open_table(RESOURCES).map_err(storage)?;
            wt.open_table(OPERATIONS).map_err(storage)?;
            wt.open_table(RESOURCE_HISTORY).map_err(storage)?;
            wt.open_table(SEQUENCES).map_err(storage)?;
            Ok(())
        })?;
        Ok(Self {
            file,
            default_max_try_count: default_max_try_count.max(1),
        })
    }

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        self.file.write(f)
    }

    /// Insert a new operation inside `wt`. The caller must not hold any of the
    /// store's tables open.
    fn insert_operation(
        &self,
        wt: &WriteTransaction,
        new: NewOperation,
    ) -> Result<Operation> {
        let mut resources = wt.open_table(RESOURCES).map_err(storage)?;
        let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
        let mut history = wt.open_table(RESOURCE_HISTORY).map_err(storage)?;
        let mut seqs = wt.open_table(SEQUENCES).map_err(storage)?;

        let kind = new.payload.kind();
        let resource = load_resource(&resources, new.resource_id)?;
        if resource.deleted && kind != OperationKind::Delete {
            return Err(ProvisionError::ResourceDeleted(resource.id));
        }
        if let Some(dep) = new.depends_on {
            load_op(&ops, dep)?;
        }
        if let Some(settings) = new.payload.settings().filter(|s| s.is_object()) {
            mutate_resource(&mut resources, resource.id, |r| {
                r.desired_state = settings.clone();
                Ok(())
            })?;
        }

        let seq = next_seq(&mut seqs, OPERATION_SEQ)?;
        let now = Utc::now();
        let op = Operation {
            id: OperationId::new(),
            resource_id: new.resource_id,
            kind,
            payload: new.payload,
            status: OperationStatus::NotStarted,
            try_count: 0,
            max_try_count: self.default_max_try_count,
            depends_on: new.depends_on,
            batch_id: None,
            description: new.description,
            last_error: None,
            abort_reason: None,
            session_id: None,
            version: 0,
            seq,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        };
        write_json(&mut ops, op.id.as_bytes(), &op)?;
        let key = history_key(op.resource_id, seq, op.id);
        let empty: &[u8] = &[];
        history.insert(key.as_slice(), empty).map_err(storage)?;
        debug!(op_id = %op.id, resource_id = %op.resource_id, kind = %op.kind, "created operation");
        Ok(op)
    }
}

impl OperationStore for RedbStore {
    fn create_resource(&self, mut resource: Resource) -> Result<Resource> {
        self.write(|wt| {
            let mut resources = wt.open_table(RESOURCES).map_err(storage)?;
            let mut seqs = wt.open_table(SEQUENCES).map_err(storage)?;
            if let Some(group_id) = resource.group_id {
                let group = load_resource(&resources, group_id)?;
                if group.deleted {
                    return Err(ProvisionError::ResourceDeleted(group_id));
                }
            }
            resource.seq = next_seq(&mut seqs, RESOURCE_SEQ)?;
            write_json(&mut resources, resource.id.as_bytes(), &resource)?;
            Ok(resource)
        })
    }

    fn get_resource(&self, id: ResourceId) -> Result<Resource> {
        self.file.read(|rt| {
            let table = rt.open_table(RESOURCES).map_err(storage)?;
            read_json(&table, id.as_bytes())?.ok_or(ProvisionError::InvalidResource(id))
        })
    }

    fn list_resources(&self) -> Result<Vec<Resource>> {
        let mut result = self.file.read(|rt| {
            let table = rt.open_table(RESOURCES).map_err(storage)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(storage)? {
                let (_, v) = entry.map_err(storage)?;
                let resource: Resource = serde_json::from_slice(v.value())?;
                result.push(resource);
            }
            Ok(result)
        })?;
        result.sort_by_key(|r| r.seq);
        Ok(result)
    }

    fn resources_in_group(&self, group_id: ResourceId) -> Result<Vec<Resource>> {
        let all = self.list_resources()?;
        if !all.iter().any(|r| r.id == group_id) {
            return Err(ProvisionError::InvalidResource(group_id));
        }
        Ok(all
            .into_iter()
            .filter(|r| r.id == group_id || r.group_id == Some(group_id))
            .collect())
    }

    fn mark_resource_deleted(&self, id: ResourceId, actor: &str) -> Result<(Resource, bool)> {
        self.write(|wt| {
            let mut resources = wt.open_table(RESOURCES).map_err(storage)?;
            let current = load_resource(&resources, id)?;
            if current.deleted {
                return Ok((current, false));
            }
            let updated = mutate_resource(&mut resources, id, |r| {
                r.deleted = true;
                r.deleted_at = Some(Utc::now());
                r.deleted_by = Some(actor.to_string());
                Ok(())
            })?;
            Ok((updated, true))
        })
    }

    fn create_operation(&self, new: NewOperation) -> Result<Operation> {
        self.write(|wt| self.insert_operation(wt, new))
    }

    fn get_operation(&self, id: OperationId) -> Result<Operation> {
        self.file.read(|rt| {
            let table = rt.open_table(OPERATIONS).map_err(storage)?;
            read_json(&table, id.as_bytes())?.ok_or(ProvisionError::OperationNotFound(id))
        })
    }

    fn operations_for_resource(&self, id: ResourceId) -> Result<Vec<Operation>> {
        self.file.read(|rt| {
            let resources = rt.open_table(RESOURCES).map_err(storage)?;
            if read_json::<Resource, _>(&resources, id.as_bytes())?.is_none() {
                return Err(ProvisionError::InvalidResource(id));
            }
            let history = rt.open_table(RESOURCE_HISTORY).map_err(storage)?;
            let ops = rt.open_table(OPERATIONS).map_err(storage)?;

            let (lo, hi) = history_bounds(id);
            let mut result = Vec::new();
            for entry in history
                .range(lo.as_slice()..=hi.as_slice())
                .map_err(storage)?
            {
                let (k, _) = entry.map_err(storage)?;
                let op_id = op_id_from_history_key(k.value())?;
                let op: Operation = read_json(&ops, op_id.as_bytes())?
                    .ok_or(ProvisionError::OperationNotFound(op_id))?;
                result.push(op);
            }
            Ok(result)
        })
    }

    fn list_operations(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>> {
        let mut result = self.file.read(|rt| {
            let table = rt.open_table(OPERATIONS).map_err(storage)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(storage)? {
                let (_, v) = entry.map_err(storage)?;
                let op: Operation = serde_json::from_slice(v.value())?;
                if status.map_or(true, |s| op.status == s) {
                    result.push(op);
                }
            }
            Ok(result)
        })?;
        result.sort_by_key(|o| o.seq);
        Ok(result)
    }

    fn assign_batch(&self, op_ids: &[OperationId], batch_id: BatchId) -> Result<()> {
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            for id in op_ids {
                mutate_op(&mut ops, *id, |op| {
                    op.batch_id = Some(batch_id);
                    Ok(())
                })?;
            }
            Ok(())
        })
    }

    fn set_in_progress(
        &self,
        id: OperationId,
        expected_version: u64,
        session_id: &str,
    ) -> Result<Operation> {
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            let current = load_op(&ops, id)?;
            if current.version != expected_version {
                return Err(ProvisionError::ConcurrencyConflict {
                    op_id: id,
                    expected: expected_version,
                    actual: current.version,
                });
            }
            if !current.status.is_claimable() {
                return Err(ProvisionError::PreconditionFailed {
                    op_id: id,
                    reason: format!("status is {}", current.status),
                });
            }
            if let Some(dep) = current.depends_on {
                let predecessor = load_op(&ops, dep)?;
                if predecessor.status != OperationStatus::DoneSuccessful {
                    return Err(ProvisionError::PreconditionFailed {
                        op_id: id,
                        reason: format!("predecessor {dep} is {}", predecessor.status),
                    });
                }
            }
            mutate_op(&mut ops, id, |op| {
                op.status = OperationStatus::InProgress;
                op.session_id = Some(session_id.to_string());
                op.heartbeat_at = Some(Utc::now());
                Ok(())
            })
        })
    }

    fn heartbeat(&self, id: OperationId, session_id: &str) -> Result<Operation> {
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            mutate_op(&mut ops, id, |op| {
                require_claim(op, session_id)?;
                op.heartbeat_at = Some(Utc::now());
                Ok(())
            })
        })
    }

    fn complete(
        &self,
        id: OperationId,
        session_id: &str,
        completion: Completion,
    ) -> Result<Operation> {
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            let mut resources = wt.open_table(RESOURCES).map_err(storage)?;
            let current = load_op(&ops, id)?;
            require_claim(&current, session_id)?;

            match completion {
                Completion::Succeeded {
                    provider_state,
                    shared_variables,
                } => {
                    mutate_resource(&mut resources, current.resource_id, |r| {
                        if provider_state.is_some() {
                            r.provider_state = provider_state;
                        }
                        r.shared_variables.extend(shared_variables);
                        Ok(())
                    })?;
                    mutate_op(&mut ops, id, |op| {
                        op.status = OperationStatus::DoneSuccessful;
                        op.last_error = None;
                        op.heartbeat_at = None;
                        Ok(())
                    })
                }
                Completion::TransientFailure { error } => {
                    mutate_op(&mut ops, id, |op| {
                        record_failure(op, error, false);
                        Ok(())
                    })
                }
                Completion::PermanentFailure { error } => {
                    mutate_op(&mut ops, id, |op| {
                        record_failure(op, error, true);
                        Ok(())
                    })
                }
            }
        })
    }

    fn abort(&self, id: OperationId, reason: &str) -> Result<Operation> {
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            mutate_op(&mut ops, id, |op| {
                if op.status.is_terminal() {
                    return Err(ProvisionError::InvalidTransition {
                        op_id: id,
                        from: op.status,
                        to: OperationStatus::Aborted,
                    });
                }
                op.status = OperationStatus::Aborted;
                op.abort_reason = Some(reason.to_string());
                op.heartbeat_at = None;
                Ok(())
            })
        })
    }

    fn reopen(&self, id: OperationId, increment: u32) -> Result<Operation> {
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            mutate_op(&mut ops, id, |op| {
                match op.status {
                    OperationStatus::NotStarted => {}
                    status if status.is_retryable() => op.status = OperationStatus::Failed,
                    status => {
                        return Err(ProvisionError::InvalidTransition {
                            op_id: id,
                            from: status,
                            to: OperationStatus::Failed,
                        })
                    }
                }
                op.max_try_count = op.max_try_count.max(op.try_count) + increment;
                Ok(())
            })
        })
    }

    fn ensure_delete_operation(
        &self,
        resource_id: ResourceId,
        description: &str,
    ) -> Result<(Operation, bool)> {
        self.write(|wt| {
            {
                let ops = wt.open_table(OPERATIONS).map_err(storage)?;
                let history = wt.open_table(RESOURCE_HISTORY).map_err(storage)?;
                for op_id in history_ids(&history, resource_id)? {
                    let op = load_op(&ops, op_id)?;
                    if op.kind == OperationKind::Delete && !op.is_terminal() {
                        return Ok((op, false));
                    }
                }
            }
            let new = NewOperation::new(
                resource_id,
                OperationPayload::Delete(DeleteSpec {
                    reason: Some(description.to_string()),
                }),
            )
            .describe(description);
            let op = self.insert_operation(wt, new)?;
            Ok((op, true))
        })
    }

    fn recover_stale(&self, max_age: Duration) -> Result<Vec<Operation>> {
        let max_age = chrono::Duration::from_std(max_age).map_err(storage)?;
        let cutoff = Utc::now() - max_age;
        self.write(|wt| {
            let mut ops = wt.open_table(OPERATIONS).map_err(storage)?;
            let mut stale = Vec::new();
            for entry in ops.iter().map_err(storage)? {
                let (_, v) = entry.map_err(storage)?;
                let op: Operation = serde_json::from_slice(v.value())?;
                let last_seen = op.heartbeat_at.unwrap_or(op.updated_at);
                if op.status == OperationStatus::InProgress && last_seen < cutoff {
                    stale.push(op.id);
                }
            }

            let mut recovered = Vec::with_capacity(stale.len());
            for id in stale {
                let op = mutate_op(&mut ops, id, |op| {
                    record_failure(op, "recovered from stale claim".to_string(), false);
                    op.session_id = None;
                    Ok(())
                })?;
                warn!(op_id = %op.id, status = %op.status, "recovered stale in-progress operation");
                recovered.push(op);
            }
            Ok(recovered)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ResourceSpec;
    use crate::types::ResourceType;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_tmp(max_tries: u32) -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("store.redb"), max_tries).unwrap();
        (dir, store)
    }

    fn create_payload() -> OperationPayload {
        OperationPayload::Create(ResourceSpec::default())
    }

    fn vnet(store: &RedbStore) -> Resource {
        store
            .create_resource(Resource::new(ResourceType::VirtualNetwork, "vnet-1", "norwayeast"))
            .unwrap()
    }

    fn claim(store: &RedbStore, id: OperationId, session: &str) -> Result<Operation> {
        let op = store.get_operation(id)?;
        store.set_in_progress(id, op.version, session)
    }

    #[test]
    fn create_operation_starts_not_started() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        assert_eq!(op.status, OperationStatus::NotStarted);
        assert_eq!(op.try_count, 0);
        assert_eq!(op.max_try_count, 3);
        assert_eq!(op.kind, OperationKind::Create);
    }

    #[test]
    fn create_operation_rejects_unknown_resource() {
        let (_dir, store) = open_tmp(3);
        let missing = ResourceId::new();
        let err = store
            .create_operation(NewOperation::new(missing, create_payload()))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidResource(id) if id == missing));
    }

    #[test]
    fn create_operation_rejects_unknown_predecessor() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let err = store
            .create_operation(NewOperation::new(r.id, create_payload()).depends_on(OperationId::new()))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::OperationNotFound(_)));
    }

    #[test]
    fn desired_state_is_written_with_the_operation() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let settings = serde_json::json!({"address_space": "10.0.0.0/16"});
        let with_settings = || {
            OperationPayload::Create(ResourceSpec {
                settings: settings.clone(),
            })
        };

        store
            .create_operation(NewOperation::new(r.id, with_settings()).depends_on(OperationId::new()))
            .unwrap_err();
        assert!(store.get_resource(r.id).unwrap().desired_state.is_null());

        store.create_operation(NewOperation::new(r.id, with_settings())).unwrap();
        assert_eq!(store.get_resource(r.id).unwrap().desired_state, settings);
    }

    #[test]
    fn second_handle_on_the_same_file_sees_writes() {
        let (dir, store) = open_tmp(3);
        let other = RedbStore::open(&dir.path().join("store.redb"), 3).unwrap();
        let r = vnet(&store);
        let op = other
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        claim(&store, op.id, "worker-a").unwrap();

        let (_, newly) = other.mark_resource_deleted(r.id, "operator").unwrap();
        assert!(newly);
        assert_eq!(store.get_operation(op.id).unwrap().status, OperationStatus::InProgress);
        assert!(store.get_resource(r.id).unwrap().deleted);
    }

    #[test]
    fn history_is_in_creation_order() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let ids: Vec<_> = (0..5)
            .map(|_| {
                store
                    .create_operation(NewOperation::new(r.id, create_payload()))
                    .unwrap()
                    .id
            })
            .collect();
        let history: Vec<_> = store
            .operations_for_resource(r.id)
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(history, ids);
    }

    #[test]
    fn set_in_progress_requires_successful_predecessor() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let first = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        let second = store
            .create_operation(NewOperation::new(r.id, create_payload()).depends_on(first.id))
            .unwrap();

        let err = claim(&store, second.id, "w1").unwrap_err();
        assert!(matches!(err, ProvisionError::PreconditionFailed { .. }));

        claim(&store, first.id, "w1").unwrap();
        store.complete(first.id, "w1", Completion::success()).unwrap();
        let claimed = claim(&store, second.id, "w1").unwrap();
        assert_eq!(claimed.status, OperationStatus::InProgress);
    }

    #[test]
    fn double_claim_is_rejected() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        let snapshot = store.get_operation(op.id).unwrap();

        store
            .set_in_progress(op.id, snapshot.version, "worker-a")
            .unwrap();
        let err = store
            .set_in_progress(op.id, snapshot.version, "worker-b")
            .unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");
    }

    #[test]
    fn abandoned_exactly_when_budget_exhausted() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();

        for attempt in 1..=3 {
            claim(&store, op.id, "w").unwrap();
            let after = store
                .complete(
                    op.id,
                    "w",
                    Completion::TransientFailure {
                        error: format!("boom {attempt}"),
                    },
                )
                .unwrap();
            assert_eq!(after.try_count, attempt);
            if attempt < 3 {
                assert_eq!(after.status, OperationStatus::Failed);
            } else {
                assert_eq!(after.status, OperationStatus::Abandoned);
            }
        }
        assert!(claim(&store, op.id, "w").is_err());

        let reopened = store.reopen(op.id, 2).unwrap();
        assert_eq!(reopened.status, OperationStatus::Failed);
        assert_eq!(reopened.max_try_count, 5);
        claim(&store, op.id, "w").unwrap();
    }

    #[test]
    fn permanent_failure_abandons_immediately() {
        let (_dir, store) = open_tmp(5);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        claim(&store, op.id, "w").unwrap();
        let after = store
            .complete(
                op.id,
                "w",
                Completion::PermanentFailure {
                    error: "invalid sku".into(),
                },
            )
            .unwrap();
        assert_eq!(after.status, OperationStatus::Abandoned);
        assert_eq!(after.try_count, 1);
    }

    #[test]
    fn complete_requires_matching_session() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        claim(&store, op.id, "owner").unwrap();
        let err = store
            .complete(op.id, "intruder", Completion::success())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PreconditionFailed { .. }));
    }

    #[test]
    fn success_writes_provider_state_and_shared_variables() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        claim(&store, op.id, "w").unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("subnet_id".to_string(), "subnet-42".to_string());
        store
            .complete(
                op.id,
                "w",
                Completion::Succeeded {
                    provider_state: Some(serde_json::json!({ "state": "Succeeded" })),
                    shared_variables: vars,
                },
            )
            .unwrap();
        let resource = store.get_resource(r.id).unwrap();
        assert_eq!(resource.shared_variables["subnet_id"], "subnet-42");
        assert_eq!(
            resource.provider_state,
            Some(serde_json::json!({ "state": "Succeeded" }))
        );
    }

    #[test]
    fn abort_only_from_non_terminal() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        let aborted = store.abort(op.id, "operator cancel").unwrap();
        assert_eq!(aborted.status, OperationStatus::Aborted);
        assert_eq!(aborted.abort_reason.as_deref(), Some("operator cancel"));
        assert!(matches!(
            store.abort(op.id, "again").unwrap_err(),
            ProvisionError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn ensure_delete_operation_reuses_pending_delete() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let (first, created) = store.ensure_delete_operation(r.id, "delete vnet").unwrap();
        assert!(created);
        let (second, created_again) = store.ensure_delete_operation(r.id, "delete vnet").unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn deleted_resource_only_accepts_delete() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let (_, newly) = store.mark_resource_deleted(r.id, "alice").unwrap();
        assert!(newly);
        let (_, again) = store.mark_resource_deleted(r.id, "bob").unwrap();
        assert!(!again);
        let err = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceDeleted(_)));
    }

    #[test]
    fn recover_stale_fails_old_claims_only() {
        let (_dir, store) = open_tmp(3);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        claim(&store, op.id, "crashed").unwrap();

        assert!(store.recover_stale(Duration::from_secs(60)).unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let recovered = store.recover_stale(Duration::from_millis(5)).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, OperationStatus::Failed);
        assert_eq!(recovered[0].try_count, 1);
        assert!(claim(&store, op.id, "fresh").is_ok());
    }

    #[test]
    fn list_abandoned_carries_resource_context() {
        let (_dir, store) = open_tmp(1);
        let r = vnet(&store);
        let op = store
            .create_operation(NewOperation::new(r.id, create_payload()))
            .unwrap();
        claim(&store, op.id, "w").unwrap();
        store
            .complete(op.id, "w", Completion::TransientFailure { error: "quota".into() })
            .unwrap();
        let abandoned = store.list_abandoned().unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].operation_id, op.id);
        assert_eq!(abandoned[0].resource_type, ResourceType::VirtualNetwork);
        assert_eq!(abandoned[0].last_error.as_deref(), Some("quota"));
    }

    #[test]
    fn resources_in_group_include_group_and_members() {
        let (_dir, store) = open_tmp(3);
        let group = store
            .create_resource(Resource::new(ResourceType::ResourceGroup, "rg", "norwayeast"))
            .unwrap();
        let member = store
            .create_resource(
                Resource::new(ResourceType::StorageAccount, "diag", "norwayeast").in_group(group.id),
            )
            .unwrap();
        store
            .create_resource(Resource::new(ResourceType::VirtualMachine, "other", "norwayeast"))
            .unwrap();
        let members: Vec<_> = store
            .resources_in_group(group.id)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(members, vec![group.id, member.id]);
    }
}
