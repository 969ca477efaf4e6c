//! StateStore — redb-backed invocation log.
//!
//! Provides typed operations over invocations and deployments. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use orch_core::{BlueprintId, DeploymentId, InvocationId};
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INVOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Invocations ────────────────────────────────────────────────

    /// Insert a new invocation or persist a transition of an existing one.
    ///
    /// Rejects overwriting a terminal record and any edge outside the
    /// lifecycle. The check and the write happen in one transaction.
    ///
    /// A transition of a record that was deleted together with its
    /// deployment is dropped, so a forced delete is never undone.
    pub fn put_invocation(&self, invocation: &Invocation) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if !write_invocation(&txn, invocation)? {
            return Ok(());
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            invocation_id = %invocation.invocation_id,
            state = %invocation.state,
            "invocation stored"
        );
        Ok(())
    }

    /// Persist a submitted invocation together with its deployment record.
    pub fn submit(&self, invocation: &Invocation, deployment: &Deployment) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_invocation(&txn, invocation)?;
        write_deployment(&txn, deployment)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            invocation_id = %invocation.invocation_id,
            deployment_id = %deployment.deployment_id,
            "invocation submitted"
        );
        Ok(())
    }

    /// Write the final invocation and fold it into its deployment atomically.
    ///
    /// A deployment deleted while the invocation ran (forced delete) is not
    /// recreated, and neither is the invocation history it took with it.
    pub fn finish_invocation(&self, invocation: &Invocation) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if !write_invocation(&txn, invocation)? {
            return Ok(None);
        }
        let deployment = {
            let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let key = invocation.deployment_id.to_string();
            match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode::<Deployment>(guard.value())?),
                None => None,
            }
        };
        let deployment = match deployment {
            Some(mut deployment) => {
                deployment.record_outcome(invocation);
                write_deployment(&txn, &deployment)?;
                Some(deployment)
            }
            None => None,
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            invocation_id = %invocation.invocation_id,
            state = %invocation.state,
            "invocation finished"
        );
        Ok(deployment)
    }

    pub fn get_invocation(&self, id: InvocationId) -> StateResult<Option<Invocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INVOCATIONS).map_err(map_err!(Table))?;
        let key = id.to_string();
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All invocations, oldest submission first.
    ///
    /// Fails on the first record that cannot be decoded.
    pub fn list_invocations(&self) -> StateResult<Vec<Invocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INVOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode::<Invocation>(value.value())?);
        }
        sort_by_submission(&mut results);
        Ok(results)
    }

    pub fn invocations_in_state(&self, state: InvocationState) -> StateResult<Vec<Invocation>> {
        let mut all = self.list_invocations()?;
        all.retain(|inv| inv.state == state);
        Ok(all)
    }

    /// Invocation history of one deployment, oldest submission first.
    pub fn invocations_for_deployment(
        &self,
        deployment_id: DeploymentId,
    ) -> StateResult<Vec<Invocation>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let invocations = txn.open_table(INVOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in history.iter().map_err(map_err!(Read))? {
            let (key, id) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            if let Some(guard) = invocations.get(id.value()).map_err(map_err!(Read))? {
                results.push(decode::<Invocation>(guard.value())?);
            }
        }
        sort_by_submission(&mut results);
        Ok(results)
    }

    /// The queued or running invocation of a deployment, if any.
    pub fn active_invocation(&self, deployment_id: DeploymentId) -> StateResult<Option<Invocation>> {
        Ok(self
            .invocations_for_deployment(deployment_id)?
            .into_iter()
            .find(|inv| inv.state.is_active()))
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_deployment(&txn, deployment)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %deployment.deployment_id, status = %deployment.status, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, id: DeploymentId) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let key = id.to_string();
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode::<Deployment>(value.value())?);
        }
        results.sort_by_key(|d| d.created_at);
        Ok(results)
    }

    pub fn deployments_for_blueprint(&self, blueprint_id: BlueprintId) -> StateResult<Vec<Deployment>> {
        let mut all = self.list_deployments()?;
        all.retain(|d| d.blueprint_id == blueprint_id);
        Ok(all)
    }

    /// Delete a deployment and its invocation history.
    ///
    /// Returns the number of invocations removed, or `None` if the
    /// deployment did not exist.
    pub fn delete_deployment(&self, id: DeploymentId) -> StateResult<Option<usize>> {
        let prefix = format!("{id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let key = id.to_string();
            let existed = deployments
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();

            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let mut entries: Vec<(String, String)> = Vec::new();
            for entry in history.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    entries.push((key.value().to_string(), value.value().to_string()));
                }
            }

            let mut invocations = txn.open_table(INVOCATIONS).map_err(map_err!(Table))?;
            for (key, invocation_id) in &entries {
                history.remove(key.as_str()).map_err(map_err!(Write))?;
                invocations
                    .remove(invocation_id.as_str())
                    .map_err(map_err!(Write))?;
            }
            existed.then_some(entries.len())
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %id, removed = ?removed, "deployment deleted");
        Ok(removed)
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn sort_by_submission(invocations: &mut [Invocation]) {
    invocations.sort_by_key(|inv| inv.timestamp_submission);
}

fn check_transition(previous: &Invocation, next: &Invocation) -> StateResult<()> {
    if previous.state.is_terminal() {
        return Err(StateError::TerminalState {
            invocation_id: previous.invocation_id,
            state: previous.state,
        });
    }
    if previous.state != next.state && !previous.state.can_transition_to(next.state) {
        return Err(StateError::InvalidTransition {
            invocation_id: previous.invocation_id,
            from: previous.state,
            to: next.state,
        });
    }
    Ok(())
}

/// Returns `false` when the write was dropped: a record past `PENDING`
/// whose earlier state and deployment are both gone was force-deleted
/// mid-run and must stay deleted.
fn write_invocation(txn: &WriteTransaction, invocation: &Invocation) -> StateResult<bool> {
    let key = invocation.invocation_id.to_string();
    let value = serde_json::to_vec(invocation).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(INVOCATIONS).map_err(map_err!(Table))?;
    let previous = match table.get(key.as_str()).map_err(map_err!(Read))? {
        Some(guard) => Some(decode::<Invocation>(guard.value())?),
        None => None,
    };
    match &previous {
        Some(previous) => check_transition(previous, invocation)?,
        None if invocation.state != InvocationState::Pending => {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let deployment_key = invocation.deployment_id.to_string();
            if deployments
                .get(deployment_key.as_str())
                .map_err(map_err!(Read))?
                .is_none()
            {
                warn!(
                    invocation_id = %invocation.invocation_id,
                    deployment_id = %invocation.deployment_id,
                    state = %invocation.state,
                    "deployment was deleted; invocation record not written"
                );
                return Ok(false);
            }
        }
        None => {}
    }
    table
        .insert(key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;

    if previous.is_none() {
        let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let index_key = format!("{}:{}", invocation.deployment_id, key);
        history
            .insert(index_key.as_str(), key.as_str())
            .map_err(map_err!(Write))?;
    }
    Ok(true)
}

fn write_deployment(txn: &WriteTransaction, deployment: &Deployment) -> StateResult<()> {
    let key = deployment.deployment_id.to_string();
    let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    table
        .insert(key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}
