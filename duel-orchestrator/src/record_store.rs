// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistent duel record store.
//!
//! One JSON document holds every duel record plus the numeric-id counter.
//! All mutations go through the write lock and are written through to disk
//! before the lock is released, which gives read-after-write consistency for
//! every caller in this process. Deadlines and monitoring windows live in the
//! records themselves, so the periodic sweeps can rebuild all scheduling
//! state after a restart.

use crate::error::{DuelError, DuelResult};
use crate::types::{Duel, DuelStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::info;

const STORE_VERSION: u32 = 1;

/// Numeric ids start above zero so an unset id can never be confused with a
/// real one in escrow calls.
const FIRST_NUMERIC_ID: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    next_numeric_id: u64,
    duels: HashMap<String, Duel>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            version: STORE_VERSION,
            next_numeric_id: FIRST_NUMERIC_ID,
            duels: HashMap::new(),
        }
    }
}

pub struct DuelRecordStore {
    state: RwLock<StoreState>,
    file_path: Option<PathBuf>,
}

impl DuelRecordStore {
    /// Open the store at `file_path`, loading existing records if the file
    /// is present.
    pub fn load(file_path: PathBuf) -> anyhow::Result<Self> {
        let state = if file_path.exists() {
            let contents = std::fs::read_to_string(&file_path)
                .map_err(|e| anyhow::anyhow!("Failed to read record store file: {}", e))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse record store file: {}", e))?;
            info!(
                "[RecordStore] 📂 Loaded {} duel records from {:?}",
                state.duels.len(),
                file_path
            );
            state
        } else {
            info!("[RecordStore] Starting with empty store at {:?}", file_path);
            StoreState::new()
        };

        Ok(Self {
            state: RwLock::new(state),
            file_path: Some(file_path),
        })
    }

    /// Store with no backing file. Used in tests.
    pub fn new_in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
            file_path: None,
        }
    }

    // Write-through persistence. Called while the write lock is held so a
    // reader can never observe unsaved state.
    fn persist(&self, state: &StoreState) -> DuelResult<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| DuelError::StorageError(format!("serialize: {}", e)))?;
        std::fs::write(path, contents)
            .map_err(|e| DuelError::StorageError(format!("write {:?}: {}", path, e)))?;
        Ok(())
    }

    pub async fn get(&self, duel_id: &str) -> Option<Duel> {
        self.state.read().await.duels.get(duel_id).cloned()
    }

    /// Insert a new duel record. Fails if the id is already taken.
    pub async fn insert(&self, duel: Duel) -> DuelResult<()> {
        let mut state = self.state.write().await;
        if state.duels.contains_key(&duel.id) {
            return Err(DuelError::StorageError(format!(
                "duel `{}` already exists",
                duel.id
            )));
        }
        state.duels.insert(duel.id.clone(), duel);
        self.persist(&state)
    }

    /// Apply a partial update to one duel and return the updated record
    /// together with the closure's result. The closure runs under the write
    /// lock, so the mutation and any decision derived from the pre-update
    /// state are atomic with respect to concurrent callers.
    pub async fn update_returning<R>(
        &self,
        duel_id: &str,
        f: impl FnOnce(&mut Duel) -> R,
    ) -> DuelResult<(Duel, R)> {
        let mut state = self.state.write().await;
        let duel = state
            .duels
            .get_mut(duel_id)
            .ok_or_else(|| DuelError::DuelNotFound(duel_id.to_string()))?;
        let result = f(duel);
        let updated = duel.clone();
        self.persist(&state)?;
        Ok((updated, result))
    }

    /// Apply a partial update and return the updated record.
    pub async fn update(
        &self,
        duel_id: &str,
        f: impl FnOnce(&mut Duel),
    ) -> DuelResult<Duel> {
        let (duel, ()) = self.update_returning(duel_id, f).await?;
        Ok(duel)
    }

    /// Compare-and-set status advance. Returns true when this caller
    /// performed the transition, false when the duel had already moved on.
    /// Illegal transitions are programming errors and reported as such.
    pub async fn transition_status(
        &self,
        duel_id: &str,
        from: DuelStatus,
        to: DuelStatus,
    ) -> DuelResult<bool> {
        if !from.can_transition_to(to) {
            return Err(DuelError::InternalError(format!(
                "illegal status transition {} -> {}",
                from, to
            )));
        }
        let (_, claimed) = self
            .update_returning(duel_id, |duel| {
                if duel.status == from {
                    duel.status = to;
                    true
                } else {
                    false
                }
            })
            .await?;
        Ok(claimed)
    }

    /// Return the duel's on-ledger numeric id, allocating it from the
    /// persisted counter on first use. Allocation and assignment happen under
    /// one write lock, so two racing stake calls cannot assign different ids.
    pub async fn ensure_numeric_id(&self, duel_id: &str) -> DuelResult<u64> {
        let mut state = self.state.write().await;
        match state.duels.get(duel_id) {
            Some(duel) => {
                if let Some(id) = duel.numeric_id {
                    return Ok(id);
                }
            }
            None => return Err(DuelError::DuelNotFound(duel_id.to_string())),
        }

        let mut candidate = state.next_numeric_id;
        // The counter alone is collision-free; the scan guards against a
        // store file that was restored from an older backup.
        while state.duels.values().any(|d| d.numeric_id == Some(candidate)) {
            candidate += 1;
        }
        state.next_numeric_id = candidate + 1;

        if let Some(duel) = state.duels.get_mut(duel_id) {
            duel.numeric_id = Some(candidate);
        }
        self.persist(&state)?;
        info!(
            "[RecordStore] Assigned numeric id {} to duel `{}`",
            candidate, duel_id
        );
        Ok(candidate)
    }

    /// All duels currently in `status`, ordered by id for deterministic
    /// sweeps.
    pub async fn list_status(&self, status: DuelStatus) -> Vec<Duel> {
        let state = self.state.read().await;
        let mut duels: Vec<Duel> = state
            .duels
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        duels.sort_by(|a, b| a.id.cmp(&b.id));
        duels
    }

    /// Duels holding at least one ledger-call record that is not Confirmed.
    pub async fn list_unresolved_ledger_calls(&self) -> Vec<Duel> {
        let state = self.state.read().await;
        let mut duels: Vec<Duel> = state
            .duels
            .values()
            .filter(|d| d.has_unresolved_ledger_calls())
            .cloned()
            .collect();
        duels.sort_by(|a, b| a.id.cmp(&b.id));
        duels
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.duels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
