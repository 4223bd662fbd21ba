// Copyright 2024 The Reflow Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reflow_error::{make_err, Code, Error};
use reflow_util::clock::Clock;

use crate::catalog::{Catalog, CatalogGuard};
use crate::models::{
    AccessLogId, AccessLogRow, FileStorageId, FileStorageMeta, FileStorageState, Inventory,
    LocationId, LocationStatus, ReferencedPathRow, ReplicaState, StorageLocationRow,
};

#[derive(Default)]
struct State {
    next_id: i64,
    file_storages: BTreeMap<i64, FileStorageMeta>,
    locations: BTreeMap<i64, StorageLocationRow>,
    paths: BTreeMap<i64, ReferencedPathRow>,
    location_paths: BTreeSet<(i64, i64)>,
    access_logs: BTreeMap<i64, AccessLogRow>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process catalog with the same lock semantics as the relational
/// implementation: non-blocking per-file-storage acquisition, silently
/// skipped when held. Guard mutations are applied eagerly; `commit`
/// only releases the lock. This is the fixture for manager tests.
pub struct MemoryCatalog {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
    locked: Arc<Mutex<BTreeSet<i64>>>,
}

impl MemoryCatalog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryCatalog {
            clock,
            state: Arc::new(Mutex::new(State::default())),
            locked: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn create_file_storage(
        &self,
        created: DateTime<Utc>,
        data_slug: Option<&str>,
        process_type: Option<&str>,
    ) -> FileStorageId {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.file_storages.insert(
            id,
            FileStorageMeta {
                id: FileStorageId(id),
                created,
                data_slug: data_slug.map(str::to_string),
                process_type: process_type.map(str::to_string),
            },
        );
        FileStorageId(id)
    }

    pub fn create_location(
        &self,
        file_storage_id: FileStorageId,
        connector_name: &str,
        url: &str,
        status: LocationStatus,
    ) -> Result<LocationId, Error> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.locations.values().any(|location| {
            location.file_storage_id == file_storage_id
                && location.connector_name == connector_name
        }) {
            return Err(make_err!(
                Code::AlreadyExists,
                "Replica of {file_storage_id} on {connector_name} already exists"
            ));
        }
        let id = state.next_id();
        state.locations.insert(
            id,
            StorageLocationRow {
                id: LocationId(id),
                file_storage_id,
                connector_name: connector_name.to_string(),
                url: url.to_string(),
                status,
                last_update: now,
            },
        );
        Ok(LocationId(id))
    }

    pub fn set_last_update(&self, location_id: LocationId, last_update: DateTime<Utc>) {
        if let Some(location) = self.state.lock().locations.get_mut(&location_id.0) {
            location.last_update = last_update;
        }
    }

    /// Creates a referenced path and attaches it to a replica.
    pub fn add_path(&self, location_id: LocationId, path: &str, size: Option<i64>) -> i64 {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.paths.insert(
            id,
            ReferencedPathRow {
                id,
                path: path.to_string(),
                size,
                ..Default::default()
            },
        );
        state.location_paths.insert((location_id.0, id));
        id
    }

    pub fn locations_for(&self, file_storage_id: FileStorageId) -> Vec<StorageLocationRow> {
        self.state
            .lock()
            .locations
            .values()
            .filter(|location| location.file_storage_id == file_storage_id)
            .cloned()
            .collect()
    }

    pub fn access_logs(&self) -> Vec<AccessLogRow> {
        self.state.lock().access_logs.values().cloned().collect()
    }

    pub fn referenced_path_count(&self) -> usize {
        self.state.lock().paths.len()
    }

    pub fn is_locked(&self, id: FileStorageId) -> bool {
        self.locked.lock().contains(&id.0)
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn snapshot(&self) -> Result<Inventory, Error> {
        let state = self.state.lock();
        let file_storages = state
            .file_storages
            .values()
            .map(|meta| FileStorageState {
                meta: meta.clone(),
                replicas: state
                    .locations
                    .values()
                    .filter(|location| location.file_storage_id == meta.id)
                    .map(|location| ReplicaState {
                        location_id: location.id,
                        connector_name: location.connector_name.clone(),
                        status: location.status,
                        last_update: location.last_update,
                        in_use: state.access_logs.values().any(|log| {
                            log.location_id == location.id && log.finished.is_none()
                        }),
                    })
                    .collect(),
            })
            .collect();
        Ok(Inventory { file_storages })
    }

    async fn try_lock(&self, id: FileStorageId) -> Result<Option<Box<dyn CatalogGuard>>, Error> {
        if !self.state.lock().file_storages.contains_key(&id.0) {
            return Ok(None);
        }
        {
            let mut locked = self.locked.lock();
            if !locked.insert(id.0) {
                return Ok(None);
            }
        }
        Ok(Some(Box::new(MemoryGuard {
            id,
            clock: self.clock.clone(),
            state: self.state.clone(),
            locked: self.locked.clone(),
        })))
    }

    async fn open_access_log(&self, location_id: LocationId) -> Result<AccessLogId, Error> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.locations.contains_key(&location_id.0) {
            return Err(make_err!(Code::NotFound, "Location {location_id} not found"));
        }
        let id = state.next_id();
        state.access_logs.insert(
            id,
            AccessLogRow {
                id: AccessLogId(id),
                location_id,
                started: now,
                finished: None,
            },
        );
        Ok(AccessLogId(id))
    }

    async fn close_access_log(&self, id: AccessLogId) -> Result<(), Error> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let log = state
            .access_logs
            .get_mut(&id.0)
            .ok_or_else(|| make_err!(Code::NotFound, "Access log {} not found", id.0))?;
        log.finished = Some(now);
        Ok(())
    }
}

struct MemoryGuard {
    id: FileStorageId,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
    locked: Arc<Mutex<BTreeSet<i64>>>,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.locked.lock().remove(&self.id.0);
    }
}

#[async_trait]
impl CatalogGuard for MemoryGuard {
    fn file_storage_id(&self) -> FileStorageId {
        self.id
    }

    async fn locations(&mut self) -> Result<Vec<StorageLocationRow>, Error> {
        Ok(self
            .state
            .lock()
            .locations
            .values()
            .filter(|location| location.file_storage_id == self.id)
            .cloned()
            .collect())
    }

    async fn referenced_paths(
        &mut self,
        location_id: LocationId,
    ) -> Result<Vec<ReferencedPathRow>, Error> {
        let state = self.state.lock();
        Ok(state
            .location_paths
            .iter()
            .filter(|(loc, _)| *loc == location_id.0)
            .filter_map(|(_, path_id)| state.paths.get(path_id).cloned())
            .collect())
    }

    async fn create_location(
        &mut self,
        connector_name: &str,
        url: &str,
        status: LocationStatus,
    ) -> Result<LocationId, Error> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.locations.values().any(|location| {
            location.file_storage_id == self.id && location.connector_name == connector_name
        }) {
            return Err(make_err!(
                Code::AlreadyExists,
                "Replica of {} on {connector_name} already exists",
                self.id
            ));
        }
        let id = state.next_id();
        state.locations.insert(
            id,
            StorageLocationRow {
                id: LocationId(id),
                file_storage_id: self.id,
                connector_name: connector_name.to_string(),
                url: url.to_string(),
                status,
                last_update: now,
            },
        );
        Ok(LocationId(id))
    }

    async fn set_location_status(
        &mut self,
        location_id: LocationId,
        status: LocationStatus,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let location = state
            .locations
            .get_mut(&location_id.0)
            .ok_or_else(|| make_err!(Code::NotFound, "Location {location_id} not found"))?;
        location.status = status;
        location.last_update = now;
        Ok(())
    }

    async fn attach_paths(
        &mut self,
        location_id: LocationId,
        paths: &[ReferencedPathRow],
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        for path in paths {
            state.paths.entry(path.id).or_insert_with(|| path.clone());
            state.location_paths.insert((location_id.0, path.id));
        }
        Ok(())
    }

    async fn delete_location(&mut self, location_id: LocationId) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.locations.remove(&location_id.0);
        state
            .location_paths
            .retain(|(loc, _)| *loc != location_id.0);
        let still_referenced: BTreeSet<i64> =
            state.location_paths.iter().map(|(_, path)| *path).collect();
        state.paths.retain(|id, _| still_referenced.contains(id));
        state
            .access_logs
            .retain(|_, log| log.location_id != location_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        // Mutations were applied eagerly; dropping releases the lock.
        Ok(())
    }
}
