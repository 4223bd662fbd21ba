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

use async_trait::async_trait;
use reflow_error::Error;

use crate::models::{
    AccessLogId, FileStorageId, Inventory, LocationId, LocationStatus, ReferencedPathRow,
    StorageLocationRow,
};

/// The replica catalog as seen by the lifecycle manager. Implementations
/// are the transactional relational store and the in-memory fixture;
/// both provide skip-locked row acquisition per file storage.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Point-in-time inventory for the policy engine.
    async fn snapshot(&self) -> Result<Inventory, Error>;

    /// Tries to acquire the exclusive per-file-storage row lock without
    /// blocking. `None` means another worker holds it; callers skip the
    /// candidate silently.
    async fn try_lock(&self, id: FileStorageId) -> Result<Option<Box<dyn CatalogGuard>>, Error>;

    /// Records the start of a read of `location_id` as a transfer source.
    /// Runs in its own transaction, independent of any held row lock.
    async fn open_access_log(&self, location_id: LocationId) -> Result<AccessLogId, Error>;

    /// Marks an access log finished. Independent transaction.
    async fn close_access_log(&self, id: AccessLogId) -> Result<(), Error>;
}

/// Catalog operations available while the per-file-storage row lock is
/// held. Dropping a guard releases the lock; the relational
/// implementation additionally rolls back uncommitted mutations.
#[async_trait]
pub trait CatalogGuard: Send {
    fn file_storage_id(&self) -> FileStorageId;

    /// Current replicas of the locked file storage, read under the lock.
    async fn locations(&mut self) -> Result<Vec<StorageLocationRow>, Error>;

    /// Referenced paths attached to one replica.
    async fn referenced_paths(
        &mut self,
        location_id: LocationId,
    ) -> Result<Vec<ReferencedPathRow>, Error>;

    /// Creates a replica record. Fails with `Code::AlreadyExists` when
    /// the (file storage, backend) pair is already present.
    async fn create_location(
        &mut self,
        connector_name: &str,
        url: &str,
        status: LocationStatus,
    ) -> Result<LocationId, Error>;

    async fn set_location_status(
        &mut self,
        location_id: LocationId,
        status: LocationStatus,
    ) -> Result<(), Error>;

    /// Associates existing referenced paths with a replica.
    async fn attach_paths(
        &mut self,
        location_id: LocationId,
        paths: &[ReferencedPathRow],
    ) -> Result<(), Error>;

    /// Removes a replica record, detaching its paths and garbage
    /// collecting referenced paths that no replica holds anymore.
    async fn delete_location(&mut self, location_id: LocationId) -> Result<(), Error>;

    async fn commit(self: Box<Self>) -> Result<(), Error>;
}
