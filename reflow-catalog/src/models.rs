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

use chrono::{DateTime, Utc};
use reflow_error::{make_err, Code, Error};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileStorageId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessLogId(pub i64);

impl std::fmt::Display for FileStorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for LocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica lifecycle. Transitions are monotonic in their intended
/// direction: Uploading -> Done and Done -> Deleting. Only Done replicas
/// are visible to policy queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationStatus {
    Uploading,
    Done,
    Deleting,
}

impl LocationStatus {
    pub fn as_code(&self) -> &'static str {
        match self {
            LocationStatus::Uploading => "UP",
            LocationStatus::Done => "OK",
            LocationStatus::Deleting => "DE",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, Error> {
        match code {
            "UP" => Ok(LocationStatus::Uploading),
            "OK" => Ok(LocationStatus::Done),
            "DE" => Ok(LocationStatus::Deleting),
            other => Err(make_err!(Code::Internal, "Unknown location status {other}")),
        }
    }
}

/// One logical file set, as produced by the dataflow engine. The slug
/// and process type come from the producing data object and drive
/// per-override rule resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStorageMeta {
    pub id: FileStorageId,
    pub created: DateTime<Utc>,
    pub data_slug: Option<String>,
    pub process_type: Option<String>,
}

/// One replica of one file storage on one backend.
/// `(file_storage_id, connector_name)` is unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageLocationRow {
    pub id: LocationId,
    pub file_storage_id: FileStorageId,
    pub connector_name: String,
    pub url: String,
    pub status: LocationStatus,
    pub last_update: DateTime<Utc>,
}

/// A relative path inside a file storage, shared between replicas and
/// (when deduplicated) between file storages.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ReferencedPathRow {
    pub id: i64,
    pub path: String,
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub crc32c: Option<String>,
    pub awss3etag: Option<String>,
}

/// Audit record of a replica being read as a transfer source. A replica
/// is in use while any of its access logs has no finish time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessLogRow {
    pub id: AccessLogId,
    pub location_id: LocationId,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

/// Replica state projected into the policy snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaState {
    pub location_id: LocationId,
    pub connector_name: String,
    pub status: LocationStatus,
    pub last_update: DateTime<Utc>,
    /// True while an open access log references this replica.
    pub in_use: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStorageState {
    pub meta: FileStorageMeta,
    pub replicas: Vec<ReplicaState>,
}

/// Point-in-time replica inventory, the sole input of the policy engine.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    pub file_storages: Vec<FileStorageState>,
}

impl Inventory {
    pub fn get(&self, id: FileStorageId) -> Option<&FileStorageState> {
        self.file_storages.iter().find(|fs| fs.meta.id == id)
    }
}
