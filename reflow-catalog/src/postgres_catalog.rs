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

use std::sync::Arc;

use async_trait::async_trait;
use reflow_error::{make_err, Code, Error, ResultExt};
use reflow_util::clock::Clock;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::catalog::{Catalog, CatalogGuard};
use crate::models::{
    AccessLogId, FileStorageId, FileStorageMeta, FileStorageState, Inventory, LocationId,
    LocationStatus, ReferencedPathRow, ReplicaState, StorageLocationRow,
};

/// Catalog backed by Postgres. Candidate rows are acquired with
/// `FOR UPDATE SKIP LOCKED` so concurrent manager instances pass over
/// each other's file storages without blocking. The schema lives in
/// `schema.sql` next to this crate.
pub struct PostgresCatalog {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        PostgresCatalog { pool, clock }
    }

    pub async fn connect(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "Failed to connect to catalog: {e}"))?;
        Ok(Self::new(pool, clock))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_db_err(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => make_err!(Code::NotFound, "Catalog row not found"),
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            make_err!(Code::AlreadyExists, "Catalog uniqueness violation: {db_err}")
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            make_err!(Code::Unavailable, "Catalog unavailable: {err}")
        }
        _ => make_err!(Code::Internal, "Catalog query failed: {err}"),
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn snapshot(&self) -> Result<Inventory, Error> {
        let storage_rows = sqlx::query(
            "SELECT id, created, data_slug, process_type \
             FROM file_storage ORDER BY created, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to load file storages")?;

        let location_rows = sqlx::query(
            "SELECT sl.id, sl.file_storage_id, sl.connector_name, sl.url, sl.status, \
                    sl.last_update, \
                    EXISTS(SELECT 1 FROM access_log al \
                           WHERE al.storage_location_id = sl.id AND al.finished IS NULL) AS in_use \
             FROM storage_location sl",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to load storage locations")?;

        let mut file_storages = Vec::with_capacity(storage_rows.len());
        for row in storage_rows {
            let id: i64 = row.try_get("id").map_err(map_db_err)?;
            file_storages.push(FileStorageState {
                meta: FileStorageMeta {
                    id: FileStorageId(id),
                    created: row.try_get("created").map_err(map_db_err)?,
                    data_slug: row.try_get("data_slug").map_err(map_db_err)?,
                    process_type: row.try_get("process_type").map_err(map_db_err)?,
                },
                replicas: Vec::new(),
            });
        }
        for row in location_rows {
            let file_storage_id: i64 = row.try_get("file_storage_id").map_err(map_db_err)?;
            let status: String = row.try_get("status").map_err(map_db_err)?;
            let replica = ReplicaState {
                location_id: LocationId(row.try_get("id").map_err(map_db_err)?),
                connector_name: row.try_get("connector_name").map_err(map_db_err)?,
                status: LocationStatus::from_code(&status)?,
                last_update: row.try_get("last_update").map_err(map_db_err)?,
                in_use: row.try_get("in_use").map_err(map_db_err)?,
            };
            if let Some(fs) = file_storages
                .iter_mut()
                .find(|fs| fs.meta.id.0 == file_storage_id)
            {
                fs.replicas.push(replica);
            }
        }
        Ok(Inventory { file_storages })
    }

    async fn try_lock(&self, id: FileStorageId) -> Result<Option<Box<dyn CatalogGuard>>, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to open locking transaction")?;
        let row = sqlx::query("SELECT id FROM file_storage WHERE id = $1 FOR UPDATE SKIP LOCKED")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to acquire row lock")?;
        if row.is_none() {
            // Locked by another worker (or gone); skip silently.
            let _ = tx.rollback().await;
            return Ok(None);
        }
        Ok(Some(Box::new(PostgresGuard {
            id,
            clock: self.clock.clone(),
            tx: Some(tx),
        })))
    }

    async fn open_access_log(&self, location_id: LocationId) -> Result<AccessLogId, Error> {
        let row = sqlx::query(
            "INSERT INTO access_log (storage_location_id, started) VALUES ($1, $2) RETURNING id",
        )
        .bind(location_id.0)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to open access log")?;
        Ok(AccessLogId(row.try_get("id").map_err(map_db_err)?))
    }

    async fn close_access_log(&self, id: AccessLogId) -> Result<(), Error> {
        sqlx::query("UPDATE access_log SET finished = $2 WHERE id = $1")
            .bind(id.0)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to close access log")?;
        Ok(())
    }
}

struct PostgresGuard {
    id: FileStorageId,
    clock: Arc<dyn Clock>,
    /// Present until commit; dropping the transaction rolls back and
    /// releases the row lock.
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresGuard {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, Error> {
        self.tx
            .as_mut()
            .ok_or_else(|| make_err!(Code::Internal, "Guard transaction already consumed"))
    }
}

#[async_trait]
impl CatalogGuard for PostgresGuard {
    fn file_storage_id(&self) -> FileStorageId {
        self.id
    }

    async fn locations(&mut self) -> Result<Vec<StorageLocationRow>, Error> {
        let id = self.id;
        let tx = self.tx()?;
        let rows = sqlx::query(
            "SELECT id, file_storage_id, connector_name, url, status, last_update \
             FROM storage_location WHERE file_storage_id = $1 ORDER BY id",
        )
        .bind(id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to load locations under lock")?;
        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(map_db_err)?;
                Ok(StorageLocationRow {
                    id: LocationId(row.try_get("id").map_err(map_db_err)?),
                    file_storage_id: FileStorageId(
                        row.try_get("file_storage_id").map_err(map_db_err)?,
                    ),
                    connector_name: row.try_get("connector_name").map_err(map_db_err)?,
                    url: row.try_get("url").map_err(map_db_err)?,
                    status: LocationStatus::from_code(&status)?,
                    last_update: row.try_get("last_update").map_err(map_db_err)?,
                })
            })
            .collect()
    }

    async fn referenced_paths(
        &mut self,
        location_id: LocationId,
    ) -> Result<Vec<ReferencedPathRow>, Error> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            "SELECT rp.id, rp.path, rp.size, rp.md5, rp.crc32c, rp.awss3etag \
             FROM referenced_path rp \
             JOIN storage_location_paths slp ON slp.path_id = rp.id \
             WHERE slp.storage_location_id = $1 ORDER BY rp.id",
        )
        .bind(location_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to load referenced paths")?;
        rows.into_iter()
            .map(|row| {
                Ok(ReferencedPathRow {
                    id: row.try_get("id").map_err(map_db_err)?,
                    path: row.try_get("path").map_err(map_db_err)?,
                    size: row.try_get("size").map_err(map_db_err)?,
                    md5: row.try_get("md5").map_err(map_db_err)?,
                    crc32c: row.try_get("crc32c").map_err(map_db_err)?,
                    awss3etag: row.try_get("awss3etag").map_err(map_db_err)?,
                })
            })
            .collect()
    }

    async fn create_location(
        &mut self,
        connector_name: &str,
        url: &str,
        status: LocationStatus,
    ) -> Result<LocationId, Error> {
        let id = self.id;
        let now = self.clock.now();
        let tx = self.tx()?;
        let row = sqlx::query(
            "INSERT INTO storage_location \
             (file_storage_id, connector_name, url, status, last_update) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(id.0)
        .bind(connector_name)
        .bind(url)
        .bind(status.as_code())
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_db_err)
        .err_tip(|| format!("Failed to create location on {connector_name}"))?;
        Ok(LocationId(row.try_get("id").map_err(map_db_err)?))
    }

    async fn set_location_status(
        &mut self,
        location_id: LocationId,
        status: LocationStatus,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let tx = self.tx()?;
        let result = sqlx::query(
            "UPDATE storage_location SET status = $2, last_update = $3 WHERE id = $1",
        )
        .bind(location_id.0)
        .bind(status.as_code())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to update location status")?;
        if result.rows_affected() == 0 {
            return Err(make_err!(Code::NotFound, "Location {location_id} not found"));
        }
        Ok(())
    }

    async fn attach_paths(
        &mut self,
        location_id: LocationId,
        paths: &[ReferencedPathRow],
    ) -> Result<(), Error> {
        let tx = self.tx()?;
        for path in paths {
            sqlx::query(
                "INSERT INTO storage_location_paths (storage_location_id, path_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(location_id.0)
            .bind(path.id)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to attach referenced path")?;
        }
        Ok(())
    }

    async fn delete_location(&mut self, location_id: LocationId) -> Result<(), Error> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM storage_location_paths WHERE storage_location_id = $1")
            .bind(location_id.0)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to detach referenced paths")?;
        // Garbage collect paths that no replica references anymore.
        sqlx::query(
            "DELETE FROM referenced_path rp WHERE NOT EXISTS \
             (SELECT 1 FROM storage_location_paths slp WHERE slp.path_id = rp.id)",
        )
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)
        .err_tip(|| "Failed to garbage collect referenced paths")?;
        sqlx::query("DELETE FROM storage_location WHERE id = $1")
            .bind(location_id.0)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to delete location")?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), Error> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| make_err!(Code::Internal, "Guard transaction already consumed"))?;
        tx.commit()
            .await
            .map_err(map_db_err)
            .err_tip(|| "Failed to commit catalog transaction")
    }
}
