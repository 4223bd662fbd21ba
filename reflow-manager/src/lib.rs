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

//! The lifecycle manager: a periodic driver that asks the policy engine
//! what to do and executes one copy or delete per acquired row lock
//! until a full pass produces no work. Operators invoke
//! [`Manager::process`] out-of-band (cron or similar); multiple
//! instances may run concurrently thanks to skip-locked acquisition.

use std::sync::Arc;

use reflow_catalog::catalog::{Catalog, CatalogGuard};
use reflow_catalog::models::{LocationStatus, StorageLocationRow};
use reflow_catalog::policy::{self, SettingsMap};
use reflow_config::ConnectorsConfig;
use reflow_error::{make_err, Code, Error, ResultExt};
use reflow_store::registry::ConnectorRegistry;
use reflow_store::transfer::Transfer;
use reflow_util::clock::Clock;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SweepKind {
    Copy,
    Delete,
}

pub struct Manager {
    registry: Arc<ConnectorRegistry>,
    settings: SettingsMap,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
}

impl Manager {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        settings: SettingsMap,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Manager {
            registry,
            settings,
            catalog,
            clock,
        }
    }

    pub fn from_config(
        config: &ConnectorsConfig,
        registry: Arc<ConnectorRegistry>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            registry,
            policy::settings_from_config(config),
            catalog,
            clock,
        )
    }

    /// One full sweep: copies first, then deletions.
    pub async fn process(&self) -> Result<(), Error> {
        self.process_copy().await?;
        self.process_delete().await
    }

    pub async fn process_copy(&self) -> Result<(), Error> {
        self.sweep(SweepKind::Copy).await
    }

    pub async fn process_delete(&self) -> Result<(), Error> {
        self.sweep(SweepKind::Delete).await
    }

    /// Backend names in priority order (hottest first), name as
    /// tie-break for reproducible sweeps.
    fn backends_by_priority(&self) -> Vec<String> {
        let mut names: Vec<_> = self.settings.iter().collect();
        names.sort_by(|(a_name, a), (b_name, b)| {
            a.priority.cmp(&b.priority).then_with(|| a_name.cmp(b_name))
        });
        names.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Executes at most one operation per backend per pass and loops
    /// until an entire pass yields no acquirable candidate. Failures are
    /// localized to their file storage and never abort the sweep; a
    /// failed (storage, backend) pair is not re-attempted until the next
    /// sweep so a persistent failure cannot stall the loop.
    async fn sweep(&self, kind: SweepKind) -> Result<(), Error> {
        let mut failed: std::collections::HashSet<(i64, String)> = std::collections::HashSet::new();
        loop {
            let mut processed = false;
            for backend in self.backends_by_priority() {
                let inventory = self.catalog.snapshot().await?;
                let now = self.clock.now();
                let candidates = match kind {
                    SweepKind::Copy => policy::to_copy(&inventory, &self.settings, &backend, now),
                    SweepKind::Delete => {
                        policy::to_delete(&inventory, &self.settings, &backend, now)
                    }
                };
                for candidate in candidates {
                    if failed.contains(&(candidate.0, backend.clone())) {
                        continue;
                    }
                    let Some(guard) = self.catalog.try_lock(candidate).await? else {
                        // Held by another worker; pass over silently.
                        continue;
                    };
                    let result = match kind {
                        SweepKind::Copy => self.copy_single_location(guard, &backend).await,
                        SweepKind::Delete => self.delete_single_location(guard, &backend).await,
                    };
                    if let Err(err) = result {
                        warn!(
                            file_storage = candidate.0,
                            backend = backend.as_str(),
                            ?kind,
                            ?err,
                            "Lifecycle operation failed; file storage stays a candidate for the next sweep"
                        );
                        failed.insert((candidate.0, backend.clone()));
                    }
                    processed = true;
                    break;
                }
            }
            if !processed {
                return Ok(());
            }
        }
    }

    /// Creates the replica of the locked file storage on `backend` by
    /// streaming from the cheapest-to-read completed replica. The source
    /// read is recorded in the access log for the whole duration.
    async fn copy_single_location(
        &self,
        mut guard: Box<dyn CatalogGuard>,
        backend: &str,
    ) -> Result<(), Error> {
        let file_storage_id = guard.file_storage_id();
        let locations = guard.locations().await?;
        let source = self
            .pick_source(&locations, backend)
            .ok_or_else(|| {
                make_err!(
                    Code::FailedPrecondition,
                    "No completed source replica for {file_storage_id}"
                )
            })?
            .clone();

        let source_connector = self.registry.get(&source.connector_name)?;
        let dest_connector = self.registry.get(backend)?;
        let paths = guard.referenced_paths(source.id).await?;
        let new_location = guard
            .create_location(backend, &source.url, LocationStatus::Uploading)
            .await?;
        let access_log = self.catalog.open_access_log(source.id).await?;

        let object_names: Vec<String> = paths.iter().map(|path| path.path.clone()).collect();
        let transfer = Transfer::new(source_connector, dest_connector);
        // The access log must be closed and the guard committed on every
        // path, so the bookkeeping errors stay inside this block.
        let outcome: Result<(), Error> = async {
            match transfer
                .transfer_objects(&source.url, Some(object_names))
                .await
            {
                Ok(_) => {
                    guard.attach_paths(new_location, &paths).await?;
                    guard
                        .set_location_status(new_location, LocationStatus::Done)
                        .await?;
                    info!(
                        file_storage = file_storage_id.0,
                        from = source.connector_name.as_str(),
                        to = backend,
                        url = source.url.as_str(),
                        "Created replica"
                    );
                    Ok(())
                }
                Err(err) => {
                    if err.code == Code::NotFound {
                        // The source data is gone; flag the stale record
                        // so a later sweep can clean it up.
                        guard
                            .set_location_status(source.id, LocationStatus::Deleting)
                            .await?;
                    }
                    guard.delete_location(new_location).await?;
                    Err(err).err_tip(|| {
                        format!(
                            "Failed to copy {file_storage_id} from {} to {backend}",
                            source.connector_name
                        )
                    })
                }
            }
        }
        .await;

        let close_result = self.catalog.close_access_log(access_log).await;
        let commit_result = guard.commit().await;
        outcome.merge(close_result).merge(commit_result)
    }

    /// Removes the replica of the locked file storage on `backend`. The
    /// deletion invariants are re-checked under the lock so a concurrent
    /// sweep cannot drop the copy count below the configured minimum.
    async fn delete_single_location(
        &self,
        mut guard: Box<dyn CatalogGuard>,
        backend: &str,
    ) -> Result<(), Error> {
        let file_storage_id = guard.file_storage_id();
        let locations = guard.locations().await?;
        let Some(location) = locations
            .iter()
            .find(|location| location.connector_name == backend)
            .cloned()
        else {
            return Ok(());
        };

        let backend_settings = self
            .settings
            .get(backend)
            .ok_or_else(|| make_err!(Code::InvalidArgument, "Unknown backend {backend}"))?;
        let inventory = self.catalog.snapshot().await?;
        let still_allowed = inventory.get(file_storage_id).is_some_and(|fs| {
            policy::deletion_allowed(fs, &self.settings, backend, backend_settings, self.clock.now())
        });
        if !still_allowed {
            debug!(
                file_storage = file_storage_id.0,
                backend, "Deletion no longer permitted under lock; skipping"
            );
            return guard.commit().await;
        }

        guard
            .set_location_status(location.id, LocationStatus::Deleting)
            .await?;
        let connector = self.registry.get(backend)?;
        match connector.delete(&location.url).await {
            Ok(()) => {
                guard.delete_location(location.id).await?;
                info!(
                    file_storage = file_storage_id.0,
                    backend,
                    url = location.url.as_str(),
                    "Deleted replica"
                );
            }
            Err(err) => {
                // The tombstone status is committed so the failure is
                // visible and retryable later.
                warn!(
                    file_storage = file_storage_id.0,
                    backend,
                    ?err,
                    "Backend delete failed; leaving replica in deleting state"
                );
            }
        }
        guard.commit().await
    }

    /// The cheapest-to-read completed replica: lowest backend priority,
    /// location id as tie-break.
    fn pick_source<'a>(
        &self,
        locations: &'a [StorageLocationRow],
        exclude_backend: &str,
    ) -> Option<&'a StorageLocationRow> {
        locations
            .iter()
            .filter(|location| {
                location.status == LocationStatus::Done
                    && location.connector_name != exclude_backend
                    && self.settings.contains_key(&location.connector_name)
            })
            .min_by_key(|location| {
                (
                    self.settings
                        .get(&location.connector_name)
                        .map(|s| s.priority)
                        .unwrap_or(i32::MAX),
                    location.id,
                )
            })
    }
}

/// Convenience for tests and embedders that already resolved settings.
pub use reflow_catalog::policy::settings_from_config;
