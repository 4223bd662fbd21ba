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

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reflow_catalog::memory_catalog::MemoryCatalog;
use reflow_catalog::models::{FileStorageId, LocationId, LocationStatus};
use reflow_catalog::policy::{BackendSettings, SettingsMap};
use reflow_catalog::Catalog;
use reflow_config::RuleConfig;
use reflow_error::{make_err, Code, Error};
use reflow_manager::Manager;
use reflow_store::memory_connector::MemoryConnector;
use reflow_store::registry::ConnectorRegistry;
use reflow_util::clock::MockClock;

fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
}

fn days_ago(days: i64) -> DateTime<Utc> {
    test_now() - Duration::days(days)
}

fn rule(delay: i64) -> RuleConfig {
    RuleConfig {
        delay: Some(delay),
        ..Default::default()
    }
}

struct Fixture {
    clock: Arc<MockClock>,
    catalog: Arc<MemoryCatalog>,
    local: Arc<MemoryConnector>,
    s3: Arc<MemoryConnector>,
    gcs: Arc<MemoryConnector>,
    manager: Manager,
}

/// Three-backend setup mirroring the reference configuration: hot local
/// storage plus two archive tiers with age rules.
fn make_fixture() -> Fixture {
    let clock = Arc::new(MockClock::new(test_now()));
    let catalog = Arc::new(MemoryCatalog::new(clock.clone()));

    let local = Arc::new(MemoryConnector::new("local", 1));
    let s3 = Arc::new(MemoryConnector::new("S3", 100));
    let gcs = Arc::new(MemoryConnector::new("GCS", 200));
    let mut registry = ConnectorRegistry::new();
    registry.insert(local.clone());
    registry.insert(s3.clone());
    registry.insert(gcs.clone());
    let registry = Arc::new(registry);

    let mut settings: SettingsMap = BTreeMap::new();
    settings.insert(
        "local".to_string(),
        BackendSettings { priority: 1, copy: RuleConfig::default(), delete: RuleConfig::default() },
    );
    settings.insert(
        "S3".to_string(),
        BackendSettings { priority: 100, copy: rule(2), delete: rule(5) },
    );
    settings.insert(
        "GCS".to_string(),
        BackendSettings { priority: 200, copy: rule(3), delete: rule(5) },
    );

    let manager = Manager::new(registry, settings, catalog.clone(), clock.clone());
    Fixture { clock, catalog, local, s3, gcs, manager }
}

/// Creates a file storage with one completed replica on `local` holding
/// `testme.txt`.
fn seed_local_storage(fixture: &Fixture, created_days_ago: i64, url: &str) -> (FileStorageId, LocationId) {
    let fs = fixture
        .catalog
        .create_file_storage(days_ago(created_days_ago), None, None);
    let location = fixture
        .catalog
        .create_location(fs, "local", url, LocationStatus::Done)
        .unwrap();
    fixture.catalog.add_path(location, "testme.txt", Some(9));
    fixture
        .local
        .put_object(&format!("{url}/testme.txt"), Bytes::from_static(b"test data"));
    (fs, location)
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn copy_after_delay_elapses() -> Result<(), Error> {
        let fixture = make_fixture();
        let (fs, local_location) = seed_local_storage(&fixture, 2, "url1");

        fixture.manager.process().await?;

        let locations = fixture.catalog.locations_for(fs);
        assert_eq!(locations.len(), 2);
        let s3_location = locations
            .iter()
            .find(|l| l.connector_name == "S3")
            .expect("expected a new S3 replica");
        assert_eq!(s3_location.status, LocationStatus::Done);
        assert_eq!(s3_location.url, "url1");
        assert_eq!(fixture.s3.has_object("url1/testme.txt"), true);
        // GCS's three day delay has not elapsed yet.
        assert_eq!(locations.iter().any(|l| l.connector_name == "GCS"), false);

        let logs = fixture.catalog.access_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].location_id, local_location);
        assert_eq!(logs[0].finished.is_some(), true);
        Ok(())
    }

    #[tokio::test]
    async fn no_copy_before_delay() -> Result<(), Error> {
        let fixture = make_fixture();
        let (fs, _) = seed_local_storage(&fixture, 1, "url1");

        fixture.manager.process().await?;

        assert_eq!(fixture.catalog.locations_for(fs).len(), 1);
        assert_eq!(fixture.s3.object_count(), 0);
        assert_eq!(fixture.catalog.access_logs().len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_reaches_fixpoint_across_storages_and_backends() -> Result<(), Error> {
        let fixture = make_fixture();
        let (fs1, _) = seed_local_storage(&fixture, 4, "url1");
        let (fs2, _) = seed_local_storage(&fixture, 4, "url2");

        fixture.manager.process().await?;

        // Both storages gained replicas on both archive tiers in a single
        // process() call.
        for fs in [fs1, fs2] {
            let locations = fixture.catalog.locations_for(fs);
            assert_eq!(locations.len(), 3);
            assert_eq!(
                locations.iter().all(|l| l.status == LocationStatus::Done),
                true
            );
        }
        assert_eq!(fixture.s3.has_object("url1/testme.txt"), true);
        assert_eq!(fixture.s3.has_object("url2/testme.txt"), true);
        assert_eq!(fixture.gcs.has_object("url1/testme.txt"), true);
        assert_eq!(fixture.gcs.has_object("url2/testme.txt"), true);

        // A second sweep finds nothing to do.
        let log_count = fixture.catalog.access_logs().len();
        fixture.manager.process().await?;
        assert_eq!(fixture.catalog.access_logs().len(), log_count);
        Ok(())
    }

    #[tokio::test]
    async fn skip_locked_candidates_are_passed_over() -> Result<(), Error> {
        let fixture = make_fixture();
        let (fs1, _) = seed_local_storage(&fixture, 2, "url1");
        let (fs2, _) = seed_local_storage(&fixture, 2, "url2");

        let _guard1 = fixture.catalog.try_lock(fs1).await?.unwrap();
        let _guard2 = fixture.catalog.try_lock(fs2).await?.unwrap();

        // Every candidate row is held elsewhere: the sweep terminates
        // without performing a single operation.
        fixture.manager.process().await?;
        assert_eq!(fixture.catalog.locations_for(fs1).len(), 1);
        assert_eq!(fixture.catalog.locations_for(fs2).len(), 1);
        assert_eq!(fixture.catalog.access_logs().len(), 0);
        assert_eq!(fixture.s3.object_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_transfer_removes_placeholder_and_closes_access_log() -> Result<(), Error> {
        let fixture = make_fixture();
        let (fs, _) = seed_local_storage(&fixture, 2, "url1");
        // One permanent failure per archive backend; the copy fails
        // without leaving a replica record behind.
        fixture
            .s3
            .inject_push_failures(vec![make_err!(Code::Internal, "Corrupt request")]);

        fixture.manager.process().await?;

        let locations = fixture.catalog.locations_for(fs);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].connector_name, "local");
        assert_eq!(locations[0].status, LocationStatus::Done);
        let logs = fixture.catalog.access_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].finished.is_some(), true);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_source_is_marked_deleting() -> Result<(), Error> {
        let fixture = make_fixture();
        let fs = fixture.catalog.create_file_storage(days_ago(2), None, None);
        let location = fixture
            .catalog
            .create_location(fs, "local", "url1", LocationStatus::Done)
            .unwrap();
        fixture.catalog.add_path(location, "testme.txt", Some(9));
        // The catalog says the data is on local, but the backend lost it.

        fixture.manager.process().await?;

        let locations = fixture.catalog.locations_for(fs);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].status, LocationStatus::Deleting);
        let logs = fixture.catalog.access_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].finished.is_some(), true);
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_cold_eligible_replica() -> Result<(), Error> {
        let fixture = make_fixture();
        let fs = fixture.catalog.create_file_storage(days_ago(30), None, None);
        let gcs_location = fixture
            .catalog
            .create_location(fs, "GCS", "url1", LocationStatus::Done)
            .unwrap();
        fixture.catalog.add_path(gcs_location, "testme.txt", Some(9));
        fixture.gcs.put_object("url1/testme.txt", Bytes::from_static(b"test data"));
        let s3_location = fixture
            .catalog
            .create_location(fs, "S3", "url1", LocationStatus::Done)
            .unwrap();
        fixture.s3.put_object("url1/testme.txt", Bytes::from_static(b"test data"));
        fixture.catalog.set_last_update(s3_location, days_ago(5));

        fixture.manager.process().await?;

        let locations = fixture.catalog.locations_for(fs);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].connector_name, "GCS");
        assert_eq!(fixture.s3.object_count(), 0);
        // The GCS copy still references its path.
        assert_eq!(fixture.catalog.referenced_path_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_backend_delete_leaves_deleting_tombstone() -> Result<(), Error> {
        let fixture = make_fixture();
        let fs = fixture.catalog.create_file_storage(days_ago(30), None, None);
        fixture
            .catalog
            .create_location(fs, "GCS", "url1", LocationStatus::Done)
            .unwrap();
        fixture.gcs.put_object("url1/testme.txt", Bytes::from_static(b"test data"));
        let s3_location = fixture
            .catalog
            .create_location(fs, "S3", "url1", LocationStatus::Done)
            .unwrap();
        fixture.s3.put_object("url1/testme.txt", Bytes::from_static(b"test data"));
        fixture.catalog.set_last_update(s3_location, days_ago(5));
        fixture
            .s3
            .inject_delete_failures(vec![make_err!(Code::Unavailable, "Backend down")]);

        fixture.manager.process().await?;

        let locations = fixture.catalog.locations_for(fs);
        let s3_row = locations.iter().find(|l| l.connector_name == "S3").unwrap();
        assert_eq!(s3_row.status, LocationStatus::Deleting);
        assert_eq!(fixture.s3.has_object("url1/testme.txt"), true);

        // The tombstone is no longer a deletion candidate.
        fixture.manager.process().await?;
        let locations = fixture.catalog.locations_for(fs);
        assert_eq!(
            locations.iter().find(|l| l.connector_name == "S3").unwrap().status,
            LocationStatus::Deleting
        );
        Ok(())
    }

    #[tokio::test]
    async fn highest_priority_replica_survives_delete_sweeps() -> Result<(), Error> {
        let fixture = make_fixture();
        let fs = fixture.catalog.create_file_storage(days_ago(30), None, None);
        for (backend, connector) in [("local", &fixture.local), ("S3", &fixture.s3), ("GCS", &fixture.gcs)] {
            let location = fixture
                .catalog
                .create_location(fs, backend, "url1", LocationStatus::Done)
                .unwrap();
            fixture.catalog.set_last_update(location, days_ago(10));
            connector.put_object("url1/testme.txt", Bytes::from_static(b"test data"));
        }

        // Sweep repeatedly; the S3 replica is deletable, GCS is protected
        // as the highest-priority copy, local has no delete rule.
        fixture.manager.process().await?;
        fixture.manager.process().await?;

        let mut backends: Vec<String> = fixture
            .catalog
            .locations_for(fs)
            .into_iter()
            .map(|l| l.connector_name)
            .collect();
        backends.sort();
        assert_eq!(backends, vec!["GCS", "local"]);
        assert_eq!(fixture.gcs.has_object("url1/testme.txt"), true);
        assert_eq!(fixture.local.has_object("url1/testme.txt"), true);
        Ok(())
    }

    #[tokio::test]
    async fn copy_uses_cheapest_source_and_advancing_clock() -> Result<(), Error> {
        let fixture = make_fixture();
        let (fs, _) = seed_local_storage(&fixture, 1, "url1");

        fixture.manager.process().await?;
        assert_eq!(fixture.catalog.locations_for(fs).len(), 1);

        // Two days later the S3 copy rule fires.
        fixture.clock.advance(Duration::days(1));
        fixture.manager.process().await?;
        let locations = fixture.catalog.locations_for(fs);
        assert_eq!(locations.iter().any(|l| l.connector_name == "S3"), true);
        Ok(())
    }
}
