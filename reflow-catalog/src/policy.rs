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

//! The decision maker: pure queries over the replica inventory. Nothing
//! here suspends or touches storage; the lifecycle manager feeds it a
//! snapshot and executes its verdicts under row locks.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use reflow_config::{ConnectorsConfig, RuleConfig, DEFAULT_MIN_OTHER_COPIES};

use crate::models::{FileStorageId, FileStorageMeta, FileStorageState, Inventory, LocationStatus};

/// Per-backend slice of the configuration the policy engine consumes.
#[derive(Clone, Debug)]
pub struct BackendSettings {
    pub priority: i32,
    pub copy: RuleConfig,
    pub delete: RuleConfig,
}

pub type SettingsMap = BTreeMap<String, BackendSettings>;

/// Projects the full connector configuration down to what policy
/// decisions need.
pub fn settings_from_config(config: &ConnectorsConfig) -> SettingsMap {
    config
        .connectors
        .iter()
        .map(|(name, spec)| {
            (
                name.clone(),
                BackendSettings {
                    priority: spec.config.priority,
                    copy: spec.config.copy.clone(),
                    delete: spec.config.delete.clone(),
                },
            )
        })
        .collect()
}

/// A rule after override resolution. `delay` of `None` means the rule
/// never fires; negative values mean explicitly disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EffectiveRule {
    pub delay: Option<i64>,
    pub min_other_copies: u32,
}

impl EffectiveRule {
    fn fires_after(&self, reference: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.delay {
            None => false,
            Some(delay) if delay < 0 => false,
            Some(delay) => now - reference >= Duration::days(delay),
        }
    }
}

/// Resolves the effective rule for one file storage: an exact data-slug
/// override wins, otherwise the longest matching process-type prefix.
/// Absent override fields inherit the backend's base rule.
pub fn effective_rule(rule: &RuleConfig, meta: &FileStorageMeta) -> EffectiveRule {
    let mut delay = rule.delay;
    let mut min_other_copies = rule.min_other_copies;

    let slug_override = rule.data_slug.as_ref().and_then(|overrides| {
        meta.data_slug
            .as_ref()
            .and_then(|slug| overrides.get(slug))
    });
    let type_override = rule.process_type.as_ref().and_then(|overrides| {
        meta.process_type.as_ref().and_then(|process_type| {
            overrides
                .iter()
                .filter(|(prefix, _)| process_type.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, value)| value)
        })
    });

    if let Some(rule_override) = slug_override.or(type_override) {
        if rule_override.delay.is_some() {
            delay = rule_override.delay;
        }
        if rule_override.min_other_copies.is_some() {
            min_other_copies = rule_override.min_other_copies;
        }
    }

    EffectiveRule {
        delay,
        min_other_copies: min_other_copies.unwrap_or(DEFAULT_MIN_OTHER_COPIES),
    }
}

/// File storages that should gain a replica on `backend`: no replica
/// there in any status, at least one completed replica elsewhere to copy
/// from, and old enough for the backend's copy rule.
pub fn to_copy(
    inventory: &Inventory,
    settings: &SettingsMap,
    backend: &str,
    now: DateTime<Utc>,
) -> Vec<FileStorageId> {
    let Some(backend_settings) = settings.get(backend) else {
        return Vec::new();
    };
    let mut candidates: Vec<&FileStorageState> = inventory
        .file_storages
        .iter()
        .filter(|fs| {
            !fs.replicas
                .iter()
                .any(|replica| replica.connector_name == backend)
        })
        .filter(|fs| {
            fs.replicas
                .iter()
                .any(|replica| replica.status == LocationStatus::Done)
        })
        .filter(|fs| {
            effective_rule(&backend_settings.copy, &fs.meta).fires_after(fs.meta.created, now)
        })
        .collect();
    sort_deterministically(&mut candidates);
    candidates.into_iter().map(|fs| fs.meta.id).collect()
}

/// File storages whose replica on `backend` may be removed. The replica
/// must be completed, idle, old enough, not the highest-priority copy,
/// and enough completed replicas must remain elsewhere.
pub fn to_delete(
    inventory: &Inventory,
    settings: &SettingsMap,
    backend: &str,
    now: DateTime<Utc>,
) -> Vec<FileStorageId> {
    let Some(backend_settings) = settings.get(backend) else {
        return Vec::new();
    };
    let mut candidates: Vec<&FileStorageState> = inventory
        .file_storages
        .iter()
        .filter(|fs| {
            deletion_allowed(fs, settings, backend, backend_settings, now)
        })
        .collect();
    sort_deterministically(&mut candidates);
    candidates.into_iter().map(|fs| fs.meta.id).collect()
}

/// The deletion predicate for one file storage, shared with the manager
/// so the decision can be re-checked under the row lock.
pub fn deletion_allowed(
    fs: &FileStorageState,
    settings: &SettingsMap,
    backend: &str,
    backend_settings: &BackendSettings,
    now: DateTime<Utc>,
) -> bool {
    let Some(replica) = fs
        .replicas
        .iter()
        .find(|replica| replica.connector_name == backend)
    else {
        return false;
    };
    if replica.status != LocationStatus::Done || replica.in_use {
        return false;
    }

    // The highest-priority completed replica is never deleted.
    let max_done_priority = fs
        .replicas
        .iter()
        .filter(|other| other.status == LocationStatus::Done)
        .filter_map(|other| settings.get(&other.connector_name).map(|s| s.priority))
        .max();
    if max_done_priority == Some(backend_settings.priority) {
        return false;
    }

    let rule = effective_rule(&backend_settings.delete, &fs.meta);
    if !rule.fires_after(replica.last_update, now) {
        return false;
    }

    let other_done_copies = fs
        .replicas
        .iter()
        .filter(|other| {
            other.connector_name != backend && other.status == LocationStatus::Done
        })
        .count();
    other_done_copies as u32 >= rule.min_other_copies
}

fn sort_deterministically(candidates: &mut [&FileStorageState]) {
    candidates.sort_by(|a, b| {
        a.meta
            .created
            .cmp(&b.meta.created)
            .then_with(|| a.meta.id.cmp(&b.meta.id))
    });
}
