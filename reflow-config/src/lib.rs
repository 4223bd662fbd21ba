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

use reflow_error::{make_err, Code, Error, ResultExt};
use serde::{Deserialize, Serialize};

/// Default number of DONE replicas that must remain on other backends
/// before a replica may be deleted.
pub const DEFAULT_MIN_OTHER_COPIES: u32 = 1;

#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    /// Holds all objects in a process-local hashmap. Data does not survive
    /// restarts; intended for tests and scratch deployments.
    memory,

    /// Objects are plain files below a configured root directory. Hash
    /// metadata is kept in a sidecar file next to each object tree.
    filesystem,

    /// Amazon S3 (or any S3-compatible object store). Uploads above the
    /// multipart threshold use multipart uploads, which makes the stored
    /// etag a composite hash of the individual parts.
    s3,
}

/// One backend entry of the injected configuration map.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectorSpec {
    /// Which driver services this backend.
    pub connector: ConnectorKind,

    /// Driver options plus the lifecycle rules for this backend.
    pub config: ConnectorOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectorOptions {
    /// Ranking of this backend. Higher values mean colder and cheaper
    /// storage. The highest-priority DONE replica of a file storage is
    /// never deleted.
    pub priority: i32,

    /// Root directory for `filesystem` connectors.
    #[serde(default)]
    pub path: Option<String>,

    /// Bucket name for `s3` connectors.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Region for `s3` connectors. Usually us-east-1, eu-west-1, etc.
    #[serde(default)]
    pub region: Option<String>,

    /// Optional key prefix inside the bucket.
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Opaque credential reference handed to the driver. The core never
    /// interprets this value.
    #[serde(default)]
    pub credentials: Option<String>,

    /// Part size in bytes for multipart uploads. When set, transfers to
    /// this backend must hash with the same chunk size so the composite
    /// etag is reproducible.
    #[serde(default)]
    pub multipart_chunk_size: Option<usize>,

    /// When to create a replica on this backend.
    #[serde(default)]
    pub copy: RuleConfig,

    /// When a replica on this backend may be removed.
    #[serde(default)]
    pub delete: RuleConfig,
}

/// An age-based lifecycle rule with optional per-process-type and
/// per-data-slug overrides.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RuleConfig {
    /// Minimum age in days before the rule fires. A negative value
    /// disables the rule; an absent value means the rule never fires.
    #[serde(default)]
    pub delay: Option<i64>,

    /// Minimum number of DONE replicas that must remain on other backends
    /// after a deletion. Only meaningful for `delete` rules.
    /// Default: 1.
    #[serde(default)]
    pub min_other_copies: Option<u32>,

    /// Overrides keyed by process type. A key matches when it is a prefix
    /// of the producing process type; the longest matching prefix wins.
    #[serde(default)]
    pub process_type: Option<BTreeMap<String, RuleOverride>>,

    /// Overrides keyed by data slug, matched exactly. Takes precedence
    /// over `process_type` when both match.
    #[serde(default)]
    pub data_slug: Option<BTreeMap<String, RuleOverride>>,
}

/// Field-wise replacement of a rule. Absent fields inherit from the base
/// rule of the backend.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RuleOverride {
    #[serde(default)]
    pub delay: Option<i64>,

    #[serde(default)]
    pub min_other_copies: Option<u32>,
}

/// The full backend map injected at startup, keyed by backend name.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectorsConfig {
    pub connectors: BTreeMap<String, ConnectorSpec>,
}

impl ConnectorsConfig {
    /// Parses a JSON5 config file and validates it. Any problem found here
    /// is fatal at startup; nothing in the sweep path re-validates.
    pub fn load(path: &str) -> Result<Self, Error> {
        let expanded = shellexpand::full(path)
            .map_err(|e| make_err!(Code::InvalidArgument, "Could not expand path: {e}"))?;
        let contents = std::fs::read_to_string(expanded.as_ref())
            .err_tip(|| format!("Failed to read config file {path}"))?;
        let config: ConnectorsConfig = serde_json5::from_str(&contents)
            .map_err(|e| make_err!(Code::InvalidArgument, "Invalid config {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, spec) in &self.connectors {
            match spec.connector {
                ConnectorKind::filesystem => {
                    if spec.config.path.is_none() {
                        return Err(make_err!(
                            Code::InvalidArgument,
                            "Connector {name} is a filesystem connector but has no path"
                        ));
                    }
                }
                ConnectorKind::s3 => {
                    if spec.config.bucket.is_none() {
                        return Err(make_err!(
                            Code::InvalidArgument,
                            "Connector {name} is an s3 connector but has no bucket"
                        ));
                    }
                }
                ConnectorKind::memory => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[test]
    fn parses_minimal_config() {
        let config: ConnectorsConfig = serde_json5::from_str(
            r#"{
                connectors: {
                    local: {
                        connector: "filesystem",
                        config: { priority: 1, path: "/data" },
                    },
                    archive: {
                        connector: "s3",
                        config: {
                            priority: 100,
                            bucket: "archive-bucket",
                            copy: { delay: 2 },
                            delete: { delay: 5, min_other_copies: 2 },
                        },
                    },
                }
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.connectors.len(), 2);
        let archive = &config.connectors["archive"].config;
        assert_eq!(archive.copy.delay, Some(2));
        assert_eq!(archive.delete.min_other_copies, Some(2));
        assert_eq!(config.connectors["local"].config.copy.delay, None);
    }

    #[test]
    fn rejects_filesystem_without_path() {
        let config: ConnectorsConfig = serde_json5::from_str(
            r#"{ connectors: { bad: { connector: "filesystem", config: { priority: 1 } } } }"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn parses_override_maps() {
        let config: ConnectorsConfig = serde_json5::from_str(
            r#"{
                connectors: {
                    GCS: {
                        connector: "memory",
                        config: {
                            priority: 200,
                            copy: {
                                delay: 3,
                                process_type: { "data:test": { delay: 10 } },
                                data_slug: { "test_data": { delay: 5 } },
                            },
                        },
                    },
                }
            }"#,
        )
        .unwrap();
        let copy = &config.connectors["GCS"].config.copy;
        assert_eq!(copy.process_type.as_ref().unwrap()["data:test"].delay, Some(10));
        assert_eq!(copy.data_slug.as_ref().unwrap()["test_data"].delay, Some(5));
    }
}
