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

use std::collections::HashMap;
use std::sync::Arc;

use reflow_config::{ConnectorKind, ConnectorsConfig};
use reflow_error::{make_err, Code, Error};

use crate::connector::Connector;
use crate::filesystem_connector::FilesystemConnector;
use crate::memory_connector::MemoryConnector;
use crate::s3_connector::S3Connector;

/// Lookup table of shared connector singletons, keyed by backend name.
/// Built once at startup; tests swap in their own instances through
/// `insert`.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>, Error> {
        self.connectors
            .get(name)
            .cloned()
            .ok_or_else(|| make_err!(Code::InvalidArgument, "Unknown backend {name}"))
    }

    /// Backend names sorted by priority ascending (hottest first), with
    /// the name as tie-break so sweep order is reproducible.
    pub fn names_by_priority(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connectors.values().collect();
        names.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        names.into_iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

/// Instantiates every configured backend. Configuration problems are
/// fatal here, before any sweep runs.
pub async fn build_registry(config: &ConnectorsConfig) -> Result<ConnectorRegistry, Error> {
    config.validate()?;
    let mut registry = ConnectorRegistry::new();
    for (name, spec) in &config.connectors {
        let connector: Arc<dyn Connector> = match spec.connector {
            ConnectorKind::memory => {
                Arc::new(MemoryConnector::new(name.clone(), spec.config.priority))
            }
            ConnectorKind::filesystem => {
                let path = spec.config.path.as_ref().ok_or_else(|| {
                    make_err!(Code::InvalidArgument, "Connector {name} has no path")
                })?;
                Arc::new(FilesystemConnector::new(
                    name.clone(),
                    spec.config.priority,
                    path.clone(),
                ))
            }
            ConnectorKind::s3 => Arc::new(S3Connector::new(name.clone(), &spec.config).await?),
        };
        registry.insert(connector);
    }
    Ok(registry)
}
