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

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reflow_error::{make_err, Code, Error, ResultExt};
use reflow_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use reflow_util::stream_hasher::{
    digests_for_bytes, digests_to_string_map, HashAlgorithm, DEFAULT_CHUNK_SIZE,
};

use crate::connector::Connector;

const SUPPORTED_HASHES: [HashAlgorithm; 3] =
    [HashAlgorithm::Md5, HashAlgorithm::Crc32c, HashAlgorithm::AwsS3Etag];

struct StoredObject {
    data: Bytes,
    hashes: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    push_failures: VecDeque<Error>,
    get_failures: VecDeque<Error>,
    delete_failures: VecDeque<Error>,
}

/// Backend that keeps all objects in a process-local map. Its native
/// hashes are computed at ingest, the way a real object store computes
/// an etag server-side. Failure injection hooks make it the standard
/// fixture for transfer and manager tests.
pub struct MemoryConnector {
    name: String,
    priority: i32,
    inner: Mutex<Inner>,
}

impl MemoryConnector {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        MemoryConnector {
            name: name.into(),
            priority,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queues errors returned by the next `push` calls, one per call.
    pub fn inject_push_failures(&self, errors: Vec<Error>) {
        self.inner.lock().push_failures.extend(errors);
    }

    /// Queues errors returned by the next `get` calls, one per call.
    pub fn inject_get_failures(&self, errors: Vec<Error>) {
        self.inner.lock().get_failures.extend(errors);
    }

    /// Queues errors returned by the next `delete` calls, one per call.
    pub fn inject_delete_failures(&self, errors: Vec<Error>) {
        self.inner.lock().delete_failures.extend(errors);
    }

    /// Stores an object directly, bypassing the pipe interface.
    pub fn put_object(&self, url: &str, data: Bytes) {
        let hashes =
            digests_to_string_map(&digests_for_bytes(&data, DEFAULT_CHUNK_SIZE));
        self.inner
            .lock()
            .objects
            .insert(url.to_string(), StoredObject { data, hashes });
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn has_object(&self, url: &str) -> bool {
        self.inner.lock().objects.contains_key(url)
    }

    pub fn object_data(&self, url: &str) -> Option<Bytes> {
        self.inner.lock().objects.get(url).map(|o| o.data.clone())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supported_download_hashes(&self) -> &[HashAlgorithm] {
        &SUPPORTED_HASHES
    }

    fn supported_upload_hashes(&self) -> &[HashAlgorithm] {
        &SUPPORTED_HASHES
    }

    async fn list(&self, url: &str) -> Result<Vec<String>, Error> {
        let prefix = if url.is_empty() || url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        };
        let inner = self.inner.lock();
        let mut entries = std::collections::BTreeSet::new();
        for key in inner.objects.keys() {
            let Some(relative) = key.strip_prefix(&prefix) else {
                continue;
            };
            entries.insert(relative.to_string());
            // Parent directories of nested entries are reported with a
            // trailing slash.
            let mut position = 0;
            while let Some(slash) = relative[position..].find('/') {
                position += slash + 1;
                entries.insert(relative[..position].to_string());
            }
        }
        Ok(entries.into_iter().collect())
    }

    async fn get(&self, url: &str, mut writer: DropCloserWriteHalf) -> Result<(), Error> {
        let data = {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.get_failures.pop_front() {
                return Err(err);
            }
            inner
                .objects
                .get(url)
                .map(|o| o.data.clone())
                .ok_or_else(|| make_err!(Code::NotFound, "Object {url} not found"))?
        };
        if !data.is_empty() {
            writer
                .send(data)
                .await
                .err_tip(|| "Failed to send object in memory connector")?;
        }
        writer.send_eof().await
    }

    async fn push(&self, reader: DropCloserReadHalf, url: &str) -> Result<(), Error> {
        if let Some(err) = self.inner.lock().push_failures.pop_front() {
            return Err(err);
        }
        let data = reader
            .collect_all()
            .await
            .err_tip(|| "Failed to read stream in memory connector push")?;
        self.put_object(url, data);
        Ok(())
    }

    async fn get_hash(&self, url: &str, algo: HashAlgorithm) -> Result<Option<String>, Error> {
        Ok(self
            .inner
            .lock()
            .objects
            .get(url)
            .and_then(|o| o.hashes.get(algo.as_str()).cloned()))
    }

    async fn set_hashes(&self, url: &str, hashes: &HashMap<String, String>) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .get_mut(url)
            .ok_or_else(|| make_err!(Code::NotFound, "Object {url} not found"))?;
        object.hashes.extend(hashes.clone());
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<(), Error> {
        let prefix = format!("{}/", url.trim_end_matches('/'));
        let mut inner = self.inner.lock();
        if let Some(err) = inner.delete_failures.pop_front() {
            return Err(err);
        }
        inner.objects.remove(url);
        inner.objects.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
