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

use async_trait::async_trait;
use reflow_error::Error;
use reflow_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use reflow_util::stream_hasher::HashAlgorithm;

/// Uniform capability set every storage backend provides. Connectors are
/// shared read-only singletons, registered by name and swapped in tests
/// through the registry lookup table.
///
/// Failure semantics: `Code::Unavailable` and `Code::DeadlineExceeded`
/// are transient and may be retried by callers, `Code::NotFound` means
/// the object is gone, anything else is permanent.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Ranking of this backend. Higher values mean colder storage.
    fn priority(&self) -> i32;

    /// Hash algorithms this backend can serve for stored objects.
    /// Element 0 is the backend's native algorithm.
    fn supported_download_hashes(&self) -> &[HashAlgorithm];

    /// Hash algorithms this backend records at ingest.
    /// Element 0 is the backend's native algorithm.
    fn supported_upload_hashes(&self) -> &[HashAlgorithm];

    /// When present, transfers to this backend must hash with this chunk
    /// size so the upload-side composite etag is reproducible.
    fn multipart_chunk_size(&self) -> Option<usize> {
        None
    }

    /// Relative object names under `url`. Directory entries end with `/`.
    async fn list(&self, url: &str) -> Result<Vec<String>, Error>;

    /// Streams the object at `url` into `writer`. The sink is always
    /// closed: via EOF on success, or via drop (which poisons the pipe)
    /// on failure.
    async fn get(&self, url: &str, writer: DropCloserWriteHalf) -> Result<(), Error>;

    /// Reads `reader` to EOF and stores the bytes at `url`. May chunk
    /// internally.
    async fn push(&self, reader: DropCloserReadHalf, url: &str) -> Result<(), Error>;

    /// Returns the stored hash value for `url`, or `None` when either the
    /// object or the requested metadata does not exist. Never computes.
    async fn get_hash(&self, url: &str, algo: HashAlgorithm) -> Result<Option<String>, Error>;

    /// Stores arbitrary algorithm-to-hex metadata for `url`.
    async fn set_hashes(&self, url: &str, hashes: &HashMap<String, String>) -> Result<(), Error>;

    /// Idempotent removal of the object or prefix at `url`.
    async fn delete(&self, url: &str) -> Result<(), Error>;

    /// Called before this connector serves downloads for a recursive
    /// transfer; may rewrite the object list (e.g. pre-archive many small
    /// files into one).
    async fn before_get(&self, objects: Vec<String>, _url: &str) -> Result<Vec<String>, Error> {
        Ok(objects)
    }

    /// Called before this connector receives uploads for a recursive
    /// transfer; may rewrite the object list.
    async fn before_push(&self, objects: Vec<String>, _url: &str) -> Result<Vec<String>, Error> {
        Ok(objects)
    }

    /// Called after this connector served downloads for a recursive
    /// transfer (e.g. to remove a temporary archive).
    async fn after_get(&self, _objects: &[String], _url: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Called after this connector received uploads for a recursive
    /// transfer. Returns the final stored-object list when it differs
    /// from the transferred one.
    async fn after_push(
        &self,
        _objects: &[String],
        _url: &str,
    ) -> Result<Option<Vec<String>>, Error> {
        Ok(None)
    }
}

/// Joins a base url and a relative entry without doubling separators.
pub fn join_url(base: &str, entry: &str) -> String {
    let base = base.trim_end_matches('/');
    let entry = entry.trim_start_matches('/');
    if base.is_empty() {
        entry.to_string()
    } else {
        format!("{base}/{entry}")
    }
}
