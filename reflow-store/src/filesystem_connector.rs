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
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use reflow_error::{error_if, make_err, Code, Error, ResultExt};
use reflow_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use reflow_util::stream_hasher::{
    digests_to_string_map, HashAlgorithm, MultiDigest, DEFAULT_CHUNK_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::connector::Connector;

const SUPPORTED_HASHES: [HashAlgorithm; 3] =
    [HashAlgorithm::Md5, HashAlgorithm::Crc32c, HashAlgorithm::AwsS3Etag];

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash metadata lives in one sidecar map per connector root, keyed by
/// object url. The file never shows up in listings.
const SIDECAR_FILE: &str = ".reflow_hashes.json";

/// Backend rooted at a local directory. Objects are plain files; hash
/// metadata recorded at ingest is persisted in a sidecar map so
/// `get_hash` never has to re-read object data.
pub struct FilesystemConnector {
    name: String,
    priority: i32,
    root: PathBuf,
    /// Serializes read-modify-write cycles on the sidecar map.
    sidecar_lock: Mutex<()>,
}

impl FilesystemConnector {
    pub fn new(name: impl Into<String>, priority: i32, root: impl Into<PathBuf>) -> Self {
        FilesystemConnector {
            name: name.into(),
            priority,
            root: root.into(),
            sidecar_lock: Mutex::new(()),
        }
    }

    fn object_path(&self, url: &str) -> Result<PathBuf, Error> {
        error_if!(
            url.split('/').any(|component| component == ".."),
            "Refusing traversal outside the connector root: {url}"
        );
        Ok(self.root.join(url.trim_start_matches('/')))
    }

    async fn read_sidecar(&self) -> Result<HashMap<String, HashMap<String, String>>, Error> {
        match tokio::fs::read(self.root.join(SIDECAR_FILE)).await {
            Ok(contents) => serde_json::from_slice(&contents)
                .map_err(|e| make_err!(Code::Internal, "Corrupt hash sidecar: {e}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::from(e)).err_tip(|| "Failed to read hash sidecar"),
        }
    }

    async fn write_sidecar(
        &self,
        sidecar: &HashMap<String, HashMap<String, String>>,
    ) -> Result<(), Error> {
        let contents = serde_json::to_vec(sidecar)
            .map_err(|e| make_err!(Code::Internal, "Failed to serialize hash sidecar: {e}"))?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .err_tip(|| "Failed to create connector root")?;
        tokio::fs::write(self.root.join(SIDECAR_FILE), contents)
            .await
            .err_tip(|| "Failed to write hash sidecar")
    }
}

#[async_trait]
impl Connector for FilesystemConnector {
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
        let base = self.object_path(url)?;
        let mut entries = std::collections::BTreeSet::new();
        let mut pending: Vec<PathBuf> = vec![base.clone()];
        if !tokio::fs::try_exists(&base)
            .await
            .err_tip(|| format!("Failed to stat {url}"))?
        {
            return Err(make_err!(Code::NotFound, "No objects under {url}"));
        }
        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir)
                .await
                .err_tip(|| format!("Failed to read directory under {url}"))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .err_tip(|| format!("Failed to read directory entry under {url}"))?
            {
                let path = entry.path();
                let relative = relative_name(&base, &path)?;
                if relative == SIDECAR_FILE {
                    continue;
                }
                let file_type = entry.file_type().await.err_tip(|| "Failed to stat entry")?;
                if file_type.is_dir() {
                    entries.insert(format!("{relative}/"));
                    pending.push(path);
                } else {
                    entries.insert(relative);
                }
            }
        }
        Ok(entries.into_iter().collect())
    }

    async fn get(&self, url: &str, mut writer: DropCloserWriteHalf) -> Result<(), Error> {
        let path = self.object_path(url)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .err_tip(|| format!("Failed to open {url}"))?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .err_tip(|| format!("Failed to read {url}"))?;
            if n == 0 {
                break;
            }
            writer
                .send(Bytes::copy_from_slice(&buf[..n]))
                .await
                .err_tip(|| format!("Failed to forward bytes of {url}"))?;
        }
        writer.send_eof().await
    }

    async fn push(&self, mut reader: DropCloserReadHalf, url: &str) -> Result<(), Error> {
        let path = self.object_path(url)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .err_tip(|| format!("Failed to create parent directories of {url}"))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .err_tip(|| format!("Failed to create {url}"))?;
        let mut digest = MultiDigest::new(DEFAULT_CHUNK_SIZE);
        loop {
            let chunk = reader
                .recv()
                .await
                .err_tip(|| format!("Failed to recv while storing {url}"))?;
            if chunk.is_empty() {
                break; // EOF.
            }
            digest.update(&chunk);
            file.write_all(&chunk)
                .await
                .err_tip(|| format!("Failed to write {url}"))?;
        }
        file.flush().await.err_tip(|| format!("Failed to flush {url}"))?;

        let hashes = digests_to_string_map(&digest.finalize());
        let _guard = self.sidecar_lock.lock().await;
        let mut sidecar = self.read_sidecar().await?;
        sidecar.insert(url.to_string(), hashes);
        self.write_sidecar(&sidecar).await
    }

    async fn get_hash(&self, url: &str, algo: HashAlgorithm) -> Result<Option<String>, Error> {
        let sidecar = self.read_sidecar().await?;
        Ok(sidecar
            .get(url)
            .and_then(|hashes| hashes.get(algo.as_str()).cloned()))
    }

    async fn set_hashes(&self, url: &str, hashes: &HashMap<String, String>) -> Result<(), Error> {
        let path = self.object_path(url)?;
        if !tokio::fs::try_exists(&path)
            .await
            .err_tip(|| format!("Failed to stat {url}"))?
        {
            return Err(make_err!(Code::NotFound, "Object {url} not found"));
        }
        let _guard = self.sidecar_lock.lock().await;
        let mut sidecar = self.read_sidecar().await?;
        sidecar.entry(url.to_string()).or_default().extend(hashes.clone());
        self.write_sidecar(&sidecar).await
    }

    async fn delete(&self, url: &str) -> Result<(), Error> {
        let path = self.object_path(url)?;
        let removal = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        match removal {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e)).err_tip(|| format!("Failed to delete {url}")),
        }

        let prefix = format!("{}/", url.trim_end_matches('/'));
        let _guard = self.sidecar_lock.lock().await;
        let mut sidecar = self.read_sidecar().await?;
        sidecar.retain(|key, _| key != url && !key.starts_with(&prefix));
        self.write_sidecar(&sidecar).await
    }
}

fn relative_name(base: &Path, path: &Path) -> Result<String, Error> {
    let relative = path
        .strip_prefix(base)
        .map_err(|_| make_err!(Code::Internal, "Entry escaped listing root"))?;
    relative
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| make_err!(Code::InvalidArgument, "Non-UTF8 path in listing"))
}
