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

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::join;
use futures::stream::unfold;
use reflow_error::{make_err, Code, Error, ResultExt};
use reflow_util::buf_channel::make_buf_channel_pair;
use reflow_util::retry::{ExponentialBackoff, Retrier, RetryResult};
use reflow_util::stream_hasher::{StreamHasher, DEFAULT_CHUNK_SIZE, UPLOAD_CHUNK_SIZE_KEY};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connector::{join_url, Connector};

/// Number of retries after the first attempt. A transient failure on the
/// last attempt surfaces as a data transfer error.
const ERROR_MAX_RETRIES: usize = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Moves objects between two backends through the in-memory
/// download -> hash -> upload pipeline with end-to-end verification.
pub struct Transfer {
    from: Arc<dyn Connector>,
    to: Arc<dyn Connector>,
    retrier: Retrier,
}

impl Transfer {
    pub fn new(from: Arc<dyn Connector>, to: Arc<dyn Connector>) -> Self {
        Transfer {
            from,
            to,
            retrier: Retrier::new(Box::new(|duration| Box::pin(sleep(duration)))),
        }
    }

    /// Transfers all objects under `url`. When `objects` is absent the
    /// source connector is listed. The pre/post hooks of both connectors
    /// may rewrite the object list; returns the final stored list when it
    /// differs from the transferred one.
    pub async fn transfer_objects(
        &self,
        url: &str,
        objects: Option<Vec<String>>,
    ) -> Result<Option<Vec<String>>, Error> {
        let objects = match objects {
            Some(objects) => objects,
            None => self
                .from
                .list(url)
                .await
                .err_tip(|| format!("Failed to list objects under {url}"))?,
        };

        let to_transfer = async {
            let objects = self.from.before_get(objects, url).await?;
            self.to.before_push(objects, url).await
        }
        .await
        .map_err(|mut e| {
            e.code = Code::DataLoss;
            e.append(format!("Pre-processing failed while transferring {url}"))
        })?;

        for entry in &to_transfer {
            // Directories are not transferred.
            if entry.ends_with('/') {
                continue;
            }
            let object_url = join_url(url, entry);
            self.transfer(&object_url, &object_url).await?;
        }

        let stored = async {
            self.from.after_get(&to_transfer, url).await?;
            self.to.after_push(&to_transfer, url).await
        }
        .await
        .map_err(|mut e| {
            e.code = Code::DataLoss;
            e.append(format!("Post-processing failed while transferring {url}"))
        })?;
        Ok(stored)
    }

    /// Transfers a single object, retrying transient failures. Exhausted
    /// retries surface as `Code::DataLoss`.
    pub async fn transfer(&self, from_url: &str, to_url: &str) -> Result<(), Error> {
        let retry_schedule = ExponentialBackoff::new(RETRY_BASE_DELAY).take(ERROR_MAX_RETRIES);
        let result = Pin::new(&self.retrier)
            .retry(
                retry_schedule,
                unfold((), move |state| async move {
                    let result = self.transfer_once(from_url, to_url).await;
                    let retry_result = match result {
                        Ok(()) => RetryResult::Ok(()),
                        Err(e) if e.is_transient() => RetryResult::Retry(e),
                        Err(e) => RetryResult::Err(e),
                    };
                    Some((retry_result, state))
                }),
            )
            .await;
        result.map_err(|mut e| {
            if e.is_transient() {
                e.code = Code::DataLoss;
                e = e.append(format!(
                    "Transfer of {from_url} failed after {} attempts",
                    ERROR_MAX_RETRIES + 1
                ));
            }
            e
        })
    }

    async fn transfer_once(&self, from_url: &str, to_url: &str) -> Result<(), Error> {
        let chunk_size = self
            .to
            .multipart_chunk_size()
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        let from_hashes = self.from.supported_download_hashes();
        let to_hashes = self.to.supported_download_hashes();

        // Short-circuit: the destination may already hold identical bytes
        // from an earlier (partially recorded) transfer.
        if let Some(common) = to_hashes.iter().find(|algo| from_hashes.contains(*algo)) {
            let from_hash = self
                .from
                .get_hash(from_url, *common)
                .await
                .err_tip(|| format!("Failed to fetch source hash of {from_url}"))?;
            let to_hash = self
                .to
                .get_hash(to_url, *common)
                .await
                .err_tip(|| format!("Failed to fetch destination hash of {to_url}"))?;
            if from_hash.is_some() && from_hash == to_hash {
                debug!(
                    from = self.from.name(),
                    to = self.to.name(),
                    url = to_url,
                    "Object exists with matching hash, skipping"
                );
                return Ok(());
            }
        }

        let mut hasher = StreamHasher::new(chunk_size);
        let (hash_tx, hash_rx) = make_buf_channel_pair();
        let (data_tx, data_rx) = make_buf_channel_pair();

        let download_fut = self.from.get(from_url, hash_tx);
        let hash_fut = hasher.compute(hash_rx, data_tx);
        let upload_fut = self.to.push(data_rx, to_url);
        let (download_res, hash_res, upload_res) = join!(download_fut, hash_fut, upload_fut);

        if download_res.is_err() || hash_res.is_err() || upload_res.is_err() {
            if let Err(err) = self.to.delete(to_url).await {
                warn!(url = to_url, ?err, "Failed to clean up partial destination object");
            }
            // A vanished source is actionable for the caller; a transient
            // stage failure stays retryable. Everything else is data loss.
            let source_gone = matches!(&download_res, Err(e) if e.code == Code::NotFound);
            let transient = download_res.as_ref().err().is_some_and(Error::is_transient)
                || hash_res.as_ref().err().is_some_and(Error::is_transient)
                || upload_res.as_ref().err().is_some_and(Error::is_transient);
            let mut err = download_res.merge(hash_res).merge(upload_res).unwrap_err();
            err.code = if source_gone {
                Code::NotFound
            } else if transient {
                Code::Unavailable
            } else {
                Code::DataLoss
            };
            return Err(err.append(format!(
                "Transfer {}:{from_url} -> {}:{to_url} failed",
                self.from.name(),
                self.to.name()
            )));
        }

        // End-to-end verification with the native algorithm of each side.
        let download_native = from_hashes[0];
        let upload_native = self.to.supported_upload_hashes()[0];
        let from_hash = self
            .from
            .get_hash(from_url, download_native)
            .await
            .err_tip(|| format!("Failed to fetch source hash of {from_url} for verification"))?;
        let to_hash = self
            .to
            .get_hash(to_url, upload_native)
            .await
            .err_tip(|| format!("Failed to fetch destination hash of {to_url} for verification"))?;
        let hasher_from = hasher.hexdigest(download_native).map(str::to_string);
        let hasher_to = hasher.hexdigest(upload_native).map(str::to_string);

        if from_hash != hasher_from || to_hash != hasher_to {
            let _ = self.to.delete(to_url).await;
            return Err(make_err!(
                Code::DataLoss,
                "Hash verification of {to_url} failed: source {from_hash:?} vs {hasher_from:?}, destination {to_hash:?} vs {hasher_to:?}"
            ));
        }

        let mut hashes = hasher.hexdigests()?;
        hashes.insert(
            UPLOAD_CHUNK_SIZE_KEY.to_string(),
            hasher.chunk_size().to_string(),
        );
        self.to
            .set_hashes(to_url, &hashes)
            .await
            .err_tip(|| format!("Failed to store hash metadata for {to_url}"))
    }
}
