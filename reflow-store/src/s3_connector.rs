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
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Tag, Tagging};
use aws_sdk_s3::Client;
use bytes::BytesMut;
use reflow_config::ConnectorOptions;
use reflow_error::{make_err, Code, Error, ResultExt};
use reflow_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use reflow_util::stream_hasher::{HashAlgorithm, DEFAULT_CHUNK_SIZE};
use tracing::warn;

use crate::connector::Connector;

const SUPPORTED_HASHES: [HashAlgorithm; 3] =
    [HashAlgorithm::AwsS3Etag, HashAlgorithm::Md5, HashAlgorithm::Crc32c];

/// S3 parts cannot be smaller than this number. See:
/// https://docs.aws.amazon.com/AmazonS3/latest/userguide/qfacts.html
const MIN_MULTIPART_SIZE: usize = 5 * 1024 * 1024;

/// Backend for S3-compatible object stores. The native hash is the etag
/// the service computes at ingest; the other algorithms are recorded as
/// object tags by `set_hashes`.
pub struct S3Connector {
    name: String,
    priority: i32,
    client: Client,
    bucket: String,
    key_prefix: String,
    multipart_chunk_size: usize,
}

impl S3Connector {
    pub async fn new(name: impl Into<String>, options: &ConnectorOptions) -> Result<Self, Error> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &options.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;
        Self::new_with_client(name, options, Client::new(&sdk_config))
    }

    /// Injection point for tests and custom endpoints.
    pub fn new_with_client(
        name: impl Into<String>,
        options: &ConnectorOptions,
        client: Client,
    ) -> Result<Self, Error> {
        let chunk_size = options.multipart_chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size < MIN_MULTIPART_SIZE {
            return Err(make_err!(
                Code::InvalidArgument,
                "multipart_chunk_size {chunk_size} is below the S3 minimum of {MIN_MULTIPART_SIZE}"
            ));
        }
        Ok(S3Connector {
            name: name.into(),
            priority: options.priority,
            client,
            bucket: options
                .bucket
                .clone()
                .ok_or_else(|| make_err!(Code::InvalidArgument, "S3 connector requires a bucket"))?,
            key_prefix: options.key_prefix.clone().unwrap_or_default(),
            multipart_chunk_size: chunk_size,
        })
    }

    fn make_key(&self, url: &str) -> String {
        format!("{}{}", self.key_prefix, url.trim_start_matches('/'))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| make_s3_err("list_objects_v2", e))?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Connector for S3Connector {
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

    fn multipart_chunk_size(&self) -> Option<usize> {
        Some(self.multipart_chunk_size)
    }

    async fn list(&self, url: &str) -> Result<Vec<String>, Error> {
        let base = self.make_key(url);
        let prefix = if base.is_empty() || base.ends_with('/') {
            base
        } else {
            format!("{base}/")
        };
        let mut entries = std::collections::BTreeSet::new();
        for key in self.list_keys(&prefix).await? {
            let Some(relative) = key.strip_prefix(&prefix) else {
                continue;
            };
            entries.insert(relative.to_string());
            let mut position = 0;
            while let Some(slash) = relative[position..].find('/') {
                position += slash + 1;
                entries.insert(relative[..position].to_string());
            }
        }
        Ok(entries.into_iter().collect())
    }

    async fn get(&self, url: &str, mut writer: DropCloserWriteHalf) -> Result<(), Error> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.make_key(url))
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(context) = &e {
                    if context.err().is_no_such_key() {
                        return make_err!(Code::NotFound, "Object {url} not found in S3");
                    }
                }
                make_s3_err("get_object", e)
            })?;
        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "Failed to stream {url} from S3: {e}"))?
        {
            if chunk.is_empty() {
                continue;
            }
            writer
                .send(chunk)
                .await
                .err_tip(|| format!("Failed to forward bytes of {url}"))?;
        }
        writer.send_eof().await
    }

    async fn push(&self, mut reader: DropCloserReadHalf, url: &str) -> Result<(), Error> {
        let key = self.make_key(url);
        let part_size = self.multipart_chunk_size;
        let mut buffer = BytesMut::new();
        let mut eof = false;

        // Buffer until we know whether this upload needs to be multipart.
        while !eof && buffer.len() <= part_size {
            let chunk = reader
                .recv()
                .await
                .err_tip(|| format!("Failed to recv while storing {url}"))?;
            if chunk.is_empty() {
                eof = true;
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }

        if eof {
            return self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_length(buffer.len() as i64)
                .body(ByteStream::from(buffer.freeze()))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| make_s3_err("put_object", e));
        }

        let upload_id = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| make_s3_err("create_multipart_upload", e))?
            .upload_id
            .err_tip(|| "Expected upload_id to be set by S3")?;

        let upload_result = async {
            let mut part_number = 1i32;
            let mut completed_parts = Vec::new();
            loop {
                while !eof && buffer.len() < part_size {
                    let chunk = reader
                        .recv()
                        .await
                        .err_tip(|| format!("Failed to recv while storing {url}"))?;
                    if chunk.is_empty() {
                        eof = true;
                    } else {
                        buffer.extend_from_slice(&chunk);
                    }
                }
                if buffer.is_empty() {
                    break;
                }
                let part = if buffer.len() >= part_size {
                    buffer.split_to(part_size).freeze()
                } else {
                    buffer.split().freeze()
                };
                let response = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .content_length(part.len() as i64)
                    .body(ByteStream::from(part))
                    .send()
                    .await
                    .map_err(|e| make_s3_err("upload_part", e))?;
                completed_parts.push(
                    CompletedPart::builder()
                        .set_e_tag(response.e_tag)
                        .part_number(part_number)
                        .build(),
                );
                part_number += 1;
            }
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed_parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(|e| make_s3_err("complete_multipart_upload", e))
        }
        .await;

        if upload_result.is_err() {
            let abort_result = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(err) = abort_result {
                warn!(url, ?err, "Failed to abort multipart upload");
            }
        }
        upload_result
    }

    async fn get_hash(&self, url: &str, algo: HashAlgorithm) -> Result<Option<String>, Error> {
        let key = self.make_key(url);
        if algo == HashAlgorithm::AwsS3Etag {
            return match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(response) => Ok(response.e_tag.map(|etag| etag.trim_matches('"').to_string())),
                Err(e) => {
                    if let SdkError::ServiceError(context) = &e {
                        if context.err().is_not_found() {
                            return Ok(None);
                        }
                    }
                    Err(make_s3_err("head_object", e))
                }
            };
        }
        match self
            .client
            .get_object_tagging()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => Ok(response
                .tag_set()
                .iter()
                .find(|tag| tag.key() == algo.as_str())
                .map(|tag| tag.value().to_string())),
            Err(e) => {
                if is_missing_object(&e) {
                    return Ok(None);
                }
                Err(make_s3_err("get_object_tagging", e))
            }
        }
    }

    async fn set_hashes(&self, url: &str, hashes: &HashMap<String, String>) -> Result<(), Error> {
        let mut tagging = Tagging::builder();
        for (algo, value) in hashes {
            let tag = Tag::builder()
                .key(algo)
                .value(value)
                .build()
                .map_err(|e| make_err!(Code::InvalidArgument, "Invalid hash tag: {e}"))?;
            tagging = tagging.tag_set(tag);
        }
        let tagging = tagging
            .build()
            .map_err(|e| make_err!(Code::InvalidArgument, "Invalid hash tag set: {e}"))?;
        self.client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(self.make_key(url))
            .tagging(tagging)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| make_s3_err("put_object_tagging", e))
    }

    async fn delete(&self, url: &str) -> Result<(), Error> {
        let key = self.make_key(url);
        // Object deletes in S3 are idempotent; a missing key succeeds.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| make_s3_err("delete_object", e))?;
        for nested_key in self.list_keys(&format!("{key}/")).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&nested_key)
                .send()
                .await
                .map_err(|e| make_s3_err("delete_object", e))?;
        }
        Ok(())
    }
}

fn is_missing_object<E>(err: &SdkError<E>) -> bool {
    if let SdkError::ServiceError(context) = err {
        return context.raw().status().as_u16() == 404;
    }
    false
}

fn make_s3_err<E>(operation: &str, err: SdkError<E>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        // Timeout-like and connection-level failures can be retried.
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            make_err!(Code::Unavailable, "S3 {operation} failed: {err}")
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            if (500..=599).contains(&status) || status == 409 {
                make_err!(Code::Unavailable, "S3 {operation} failed with status {status}: {err}")
            } else {
                make_err!(Code::Unknown, "S3 {operation} failed with status {status}: {err}")
            }
        }
        _ => make_err!(Code::Unknown, "S3 {operation} failed: {err}"),
    }
}
