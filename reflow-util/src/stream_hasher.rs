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

use reflow_error::{make_err, Code, Error, ResultExt};

use crate::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};

/// Default hashing chunk size. Matches the common multipart upload part
/// size so composite etags line up without an override.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Metadata key recording the chunk size a transfer hashed with. Needed
/// to recompute composite etags later.
pub const UPLOAD_CHUNK_SIZE_KEY: &str = "_upload_chunk_size";

/// Every algorithm the stream hasher accumulates. Keyed by short string
/// identifiers in stored metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Crc32c,
    /// AWS-style multipart composite: MD5 over the concatenated per-part
    /// MD5 digests, suffixed with `-<parts>`. Single-part payloads
    /// degrade to the plain MD5 hex.
    AwsS3Etag,
}

pub const KNOWN_HASH_ALGORITHMS: [HashAlgorithm; 3] =
    [HashAlgorithm::Md5, HashAlgorithm::Crc32c, HashAlgorithm::AwsS3Etag];

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Crc32c => "crc32c",
            HashAlgorithm::AwsS3Etag => "awss3etag",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, Error> {
        match value {
            "md5" => Ok(HashAlgorithm::Md5),
            "crc32c" => Ok(HashAlgorithm::Crc32c),
            "awss3etag" => Ok(HashAlgorithm::AwsS3Etag),
            other => Err(make_err!(Code::InvalidArgument, "Unknown hash algorithm {other}")),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental accumulator for all known algorithms. Connectors use this
/// directly when they ingest data outside the streaming pipeline, the
/// same way an object store computes its etag at rest.
pub struct MultiDigest {
    chunk_size: usize,
    md5_ctx: md5::Context,
    crc: u32,
    part_ctx: md5::Context,
    part_fill: usize,
    part_digests: Vec<[u8; 16]>,
}

impl MultiDigest {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        MultiDigest {
            chunk_size,
            md5_ctx: md5::Context::new(),
            crc: 0,
            part_ctx: md5::Context::new(),
            part_fill: 0,
            part_digests: Vec::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5_ctx.consume(data);
        self.crc = crc32c::crc32c_append(self.crc, data);

        // Re-slice the incoming buffer along our own part boundaries so
        // the composite etag is independent of producer chunking.
        let mut rest = data;
        while !rest.is_empty() {
            let take = std::cmp::min(self.chunk_size - self.part_fill, rest.len());
            self.part_ctx.consume(&rest[..take]);
            self.part_fill += take;
            rest = &rest[take..];
            if self.part_fill == self.chunk_size {
                let full = std::mem::replace(&mut self.part_ctx, md5::Context::new());
                self.part_digests.push(full.compute().0);
                self.part_fill = 0;
            }
        }
    }

    pub fn finalize(mut self) -> HashMap<HashAlgorithm, String> {
        if self.part_fill > 0 {
            self.part_digests.push(self.part_ctx.compute().0);
        }
        let md5_hex = hex::encode(self.md5_ctx.compute().0);
        let etag = if self.part_digests.len() <= 1 {
            md5_hex.clone()
        } else {
            let mut concat_ctx = md5::Context::new();
            for digest in &self.part_digests {
                concat_ctx.consume(digest);
            }
            format!("{}-{}", hex::encode(concat_ctx.compute().0), self.part_digests.len())
        };

        let mut digests = HashMap::with_capacity(KNOWN_HASH_ALGORITHMS.len());
        digests.insert(HashAlgorithm::Md5, md5_hex);
        digests.insert(HashAlgorithm::Crc32c, hex::encode(self.crc.to_be_bytes()));
        digests.insert(HashAlgorithm::AwsS3Etag, etag);
        digests
    }
}

/// One-shot digests for data already in memory.
pub fn digests_for_bytes(data: &[u8], chunk_size: usize) -> HashMap<HashAlgorithm, String> {
    let mut digest = MultiDigest::new(chunk_size);
    digest.update(data);
    digest.finalize()
}

/// Re-keys a digest map by the algorithms' string identifiers.
pub fn digests_to_string_map(digests: &HashMap<HashAlgorithm, String>) -> HashMap<String, String> {
    digests
        .iter()
        .map(|(algo, value)| (algo.as_str().to_string(), value.clone()))
        .collect()
}

/// Identity transform stage of the transfer pipeline: copies bytes from
/// the download pipe to the upload pipe while accumulating every known
/// digest. Chunk boundaries for the composite etag are set by
/// `chunk_size`, independent of how the producer sliced the stream.
pub struct StreamHasher {
    chunk_size: usize,
    digests: Option<HashMap<HashAlgorithm, String>>,
}

impl StreamHasher {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        StreamHasher {
            chunk_size,
            digests: None,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Pumps `input` to EOF, forwarding every byte to `output` and then
    /// closing it. On return the digests are final.
    pub async fn compute(
        &mut self,
        mut input: DropCloserReadHalf,
        mut output: DropCloserWriteHalf,
    ) -> Result<(), Error> {
        let mut digest = MultiDigest::new(self.chunk_size);
        loop {
            let chunk = input.recv().await.err_tip(|| "Failed to recv in stream hasher")?;
            if chunk.is_empty() {
                break; // EOF.
            }
            digest.update(&chunk);
            output
                .send(chunk)
                .await
                .err_tip(|| "Failed to forward chunk in stream hasher")?;
        }
        self.digests = Some(digest.finalize());
        output
            .send_eof()
            .await
            .err_tip(|| "Failed to send EOF in stream hasher")
    }

    /// Final hex digest for one algorithm. Only available after a
    /// completed `compute`.
    pub fn hexdigest(&self, algo: HashAlgorithm) -> Option<&str> {
        self.digests
            .as_ref()
            .and_then(|digests| digests.get(&algo).map(String::as_str))
    }

    /// All final digests keyed by their string ids, for storing as
    /// destination metadata.
    pub fn hexdigests(&self) -> Result<HashMap<String, String>, Error> {
        let digests = self
            .digests
            .as_ref()
            .ok_or_else(|| make_err!(Code::Internal, "Digests requested before compute finished"))?;
        Ok(digests_to_string_map(digests))
    }
}
