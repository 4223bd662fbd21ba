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

use bytes::Bytes;
use reflow_error::Error;
use reflow_util::buf_channel::make_buf_channel_pair;
use reflow_util::stream_hasher::{HashAlgorithm, StreamHasher};
use tokio::try_join;

#[cfg(test)]
mod stream_hasher_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    /// Runs the hasher over `chunks` and returns (output bytes, hasher).
    async fn run_hasher(chunks: Vec<Bytes>, chunk_size: usize) -> Result<(Bytes, StreamHasher), Error> {
        let (mut in_tx, in_rx) = make_buf_channel_pair();
        let (out_tx, out_rx) = make_buf_channel_pair();
        let mut hasher = StreamHasher::new(chunk_size);

        let feed_fut = async move {
            for chunk in chunks {
                in_tx.send(chunk).await?;
            }
            in_tx.send_eof().await
        };
        let hash_fut = hasher.compute(in_rx, out_tx);
        let collect_fut = out_rx.collect_all();
        let (_, _, output) = try_join!(feed_fut, hash_fut, collect_fut)?;
        Ok((output, hasher))
    }

    #[tokio::test]
    async fn identity_transform_preserves_bytes_in_order() -> Result<(), Error> {
        let input: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<Bytes> = input.chunks(7919).map(Bytes::copy_from_slice).collect();
        let (output, _hasher) = run_hasher(chunks, 4096).await?;
        assert_eq!(output, Bytes::from(input));
        Ok(())
    }

    #[tokio::test]
    async fn md5_matches_independent_digest() -> Result<(), Error> {
        let input = b"The quick brown fox jumps over the lazy dog";
        let (_, hasher) = run_hasher(vec![Bytes::from_static(input)], 8).await?;
        assert_eq!(
            hasher.hexdigest(HashAlgorithm::Md5).unwrap(),
            hex::encode(md5::compute(input).0)
        );
        Ok(())
    }

    #[tokio::test]
    async fn crc32c_check_value() -> Result<(), Error> {
        // Standard CRC-32C check vector.
        let (_, hasher) = run_hasher(vec![Bytes::from_static(b"123456789")], 1024).await?;
        assert_eq!(hasher.hexdigest(HashAlgorithm::Crc32c).unwrap(), "e3069283");
        Ok(())
    }

    #[tokio::test]
    async fn single_part_etag_is_plain_md5() -> Result<(), Error> {
        let input = b"small payload";
        let (_, hasher) = run_hasher(vec![Bytes::from_static(input)], 1024).await?;
        assert_eq!(
            hasher.hexdigest(HashAlgorithm::AwsS3Etag).unwrap(),
            hex::encode(md5::compute(input).0)
        );
        Ok(())
    }

    #[tokio::test]
    async fn multi_part_etag_has_part_suffix() -> Result<(), Error> {
        let input = b"0123456789"; // 3 parts of chunk_size 4.
        let (_, hasher) = run_hasher(vec![Bytes::from_static(input)], 4).await?;

        let mut concat = Vec::new();
        for part in input.chunks(4) {
            concat.extend_from_slice(&md5::compute(part).0);
        }
        let expected = format!("{}-3", hex::encode(md5::compute(&concat).0));
        assert_eq!(hasher.hexdigest(HashAlgorithm::AwsS3Etag).unwrap(), expected);
        Ok(())
    }

    #[tokio::test]
    async fn part_boundaries_independent_of_producer_chunking() -> Result<(), Error> {
        let input: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
        // Same payload, sliced two different ways by the producer.
        let slicing_a: Vec<Bytes> = input.chunks(13).map(Bytes::copy_from_slice).collect();
        let slicing_b: Vec<Bytes> = input.chunks(333).map(Bytes::copy_from_slice).collect();
        let (_, hasher_a) = run_hasher(slicing_a, 128).await?;
        let (_, hasher_b) = run_hasher(slicing_b, 128).await?;
        assert_eq!(
            hasher_a.hexdigest(HashAlgorithm::AwsS3Etag).unwrap(),
            hasher_b.hexdigest(HashAlgorithm::AwsS3Etag).unwrap()
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_stream_has_total_digests() -> Result<(), Error> {
        let (_, hasher) = run_hasher(vec![], 1024).await?;
        assert_eq!(
            hasher.hexdigest(HashAlgorithm::Md5).unwrap(),
            hex::encode(md5::compute(b"").0)
        );
        assert_eq!(hasher.hexdigest(HashAlgorithm::Crc32c).unwrap(), "00000000");
        Ok(())
    }
}
