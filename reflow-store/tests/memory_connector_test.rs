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
use reflow_error::{Code, Error};
use reflow_store::connector::Connector;
use reflow_store::memory_connector::MemoryConnector;
use reflow_util::buf_channel::make_buf_channel_pair;
use reflow_util::stream_hasher::HashAlgorithm;
use tokio::try_join;

#[cfg(test)]
mod memory_connector_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn push_get_round_trip() -> Result<(), Error> {
        let connector = MemoryConnector::new("mem", 1);
        let (mut tx, rx) = make_buf_channel_pair();
        let send_fut = async move {
            tx.send(Bytes::from_static(b"chunk one ")).await?;
            tx.send(Bytes::from_static(b"chunk two")).await?;
            tx.send_eof().await
        };
        try_join!(send_fut, connector.push(rx, "url/file.txt"))?;

        let (tx, rx) = make_buf_channel_pair();
        let (_, data) = try_join!(connector.get("url/file.txt", tx), rx.collect_all())?;
        assert_eq!(data, Bytes::from_static(b"chunk one chunk two"));
        Ok(())
    }

    #[tokio::test]
    async fn ingest_computes_native_hashes() -> Result<(), Error> {
        let connector = MemoryConnector::new("mem", 1);
        connector.put_object("url/file.txt", Bytes::from_static(b"hello"));
        assert_eq!(
            connector.get_hash("url/file.txt", HashAlgorithm::Md5).await?,
            Some(hex::encode(md5::compute(b"hello").0))
        );
        assert_eq!(connector.get_hash("url/other.txt", HashAlgorithm::Md5).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn list_includes_directory_entries() -> Result<(), Error> {
        let connector = MemoryConnector::new("mem", 1);
        connector.put_object("url/a.txt", Bytes::from_static(b"a"));
        connector.put_object("url/sub/deep/b.txt", Bytes::from_static(b"b"));
        let entries = connector.list("url").await?;
        assert_eq!(entries, vec!["a.txt", "sub/", "sub/deep/", "sub/deep/b.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() -> Result<(), Error> {
        let connector = MemoryConnector::new("mem", 1);
        let (tx, rx) = make_buf_channel_pair();
        let (get_res, _) = tokio::join!(connector.get("nope", tx), rx.collect_all());
        assert_eq!(get_res.unwrap_err().code, Code::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_object_and_prefix() -> Result<(), Error> {
        let connector = MemoryConnector::new("mem", 1);
        connector.put_object("url/a.txt", Bytes::from_static(b"a"));
        connector.put_object("url/sub/b.txt", Bytes::from_static(b"b"));
        connector.delete("url").await?;
        assert_eq!(connector.object_count(), 0);
        // A second delete of the same url is a no-op.
        connector.delete("url").await?;
        Ok(())
    }

    #[tokio::test]
    async fn injected_push_failures_are_consumed_in_order() -> Result<(), Error> {
        let connector = MemoryConnector::new("mem", 1);
        connector.inject_push_failures(vec![reflow_error::make_err!(
            Code::Unavailable,
            "Flaky backend"
        )]);

        let (mut tx, rx) = make_buf_channel_pair();
        let send_fut = async move {
            tx.send(Bytes::from_static(b"x")).await.ok();
            tx.send_eof().await.ok();
            Result::<(), Error>::Ok(())
        };
        let (_, push_res) = tokio::join!(send_fut, connector.push(rx, "url/file.txt"));
        assert_eq!(push_res.unwrap_err().code, Code::Unavailable);

        let (mut tx, rx) = make_buf_channel_pair();
        let send_fut = async move {
            tx.send(Bytes::from_static(b"x")).await?;
            tx.send_eof().await
        };
        try_join!(send_fut, connector.push(rx, "url/file.txt"))?;
        assert_eq!(connector.has_object("url/file.txt"), true);
        Ok(())
    }
}
