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
use std::task::Poll;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{task::Context, Future, Stream};
use reflow_error::{make_err, Code, Error, ResultExt};
use tokio::sync::{mpsc, oneshot};

/// Create the bounded byte pipe used to couple transfer pipeline stages.
/// The wrapper manages EOF explicitly: a writer that goes away without
/// sending EOF injects an error into the stream, so a reader can never
/// mistake a truncated transfer for a complete one.
pub fn make_buf_channel_pair() -> (DropCloserWriteHalf, DropCloserReadHalf) {
    // Two in-flight chunks give the producing stage a little headroom to
    // keep pumping while the consuming stage wakes up.
    let (tx, rx) = mpsc::channel(2);
    let (close_tx, close_rx) = oneshot::channel();
    (
        DropCloserWriteHalf {
            tx: Some(tx),
            bytes_written: 0,
            close_rx,
        },
        DropCloserReadHalf {
            rx,
            close_tx: Some(close_tx),
        },
    )
}

/// Writer half of the pipe. Blocks on `send` while the channel is full.
pub struct DropCloserWriteHalf {
    tx: Option<mpsc::Sender<Result<Bytes, Error>>>,
    bytes_written: u64,
    /// Resolves when the reader acknowledges EOF, or errors if the reader
    /// was dropped without draining the stream.
    close_rx: oneshot::Receiver<Result<(), Error>>,
}

impl DropCloserWriteHalf {
    /// Sends one chunk downstream. Zero-length chunks are not data; use
    /// `send_eof` to terminate the stream.
    pub async fn send(&mut self, buf: Bytes) -> Result<(), Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| make_err!(Code::Internal, "Tried to send while stream is closed"))?;
        let buf_len = buf.len() as u64;
        assert!(buf_len != 0, "Cannot send EOF in send(). Instead use send_eof()");
        let result = tx.send(Ok(buf)).await.map_err(|_| {
            make_err!(Code::Internal, "Failed to write to pipe, receiver disconnected")
        });
        if result.is_err() {
            // Prevent drop() from reporting a missing EOF a second time.
            self.tx = None;
        }
        self.bytes_written += buf_len;
        result
    }

    /// Gracefully terminates the stream and waits until the reader has
    /// observed the EOF. This is the half-close point: buffered chunks
    /// drain first, then the reader sees an empty read.
    pub async fn send_eof(&mut self) -> Result<(), Error> {
        assert!(self.tx.is_some(), "Tried to send an EOF when pipe is broken");
        self.tx = None;
        Pin::new(&mut self.close_rx)
            .await
            .map_err(|_| make_err!(Code::Internal, "Receiver went away before receiving EOF"))?
    }

    /// Number of bytes accepted so far. The reader may not have consumed
    /// them all yet.
    pub fn get_bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// True once this half can no longer send, either because EOF was
    /// sent or because the reader disconnected mid-stream.
    pub fn is_pipe_broken(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for DropCloserWriteHalf {
    /// A writer dropped without EOF poisons the stream so the consumer
    /// fails instead of storing short data.
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tx
                        .send(Err(make_err!(
                            Code::Internal,
                            "Writer was dropped before EOF was sent"
                        )))
                        .await;
                });
            }
        }
    }
}

/// Reader half of the pipe. Blocks on `recv` while the channel is empty.
pub struct DropCloserReadHalf {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
    /// Used to acknowledge a clean EOF back to the writer.
    close_tx: Option<oneshot::Sender<Result<(), Error>>>,
}

impl DropCloserReadHalf {
    /// Receives one chunk. An empty `Bytes` is the EOF marker.
    pub async fn recv(&mut self) -> Result<Bytes, Error> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                assert!(!chunk.is_empty(), "Chunk should never be empty, None is EOF");
                Ok(chunk)
            }
            Some(Err(e)) => Err(e),
            // Channel closed cleanly; acknowledge EOF to the writer.
            None => {
                if let Some(close_tx) = self.close_tx.take() {
                    close_tx
                        .send(Ok(()))
                        .map_err(|_| make_err!(Code::Internal, "Failed to ack EOF to writer"))?;
                }
                Ok(Bytes::new())
            }
        }
    }

    /// Drains the stream into one buffer. Single-chunk streams are passed
    /// through without a copy.
    pub async fn collect_all(mut self) -> Result<Bytes, Error> {
        let first_chunk = self.recv().await.err_tip(|| "Failed to recv first chunk")?;
        if first_chunk.is_empty() {
            return Ok(first_chunk);
        }
        let second_chunk = self.recv().await.err_tip(|| "Failed to recv second chunk")?;
        if second_chunk.is_empty() {
            return Ok(first_chunk);
        }
        let mut buf = BytesMut::with_capacity(first_chunk.len() + second_chunk.len());
        buf.put(first_chunk);
        buf.put(second_chunk);
        loop {
            let chunk = self.recv().await.err_tip(|| "Failed to recv in collect_all")?;
            if chunk.is_empty() {
                break; // EOF.
            }
            buf.put(chunk);
        }
        Ok(buf.freeze())
    }
}

impl Stream for DropCloserReadHalf {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Box::pin(self.recv()).as_mut().poll(cx).map(|result| match result {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return None;
                }
                Some(Ok(bytes))
            }
            Err(e) => Some(Err(e.to_std_err())),
        })
    }
}
