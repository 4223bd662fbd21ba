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
use std::time::Duration;

use futures::future::Future;
use futures::stream::StreamExt;
use reflow_error::{make_err, Code, Error};

/// Outcome of one attempt of a retriable operation.
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Iterator that doubles the delay on every step. Combine with
/// `.map(jitter_fn)` and `.take(n)` to build a retry schedule.
pub struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        ExponentialBackoff { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.current *= 2;
        Some(self.current)
    }
}

type SleepFn = Box<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Drives a stream of attempts until one succeeds, fails permanently, or
/// the duration iterator is exhausted. The sleep function is injected so
/// tests can observe the schedule without waiting on it.
pub struct Retrier {
    sleep_fn: SleepFn,
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn) -> Self {
        Retrier { sleep_fn }
    }

    /// Polls `operation` once per attempt. `duration_iter` yields the
    /// sleep before each retry, so `.take(n)` allows n retries and n + 1
    /// total attempts. When the schedule runs out the last transient
    /// error is returned.
    pub fn retry<'a, T, Iter, S>(
        self: Pin<&'a Self>,
        duration_iter: Iter,
        operation: S,
    ) -> Pin<Box<dyn Future<Output = Result<T, Error>> + 'a + Send>>
    where
        T: Send,
        Iter: Iterator<Item = Duration> + Send + 'a,
        S: futures::stream::Stream<Item = RetryResult<T>> + Send + 'a,
    {
        Box::pin(async move {
            let mut iter = duration_iter;
            let mut operation = Box::pin(operation);
            loop {
                match operation.next().await {
                    None => {
                        return Err(make_err!(
                            Code::Internal,
                            "Retry stream ended before yielding a result"
                        ))
                    }
                    Some(RetryResult::Ok(value)) => return Ok(value),
                    Some(RetryResult::Err(e)) => return Err(e),
                    Some(RetryResult::Retry(e)) => match iter.next() {
                        None => return Err(e),
                        Some(duration) => (self.sleep_fn)(duration).await,
                    },
                }
            }
        })
    }
}
