// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A bounded retry loop with exponential backoff.

use crate::Result;
use crate::errors::CredentialsError;
use std::future::Future;
use tokio::time::Duration;

pub(crate) const RETRY_EXHAUSTED_ERROR: &str = "all retry attempts have been exhausted";

/// Controls how many times, and how often, an operation is retried.
///
/// Only transient errors (see [CredentialsError::is_transient]) are retried.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RetryPolicy {
    /// The total number of attempts, including the first one.
    pub(crate) max_attempts: u32,
    /// The delay after the first failure.
    pub(crate) initial_delay: Duration,
    /// The delay never grows past this value.
    pub(crate) maximum_delay: Duration,
    /// The delay grows by this factor after each failure.
    pub(crate) scaling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            maximum_delay: Duration::from_secs(10),
            scaling: 2,
        }
    }
}

impl RetryPolicy {
    /// The delay before attempt number `attempt_count + 1`.
    fn delay(&self, attempt_count: u32) -> Duration {
        let factor = self
            .scaling
            .saturating_pow(attempt_count.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.maximum_delay)
    }

    /// Runs `operation` until it succeeds, fails with a permanent error, or
    /// the attempts are exhausted.
    ///
    /// The sleeps between attempts use `tokio::time`, dropping the returned
    /// future cancels the loop.
    pub(crate) async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt_count = 0_u32;
        loop {
            attempt_count += 1;
            let error = match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };
            if attempt_count >= self.max_attempts {
                return Err(CredentialsError::new(true, RETRY_EXHAUSTED_ERROR, error));
            }
            let delay = self.delay(attempt_count);
            tracing::debug!(attempt_count, ?delay, "retrying after transient error: {error}");
            tokio::time::sleep(delay).await;
        }
    }
}
