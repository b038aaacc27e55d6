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

use crate::Result;
use crate::errors::CredentialsError;
use crate::token::{Token, TokenProvider};
use std::sync::Arc;
use tokio::sync::Mutex;
// Using tokio's wrapper makes the cache testable without relying on clock times.
use tokio::time::{Duration, Instant};

/// Tokens are refreshed this long before they expire.
///
/// A token that is about to expire may be rejected by the service if the
/// request takes too long to reach it.
pub(crate) const EARLY_REFRESH: Duration = Duration::from_secs(10);

/// A decorator that caches tokens and refreshes them before they expire.
///
/// Concurrent callers share a single refresh: at most one call to the inner
/// provider is in flight, and every caller waiting on it receives the same
/// token or the same error.
#[derive(Debug)]
pub(crate) struct TokenCache<T>
where
    T: TokenProvider,
{
    // The cached token, or the last seen error.
    state: Arc<Mutex<CacheState>>,

    // Tracks if a refresh is ongoing. If the lock is held, there is a refresh.
    refresh_in_progress: Arc<Mutex<()>>,

    // The token provider. This thing does the refreshing.
    inner: Arc<T>,
}

#[derive(Debug)]
struct CacheState {
    token: Result<Token>,
    // Incremented after every refresh. Waiters use it to detect that the
    // refresh they were waiting on has completed.
    generation: u64,
}

// Returns true if we are holding an error, or a token that has (almost)
// expired.
fn invalid(token: &Result<Token>) -> bool {
    match token {
        Ok(t) => t
            .expires_at
            .is_some_and(|e| e <= Instant::now() + EARLY_REFRESH),
        Err(_) => true,
    }
}

// We manually implement the `Clone` trait because the Rust compiler will
// squawk if `T` is not `Clone`, even though we only hold an `Arc<T>`. :shrug:
impl<T: TokenProvider> Clone for TokenCache<T> {
    fn clone(&self) -> TokenCache<T> {
        TokenCache {
            state: self.state.clone(),
            refresh_in_progress: self.refresh_in_progress.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: TokenProvider> TokenCache<T> {
    pub(crate) fn new(inner: T) -> TokenCache<T> {
        TokenCache {
            state: Arc::new(Mutex::new(CacheState {
                token: Err(CredentialsError::from_msg(true, "no token in the cache")),
                generation: 0,
            })),
            refresh_in_progress: Arc::new(Mutex::new(())),
            inner: Arc::new(inner),
        }
    }

    // Clones the current token and its generation. Releases the lock on return.
    async fn current(&self) -> (Result<Token>, u64) {
        let state = self.state.lock().await;
        (state.token.clone(), state.generation)
    }
}

#[async_trait::async_trait]
impl<T: TokenProvider + 'static> TokenProvider for TokenCache<T> {
    async fn token(&self) -> Result<Token> {
        let (token, generation) = self.current().await;
        if !invalid(&token) {
            return token;
        }

        // Only one task refreshes at a time, the rest queue on this lock.
        let _guard = self.refresh_in_progress.lock().await;

        // Someone else completed a refresh while we waited. Share their
        // outcome, even if it is an error.
        let (token, current_generation) = self.current().await;
        if current_generation != generation {
            return token;
        }

        tracing::debug!("refreshing cached token");
        let token = self.inner.token().await;

        let mut state = self.state.lock().await;
        state.token = token.clone();
        state.generation += 1;
        token
    }
}
