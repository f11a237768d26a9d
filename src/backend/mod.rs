/*-
 * ========================LICENSE_START=================================
 * Routier Traefik Controller
 * %%
 * Copyright (C) 2020 - 2024 aixigo AG
 * %%
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 * =========================LICENSE_END==================================
 */

use crate::config::RetryConfig;
use async_trait::async_trait;
use futures::stream::BoxStream;
use log::warn;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;

pub use consul::ConsulBackend;
#[cfg(test)]
pub use dummy_backend::DummyBackend as Dummy;
pub use etcd::EtcdBackend;
pub use file::FileBackend;
pub use redis::RedisBackend;

pub mod consul;
#[cfg(test)]
mod dummy_backend;
pub mod etcd;
pub mod file;
pub mod redis;

/// A change observed on a watched sub-tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChangeEvent {
    Put { key: String },
    Delete { key: String },
}

pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// The key-value protocol every configuration backend implements. Keys are
/// `/`-separated paths, values are scalar strings.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Writes all entries or none of them. On failure no key has been
    /// modified, except where the implementation documents weaker
    /// guarantees (see [`ConsulBackend`]).
    async fn atomic_set(&self, entries: BTreeMap<String, String>) -> Result<(), BackendError>;

    /// Deletes all keys or none of them. Missing keys are not an error.
    async fn atomic_delete(&self, keys: &[String]) -> Result<(), BackendError>;

    /// A recursive snapshot of all keys below the prefix, taken at some
    /// recent point in time. The snapshot may be stale by bounded time.
    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>, BackendError>;

    /// A stream of change notifications below the prefix, if the backend
    /// supports one. Callers fall back to polling otherwise.
    async fn watch(&self, prefix: &str) -> Result<Option<ChangeStream>, BackendError> {
        let _ = prefix;
        Ok(None)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {err}")]
    Unavailable { err: String },
    #[error("Backend rejected the change: {err}")]
    Rejected { err: String },
    #[error("Backend applied the change only partially: {err}")]
    PartialWrite { err: String },
    #[error("Cannot decode backend payload: {err}")]
    InvalidData { err: String },
    #[error("Cannot persist {path}: {err}")]
    Persistence { path: PathBuf, err: String },
}

impl BackendError {
    /// Whether a retry with backoff makes sense for this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}

/// Runs the backend operation with exponential backoff until it succeeds,
/// fails terminally, or the retry budget is exhausted.
pub(crate) async fn with_backoff<T, F, Fut>(
    operation: &str,
    retry: &RetryConfig,
    f: F,
) -> Result<T, BackendError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    for duration in
        exponential_backoff::Backoff::new(retry.attempts(), retry.min_delay(), retry.max_delay())
    {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => match duration {
                Some(duration) => {
                    warn!("Backend operation {operation} failed, trying again: {err}");
                    tokio::time::sleep(duration).await;
                }
                None => {
                    return Err(err);
                }
            },
            Err(err) => {
                return Err(err);
            }
        }
    }
    unreachable!()
}
