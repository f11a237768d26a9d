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

use crate::backend::{Backend, BackendError, ChangeEvent, ChangeStream};
use crate::config::RedisConfig;
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use redis::{aio::MultiplexedConnection, IntoConnectionInfo};
use std::collections::BTreeMap;

/// Configuration backend on top of Redis.
///
/// All multi-key changes go through `MULTI`/`EXEC` pipelines, so a change
/// is applied completely or not at all. Watching requires keyspace
/// notifications on the server (`notify-keyspace-events KEA`); durability
/// across server restarts requires append-only persistence.
pub struct RedisBackend {
    client: redis::Client,
    db: i64,
}

impl RedisBackend {
    pub fn new(config: &RedisConfig) -> Result<Self, BackendError> {
        let mut info =
            config
                .url()
                .as_str()
                .into_connection_info()
                .map_err(|err| BackendError::InvalidData {
                    err: format!("invalid redis URL: {err}"),
                })?;

        if let Some(username) = config.username() {
            info.redis.username = Some(username.to_string());
        }
        if let Some(password) = config.password() {
            info.redis.password = Some(password.unsecure().to_string());
        }

        let db = info.redis.db;
        let client = redis::Client::open(info).map_err(|err| BackendError::InvalidData {
            err: format!("invalid redis connection parameters: {err}"),
        })?;

        Ok(Self { client, db })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BackendError::from)
    }

    async fn scan_keys(
        &self,
        connection: &mut MultiplexedConnection,
        pattern: &str,
    ) -> Result<Vec<String>, BackendError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(connection)
                .await?;

            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn atomic_set(&self, entries: BTreeMap<String, String>) -> Result<(), BackendError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut connection = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in &entries {
            pipe.set(key, value).ignore();
        }

        let _: () = pipe.query_async(&mut connection).await?;
        debug!("Set {} redis keys transactionally", entries.len());
        Ok(())
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut connection = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.del(key).ignore();
        }

        let _: () = pipe.query_async(&mut connection).await?;
        Ok(())
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let mut connection = self.connection().await?;
        let keys = self
            .scan_keys(&mut connection, &format!("{prefix}*"))
            .await?;

        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut connection)
            .await?;

        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<Option<ChangeStream>, BackendError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .psubscribe(format!("__keyspace@{}__:{prefix}*", self.db))
            .await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|message| async move {
                let key = message
                    .get_channel_name()
                    .split_once("__:")
                    .map(|(_, key)| key.to_string())?;
                let operation: String = message.get_payload().ok()?;

                match operation.as_str() {
                    "set" => Some(ChangeEvent::Put { key }),
                    "del" | "expired" => Some(ChangeEvent::Delete { key }),
                    _ => None,
                }
            })
            .boxed();

        Ok(Some(stream))
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_unrecoverable_error() || err.is_connection_refusal() || err.is_timeout() {
            BackendError::Unavailable {
                err: err.to_string(),
            }
        } else {
            BackendError::Rejected {
                err: err.to_string(),
            }
        }
    }
}
