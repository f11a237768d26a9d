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
use crate::config::EtcdConfig;
use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use log::debug;
use std::collections::BTreeMap;

/// Configuration backend on top of etcd v3. Multi-key changes are issued
/// as a single transaction; `get_tree` is a prefix range read.
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    pub async fn connect(config: &EtcdConfig) -> Result<Self, BackendError> {
        let mut options = ConnectOptions::new();
        if let (Some(username), Some(password)) = (config.username(), config.password()) {
            options = options.with_user(username, password.unsecure());
        }

        let client = Client::connect([config.url().as_str()], Some(options)).await?;
        debug!("Connected to etcd at {}", config.url());

        Ok(Self { client })
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn atomic_set(&self, entries: BTreeMap<String, String>) -> Result<(), BackendError> {
        if entries.is_empty() {
            return Ok(());
        }

        let operations = entries
            .iter()
            .map(|(key, value)| TxnOp::put(key.as_str(), value.as_str(), None))
            .collect::<Vec<_>>();

        let mut client = self.client.clone();
        client.txn(Txn::new().and_then(operations)).await?;
        Ok(())
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }

        let operations = keys
            .iter()
            .map(|key| TxnOp::delete(key.as_str(), None))
            .collect::<Vec<_>>();

        let mut client = self.client.clone();
        client.txn(Txn::new().and_then(operations)).await?;
        Ok(())
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut tree = BTreeMap::new();
        for kv in response.kvs() {
            let key = kv.key_str().map_err(|err| BackendError::InvalidData {
                err: format!("etcd key is not valid UTF-8: {err}"),
            })?;
            let value = kv.value_str().map_err(|err| BackendError::InvalidData {
                err: format!("etcd value of {key} is not valid UTF-8: {err}"),
            })?;
            tree.insert(key.to_string(), value.to_string());
        }

        Ok(tree)
    }

    async fn watch(&self, prefix: &str) -> Result<Option<ChangeStream>, BackendError> {
        let mut client = self.client.clone();
        let (watcher, mut watch_stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        let stream = async_stream::stream! {
            // dropping the watcher cancels the watch, keep it alive with
            // the stream
            let _watcher = watcher;

            while let Ok(Some(response)) = watch_stream.message().await {
                for event in response.events() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let Ok(key) = kv.key_str() else {
                        continue;
                    };

                    match event.event_type() {
                        EventType::Put => yield ChangeEvent::Put {
                            key: key.to_string(),
                        },
                        EventType::Delete => yield ChangeEvent::Delete {
                            key: key.to_string(),
                        },
                    }
                }
            }
        };

        Ok(Some(Box::pin(stream)))
    }
}

impl From<etcd_client::Error> for BackendError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::InvalidArgs(err) => BackendError::Rejected { err },
            etcd_client::Error::Utf8Error(err) => BackendError::InvalidData {
                err: err.to_string(),
            },
            err => BackendError::Unavailable {
                err: err.to_string(),
            },
        }
    }
}
