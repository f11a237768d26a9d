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

use crate::backend::{Backend, BackendError};
use crate::config::ConsulConfig;
use async_trait::async_trait;
use base64::prelude::*;
use log::warn;
use secstr::SecUtf8;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Consul caps KV transactions at this many operations, larger changes
/// must be chunked.
const MAX_TXN_OPS: usize = 64;

/// Configuration backend on top of Consul's KV transaction API.
///
/// Changes larger than [`MAX_TXN_OPS`] lose all-or-nothing semantics: the
/// backend chunks them and, when a later chunk fails, rolls earlier chunks
/// back by reissuing deletes. The rollback is best effort and the caller
/// is informed through [`BackendError::PartialWrite`]. Prefer the Redis
/// backend for new deployments.
pub struct ConsulBackend {
    http: reqwest::Client,
    url: Url,
    token: Option<SecUtf8>,
}

#[derive(Debug, Serialize)]
struct TxnOp {
    #[serde(rename = "KV")]
    kv: KvOp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct KvOp {
    verb: &'static str,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    value: Option<String>,
}

impl TxnOp {
    fn set(key: &str, value: &str) -> Self {
        Self {
            kv: KvOp {
                verb: "set",
                key: key.to_string(),
                value: Some(BASE64_STANDARD.encode(value)),
            },
        }
    }

    fn delete(key: &str) -> Self {
        Self {
            kv: KvOp {
                verb: "delete",
                key: key.to_string(),
                value: None,
            },
        }
    }
}

impl ConsulBackend {
    #[deprecated(
        note = "the Consul transaction limit only allows best-effort atomicity, prefer the Redis backend"
    )]
    pub fn new(config: &ConsulConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| BackendError::Unavailable {
                err: err.to_string(),
            })?;

        Ok(Self {
            http,
            url: config.url().clone(),
            token: config.token().cloned(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.url
            .join(path)
            .map_err(|err| BackendError::InvalidData {
                err: format!("cannot build consul URL for {path}: {err}"),
            })
    }

    async fn transaction(&self, operations: &[TxnOp]) -> Result<(), BackendError> {
        let mut request = self.http.put(self.endpoint("v1/txn")?).json(operations);
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token.unsecure());
        }

        let response = request.send().await.map_err(|err| BackendError::Unavailable {
            err: err.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(BackendError::Unavailable {
                err: format!("consul answered with {status}: {body}"),
            })
        } else {
            Err(BackendError::Rejected {
                err: format!("consul answered with {status}: {body}"),
            })
        }
    }

    /// Best-effort rollback: deletes the keys that earlier chunks already
    /// wrote.
    async fn roll_back(&self, applied_keys: &[String]) {
        let operations = applied_keys
            .iter()
            .map(|key| TxnOp::delete(key))
            .collect::<Vec<_>>();

        for chunk in operations.chunks(MAX_TXN_OPS) {
            if let Err(err) = self.transaction(chunk).await {
                warn!("Cannot roll back partially written consul transaction: {err}");
            }
        }
    }
}

#[async_trait]
impl Backend for ConsulBackend {
    async fn atomic_set(&self, entries: BTreeMap<String, String>) -> Result<(), BackendError> {
        if entries.is_empty() {
            return Ok(());
        }

        let operations = entries
            .iter()
            .map(|(key, value)| TxnOp::set(key, value))
            .collect::<Vec<_>>();

        for (index, chunk) in operations.chunks(MAX_TXN_OPS).enumerate() {
            if let Err(err) = self.transaction(chunk).await {
                if index == 0 {
                    // nothing has been applied yet, the failure is clean
                    return Err(err);
                }

                let applied_keys = operations[..index * MAX_TXN_OPS]
                    .iter()
                    .map(|operation| operation.kv.key.clone())
                    .collect::<Vec<_>>();
                self.roll_back(&applied_keys).await;

                return Err(BackendError::PartialWrite {
                    err: format!(
                        "chunk {index} of {} failed and earlier chunks were rolled back: {err}",
                        operations.chunks(MAX_TXN_OPS).count()
                    ),
                });
            }
        }

        Ok(())
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }

        let operations = keys
            .iter()
            .map(|key| TxnOp::delete(key))
            .collect::<Vec<_>>();

        for (index, chunk) in operations.chunks(MAX_TXN_OPS).enumerate() {
            if let Err(err) = self.transaction(chunk).await {
                if index == 0 {
                    return Err(err);
                }

                // deleted values cannot be restored, only report
                return Err(BackendError::PartialWrite {
                    err: format!("delete chunk {index} failed: {err}"),
                });
            }
        }

        Ok(())
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let mut request = self
            .http
            .get(self.endpoint(&format!("v1/kv/{prefix}"))?)
            .query(&[("recurse", "true")]);
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token.unsecure());
        }

        let response = request.send().await.map_err(|err| BackendError::Unavailable {
            err: err.to_string(),
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }
        if !response.status().is_success() {
            return Err(BackendError::Unavailable {
                err: format!("consul answered with {}", response.status()),
            });
        }

        let pairs = response
            .json::<Vec<KvPair>>()
            .await
            .map_err(|err| BackendError::InvalidData {
                err: err.to_string(),
            })?;

        let mut tree = BTreeMap::new();
        for pair in pairs {
            let Some(value) = pair.value else {
                continue;
            };
            let raw = BASE64_STANDARD
                .decode(&value)
                .map_err(|err| BackendError::InvalidData {
                    err: format!("cannot decode value of {}: {err}", pair.key),
                })?;
            let value = String::from_utf8(raw).map_err(|err| BackendError::InvalidData {
                err: format!("value of {} is not valid UTF-8: {err}", pair.key),
            })?;
            tree.insert(pair.key, value);
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_boundaries_respect_the_transaction_limit() {
        let operations = (0..(MAX_TXN_OPS * 2 + 1))
            .map(|i| TxnOp::set(&format!("key/{i}"), "value"))
            .collect::<Vec<_>>();

        let chunks = operations.chunks(MAX_TXN_OPS).collect::<Vec<_>>();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_TXN_OPS);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn set_operations_carry_base64_values() {
        let operation = TxnOp::set("traefik/http/routers/a/rule", "PathPrefix(`/a`)");

        let json = serde_json::to_value(&operation).unwrap();

        assert_eq!(json["KV"]["Verb"], "set");
        assert_eq!(json["KV"]["Key"], "traefik/http/routers/a/rule");
        assert_eq!(
            json["KV"]["Value"],
            BASE64_STANDARD.encode("PathPrefix(`/a`)")
        );
    }

    #[test]
    fn delete_operations_omit_the_value() {
        let operation = TxnOp::delete("traefik/http/routers/a/rule");

        let json = serde_json::to_value(&operation).unwrap();

        assert_eq!(json["KV"]["Verb"], "delete");
        assert!(json["KV"].get("Value").is_none());
    }
}
