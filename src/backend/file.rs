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
use crate::config::FileConfig;
use crate::routing::ConfigDocument;
use async_trait::async_trait;
use log::debug;
use serde_value::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

/// Configuration backend that keeps the whole dynamic document in memory
/// and rewrites a single TOML or YAML file atomically (temp file plus
/// rename in the same directory).
///
/// Traefik's file provider reads the entire document, so the projection
/// sits at the document root while the index keeps its prefix as a
/// top-level section the provider does not route on.
pub struct FileBackend {
    path: PathBuf,
    format: FileFormat,
    jupyterhub_prefix: String,
    traefik_prefix: String,
    document: RwLock<ConfigDocument>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileFormat {
    Toml,
    Yaml,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("yaml") | Some("yml") => Self::Yaml,
            _ => Self::Toml,
        }
    }

    fn serialize(&self, value: &Value) -> Result<String, String> {
        match self {
            Self::Toml => toml::to_string_pretty(value).map_err(|err| err.to_string()),
            Self::Yaml => serde_yaml::to_string(value).map_err(|err| err.to_string()),
        }
    }

    fn deserialize(&self, content: &str) -> Result<Value, String> {
        match self {
            Self::Toml => toml::from_str(content).map_err(|err| err.to_string()),
            Self::Yaml => serde_yaml::from_str(content).map_err(|err| err.to_string()),
        }
    }
}

/// Serializes the document in the format matching the path's extension and
/// renames it over the target so that readers never observe a torn file.
pub(crate) async fn write_document_atomically(
    path: &Path,
    value: &Value,
) -> Result<(), BackendError> {
    let format = FileFormat::from_path(path);
    let serialized = format
        .serialize(value)
        .map_err(|err| BackendError::Persistence {
            path: path.to_path_buf(),
            err,
        })?;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        // the temp file must live in the target directory, renames across
        // filesystems are not atomic
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(directory).map_err(|err| {
            BackendError::Persistence {
                path: path.clone(),
                err: err.to_string(),
            }
        })?;
        file.write_all(serialized.as_bytes())
            .map_err(|err| BackendError::Persistence {
                path: path.clone(),
                err: err.to_string(),
            })?;
        file.persist(&path).map_err(|err| BackendError::Persistence {
            path: path.clone(),
            err: err.to_string(),
        })?;
        Ok(())
    })
    .await
    .map_err(|err| BackendError::Persistence {
        path: PathBuf::new(),
        err: err.to_string(),
    })?
}

impl FileBackend {
    pub async fn load(
        config: &FileConfig,
        jupyterhub_prefix: &str,
        traefik_prefix: &str,
    ) -> Result<Self, BackendError> {
        let path = config.dynamic_config_file().to_path_buf();
        let format = FileFormat::from_path(&path);

        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let value = format
                    .deserialize(&content)
                    .map_err(|err| BackendError::InvalidData {
                        err: format!("cannot parse {}: {err}", path.display()),
                    })?;
                debug!("Loaded existing dynamic configuration from {}", path.display());
                ConfigDocument::from_value(value)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigDocument::new(),
            Err(err) => {
                return Err(BackendError::Persistence {
                    path,
                    err: err.to_string(),
                });
            }
        };

        Ok(Self {
            path,
            format,
            jupyterhub_prefix: jupyterhub_prefix.to_string(),
            traefik_prefix: traefik_prefix.to_string(),
            document: RwLock::new(document),
        })
    }

    /// Translates a backend key into a document path: the Traefik
    /// projection loses its prefix because the file provider consumes the
    /// document root, the index keeps its own section.
    fn document_path<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.traefik_prefix.as_str())
            .and_then(|remainder| remainder.strip_prefix('/'))
            .unwrap_or(key)
    }

    fn backend_key(&self, document_path: &str) -> String {
        if document_path.starts_with(self.jupyterhub_prefix.as_str()) {
            document_path.to_string()
        } else {
            format!("{}/{document_path}", self.traefik_prefix)
        }
    }

    async fn persist(&self, document: &ConfigDocument) -> Result<(), BackendError> {
        write_document_atomically(&self.path, &document.as_value()).await
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn atomic_set(&self, entries: BTreeMap<String, String>) -> Result<(), BackendError> {
        let mut document = self.document.write().await;

        // mutate a copy first so that a failed write leaves no key modified
        let mut changed = document.clone();
        for (key, value) in &entries {
            changed.set_coerced(self.document_path(key), value);
        }

        self.persist(&changed).await?;
        *document = changed;
        Ok(())
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        let mut document = self.document.write().await;

        let mut changed = document.clone();
        let mut removed = false;
        for key in keys {
            removed |= changed.remove(self.document_path(key));
        }

        if removed {
            self.persist(&changed).await?;
            *document = changed;
        }
        Ok(())
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let document = self.document.read().await;

        Ok(document
            .flatten()
            .into_iter()
            .map(|(path, value)| (self.backend_key(&path), value))
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<Option<ChangeStream>, BackendError> {
        let path = self.path.clone();
        let prefix = prefix.to_string();
        let mut last_modified = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        let stream = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;

                let modified = tokio::fs::metadata(&path)
                    .await
                    .ok()
                    .and_then(|metadata| metadata.modified().ok());

                if modified != last_modified {
                    last_modified = modified;
                    yield ChangeEvent::Put {
                        key: prefix.clone(),
                    };
                }
            }
        };

        Ok(Some(Box::pin(stream)))
    }
}
