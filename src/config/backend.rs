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

use secstr::SecUtf8;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Selects the configuration backend Traefik reads its dynamic
/// configuration from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BackendSelection {
    Redis(RedisConfig),
    Etcd(EtcdConfig),
    Consul(ConsulConfig),
    File(FileConfig),
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self::File(FileConfig::default())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    #[serde(default = "RedisConfig::default_url")]
    url: Url,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<SecUtf8>,
}

impl RedisConfig {
    fn default_url() -> Url {
        Url::parse("redis://127.0.0.1:6379").unwrap()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&SecUtf8> {
        self.password.as_ref()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    #[serde(default = "EtcdConfig::default_url")]
    url: Url,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<SecUtf8>,
}

impl EtcdConfig {
    fn default_url() -> Url {
        Url::parse("http://127.0.0.1:2379").unwrap()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&SecUtf8> {
        self.password.as_ref()
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsulConfig {
    #[serde(default = "ConsulConfig::default_url")]
    url: Url,
    #[serde(default)]
    token: Option<SecUtf8>,
}

impl ConsulConfig {
    fn default_url() -> Url {
        Url::parse("http://127.0.0.1:8500").unwrap()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn token(&self) -> Option<&SecUtf8> {
        self.token.as_ref()
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            token: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default = "FileConfig::default_dynamic_config_file")]
    dynamic_config_file: PathBuf,
}

impl FileConfig {
    fn default_dynamic_config_file() -> PathBuf {
        PathBuf::from("rules.toml")
    }

    pub fn with_dynamic_config_file(dynamic_config_file: PathBuf) -> Self {
        Self {
            dynamic_config_file,
        }
    }

    pub fn dynamic_config_file(&self) -> &Path {
        &self.dynamic_config_file
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            dynamic_config_file: Self::default_dynamic_config_file(),
        }
    }
}
