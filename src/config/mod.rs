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

pub use backend::{BackendSelection, ConsulConfig, EtcdConfig, FileConfig, RedisConfig};
pub use letsencrypt::LetsEncryptConfig;

use figment::providers::{Env, Format, Toml};
use secstr::SecUtf8;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

mod backend;
mod letsencrypt;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Sub-tree that holds the routing-table index, the source of truth
    /// for lookups.
    #[serde(default = "Config::default_jupyterhub_prefix")]
    kv_jupyterhub_prefix: String,
    /// Sub-tree the Traefik provider reads, a projection of the index.
    #[serde(default = "Config::default_traefik_prefix")]
    kv_traefik_prefix: String,
    #[serde(default)]
    backend: BackendSelection,
    /// URL the public entry point is reachable at; only the port is used
    /// for the listener address.
    #[serde(default = "Config::default_public_url")]
    public_url: Url,
    #[serde(default = "Config::default_entrypoint")]
    traefik_entrypoint: String,
    #[serde(default = "Config::default_api_url")]
    traefik_api_url: Url,
    #[serde(default = "Config::default_api_username")]
    traefik_api_username: String,
    #[serde(default)]
    traefik_api_password: Option<SecUtf8>,
    /// Pre-hashed admin password (bcrypt); takes precedence over the
    /// plaintext password when both are given.
    #[serde(default)]
    traefik_api_hashed_password: Option<String>,
    #[serde(default = "Config::default_true")]
    traefik_api_validate_cert: bool,
    /// When false the controller assumes an externally managed Traefik and
    /// never spawns a child process.
    #[serde(default = "Config::default_true")]
    should_start: bool,
    #[serde(default = "Config::default_traefik_path")]
    traefik_path: PathBuf,
    #[serde(default = "Config::default_static_config_file")]
    static_config_file: PathBuf,
    /// Seconds to wait until a mutation is observable in the live router
    /// set.
    #[serde(default = "Config::default_check_route_timeout")]
    check_route_timeout: u64,
    /// Seconds between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "Config::default_stop_grace_period")]
    stop_grace_period: u64,
    #[serde(default)]
    traefik_log_level: Option<String>,
    #[serde(default)]
    letsencrypt: Option<LetsEncryptConfig>,
    #[serde(default)]
    extra_static_config: Option<serde_value::Value>,
    #[serde(default)]
    extra_dynamic_config: Option<serde_value::Value>,
    #[serde(default)]
    retry: RetryConfig,
}

impl Config {
    fn default_jupyterhub_prefix() -> String {
        String::from("jupyterhub")
    }

    fn default_traefik_prefix() -> String {
        String::from("traefik")
    }

    fn default_public_url() -> Url {
        Url::parse("http://0.0.0.0:8000").unwrap()
    }

    fn default_entrypoint() -> String {
        String::from("http")
    }

    fn default_api_url() -> Url {
        Url::parse("http://127.0.0.1:8099").unwrap()
    }

    fn default_api_username() -> String {
        String::from("api_admin")
    }

    fn default_true() -> bool {
        true
    }

    fn default_traefik_path() -> PathBuf {
        PathBuf::from("traefik")
    }

    fn default_static_config_file() -> PathBuf {
        PathBuf::from("traefik.toml")
    }

    fn default_check_route_timeout() -> u64 {
        60
    }

    fn default_stop_grace_period() -> u64 {
        10
    }

    pub fn from_figment(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = figment::Figment::new()
            .merge(Toml::file(
                config_file.unwrap_or_else(|| Path::new("routier.toml")),
            ))
            .merge(Env::prefixed("ROUTIER_").split("_"))
            .extract::<Config>()?;

        config.validate()?;
        Ok(config)
    }

    /// The two prefixes must name disjoint sub-trees, otherwise deleting a
    /// route could tear keys out of the index.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let jupyterhub = format!("{}/", self.kv_jupyterhub_prefix);
        let traefik = format!("{}/", self.kv_traefik_prefix);

        if jupyterhub.starts_with(&traefik) || traefik.starts_with(&jupyterhub) {
            return Err(ConfigError::OverlappingPrefixes {
                jupyterhub_prefix: self.kv_jupyterhub_prefix.clone(),
                traefik_prefix: self.kv_traefik_prefix.clone(),
            });
        }

        Ok(())
    }

    pub fn kv_jupyterhub_prefix(&self) -> &str {
        &self.kv_jupyterhub_prefix
    }

    pub fn kv_traefik_prefix(&self) -> &str {
        &self.kv_traefik_prefix
    }

    pub fn backend(&self) -> &BackendSelection {
        &self.backend
    }

    pub fn public_url(&self) -> &Url {
        &self.public_url
    }

    pub fn public_port(&self) -> u16 {
        self.public_url.port_or_known_default().unwrap_or(8000)
    }

    pub fn traefik_entrypoint(&self) -> &str {
        &self.traefik_entrypoint
    }

    pub fn traefik_api_url(&self) -> &Url {
        &self.traefik_api_url
    }

    /// Listener address of the admin entry point, derived from the API
    /// URL.
    pub fn traefik_api_address(&self) -> String {
        format!(
            "{}:{}",
            self.traefik_api_url.host_str().unwrap_or("127.0.0.1"),
            self.traefik_api_url.port_or_known_default().unwrap_or(8099)
        )
    }

    pub fn traefik_api_username(&self) -> &str {
        &self.traefik_api_username
    }

    pub fn traefik_api_password(&self) -> Option<&SecUtf8> {
        self.traefik_api_password.as_ref()
    }

    pub fn traefik_api_hashed_password(&self) -> Option<&str> {
        self.traefik_api_hashed_password.as_deref()
    }

    pub fn traefik_api_validate_cert(&self) -> bool {
        self.traefik_api_validate_cert
    }

    pub fn should_start(&self) -> bool {
        self.should_start
    }

    pub fn traefik_path(&self) -> &Path {
        &self.traefik_path
    }

    pub fn static_config_file(&self) -> &Path {
        &self.static_config_file
    }

    pub fn check_route_timeout(&self) -> Duration {
        Duration::from_secs(self.check_route_timeout)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period)
    }

    pub fn traefik_log_level(&self) -> Option<&str> {
        self.traefik_log_level.as_deref()
    }

    pub fn letsencrypt(&self) -> Option<&LetsEncryptConfig> {
        self.letsencrypt.as_ref()
    }

    pub fn extra_static_config(&self) -> Option<&serde_value::Value> {
        self.extra_static_config.as_ref()
    }

    pub fn extra_dynamic_config(&self) -> Option<&serde_value::Value> {
        self.extra_dynamic_config.as_ref()
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kv_jupyterhub_prefix: Self::default_jupyterhub_prefix(),
            kv_traefik_prefix: Self::default_traefik_prefix(),
            backend: BackendSelection::default(),
            public_url: Self::default_public_url(),
            traefik_entrypoint: Self::default_entrypoint(),
            traefik_api_url: Self::default_api_url(),
            traefik_api_username: Self::default_api_username(),
            traefik_api_password: None,
            traefik_api_hashed_password: None,
            traefik_api_validate_cert: true,
            should_start: true,
            traefik_path: Self::default_traefik_path(),
            static_config_file: Self::default_static_config_file(),
            check_route_timeout: Self::default_check_route_timeout(),
            stop_grace_period: Self::default_stop_grace_period(),
            traefik_log_level: None,
            letsencrypt: None,
            extra_static_config: None,
            extra_dynamic_config: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff for transient backend failures.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_attempts")]
    attempts: u32,
    #[serde(default = "RetryConfig::default_min_delay_ms")]
    min_delay_ms: u64,
    #[serde(default = "RetryConfig::default_max_delay_ms")]
    max_delay_ms: u64,
}

impl RetryConfig {
    fn default_attempts() -> u32 {
        5
    }

    fn default_min_delay_ms() -> u64 {
        100
    }

    fn default_max_delay_ms() -> u64 {
        5_000
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            min_delay_ms: Self::default_min_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot load configuration: {err}")]
    CannotLoad {
        #[from]
        err: figment::Error,
    },
    #[error(
        "The prefixes “{jupyterhub_prefix}” and “{traefik_prefix}” overlap; the index and the \
         Traefik projection must live in disjoint sub-trees."
    )]
    OverlappingPrefixes {
        jupyterhub_prefix: String,
        traefik_prefix: String,
    },
}

#[cfg(test)]
#[macro_export]
macro_rules! config_from_str {
    ( $config_str:expr ) => {
        toml::from_str::<$crate::config::Config>($config_str).unwrap()
    };
}
