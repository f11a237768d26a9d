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

use crate::config::Config;
use log::warn;
use secstr::SecUtf8;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use api::{AdminGateway, RouterPresence, TraefikApiClient};
pub use process::TraefikProcess;
pub use static_config::StaticConfigBuilder;

pub mod api;
pub mod process;
pub mod static_config;

/// Major Traefik version as reported by `GET /api/version`. The admin API
/// schemas of v2 and v3 differ in details, callers branch where they do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraefikVersion {
    V2,
    V3,
}

impl FromStr for TraefikVersion {
    type Err = String;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        match version.trim().trim_start_matches('v').split('.').next() {
            Some("2") => Ok(Self::V2),
            Some("3") => Ok(Self::V3),
            _ => Err(format!("Unknown traefik version “{version}”")),
        }
    }
}

/// Credentials guarding the admin API: the bcrypt entry is embedded into
/// the `basicAuth` middleware of the admin router, the plaintext password
/// is what the controller itself authenticates with.
#[derive(Clone)]
pub struct ApiCredentials {
    pub username: String,
    pub password: Option<SecUtf8>,
    pub hashed_password: String,
}

impl ApiCredentials {
    pub fn from_config(config: &Config) -> Result<Self, TraefikError> {
        let username = config.traefik_api_username().to_string();

        match (
            config.traefik_api_hashed_password(),
            config.traefik_api_password(),
        ) {
            (Some(hashed_password), password) => {
                if password.is_none() {
                    warn!(
                        "Only a hashed traefik API password is configured; the controller cannot \
                         authenticate its own admin API calls without the plaintext password."
                    );
                }
                Ok(Self {
                    username,
                    password: password.cloned(),
                    hashed_password: hashed_password.to_string(),
                })
            }
            (None, Some(password)) => Ok(Self {
                username,
                hashed_password: hash_password(password.unsecure())?,
                password: Some(password.clone()),
            }),
            (None, None) => {
                let generated = uuid::Uuid::new_v4().simple().to_string();
                warn!("No traefik API password configured, generated one for this run.");
                Ok(Self {
                    username,
                    hashed_password: hash_password(&generated)?,
                    password: Some(SecUtf8::from(generated)),
                })
            }
        }
    }

    /// The `user:hash` entry of the `basicAuth` middleware.
    pub fn basic_auth_user_entry(&self) -> String {
        format!("{}:{}", self.username, self.hashed_password)
    }
}

fn hash_password(password: &str) -> Result<String, TraefikError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|err| TraefikError::PasswordHash {
        err: err.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum TraefikError {
    #[error("Cannot reach the traefik API: {err}")]
    Api { err: String },
    #[error("Unexpected payload from the traefik API: {err}")]
    InvalidApiResponse { err: String },
    #[error("Cannot spawn traefik: {err}")]
    Spawn { err: String },
    #[error("traefik did not become ready within {timeout:?}")]
    NotReady { timeout: Duration },
    #[error("Router {router} did not converge within {timeout:?}")]
    NotConverged { router: String, timeout: Duration },
    #[error("Cannot write configuration file {path}: {err}")]
    ConfigFile { path: PathBuf, err: String },
    #[error("Cannot hash the traefik API password: {err}")]
    PasswordHash { err: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2.11.0", TraefikVersion::V2)]
    #[case("v2.10", TraefikVersion::V2)]
    #[case("3.1.2", TraefikVersion::V3)]
    #[case("v3", TraefikVersion::V3)]
    fn parse_version(#[case] reported: &str, #[case] expected: TraefikVersion) {
        assert_eq!(reported.parse::<TraefikVersion>(), Ok(expected));
    }

    #[test]
    fn reject_unknown_versions() {
        assert!("1.7".parse::<TraefikVersion>().is_err());
    }

    #[test]
    fn plaintext_password_is_hashed_with_bcrypt() {
        let config = crate::config_from_str!(
            r#"
            traefikApiPassword = 'sekret'
            "#
        );

        let credentials = ApiCredentials::from_config(&config).unwrap();

        assert!(bcrypt::verify("sekret", &credentials.hashed_password).unwrap());
        assert_eq!(
            credentials.password.as_ref().map(|p| p.unsecure()),
            Some("sekret")
        );
    }

    #[test]
    fn pre_hashed_password_is_used_verbatim() {
        let config = crate::config_from_str!(
            r#"
            traefikApiHashedPassword = '$2y$05$abcdefghijklmnopqrstuv'
            "#
        );

        let credentials = ApiCredentials::from_config(&config).unwrap();

        assert_eq!(
            credentials.hashed_password,
            "$2y$05$abcdefghijklmnopqrstuv"
        );
        assert_eq!(credentials.password, None);
    }

    #[test]
    fn missing_password_generates_one() {
        let credentials = ApiCredentials::from_config(&Config::default()).unwrap();

        let password = credentials.password.unwrap();
        assert!(bcrypt::verify(password.unsecure(), &credentials.hashed_password).unwrap());
    }

    #[test]
    fn basic_auth_entry_contains_username_and_hash() {
        let config = crate::config_from_str!(
            r#"
            traefikApiUsername = 'admin'
            traefikApiHashedPassword = '$2y$05$abcdefghijklmnopqrstuv'
            "#
        );

        let credentials = ApiCredentials::from_config(&config).unwrap();

        assert_eq!(
            credentials.basic_auth_user_entry(),
            "admin:$2y$05$abcdefghijklmnopqrstuv"
        );
    }
}
