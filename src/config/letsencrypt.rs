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

use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Automatic HTTPS through an ACME certificate resolver. When enabled the
/// static configuration carries a `certificatesResolvers.letsencrypt.acme`
/// block and every generated router requests certificates through it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LetsEncryptConfig {
    email: String,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default = "LetsEncryptConfig::default_acme_server")]
    acme_server: Url,
    #[serde(default)]
    acme_challenge_port: Option<u16>,
    #[serde(default = "LetsEncryptConfig::default_storage")]
    storage: PathBuf,
}

impl LetsEncryptConfig {
    fn default_acme_server() -> Url {
        Url::parse("https://acme-v02.api.letsencrypt.org/directory").unwrap()
    }

    fn default_storage() -> PathBuf {
        PathBuf::from("acme.json")
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn acme_server(&self) -> &Url {
        &self.acme_server
    }

    /// Port the HTTP-01 challenge listens on; `None` reuses the public
    /// entry point.
    pub fn acme_challenge_port(&self) -> Option<u16> {
        self.acme_challenge_port
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub const RESOLVER_NAME: &'static str = "letsencrypt";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_uses_the_production_directory() {
        let config = toml::from_str::<LetsEncryptConfig>(
            r#"
            email = 'ops@example.com'
            "#,
        )
        .unwrap();

        assert_eq!(config.email(), "ops@example.com");
        assert_eq!(
            config.acme_server().as_str(),
            "https://acme-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(config.acme_challenge_port(), None);
    }

    #[test]
    fn parse_staging_config() {
        let config = toml::from_str::<LetsEncryptConfig>(
            r#"
            email = 'ops@example.com'
            domains = [ 'hub.example.com' ]
            acmeServer = 'https://acme-staging-v02.api.letsencrypt.org/directory'
            acmeChallengePort = 8600
            "#,
        )
        .unwrap();

        assert_eq!(config.domains(), ["hub.example.com"]);
        assert_eq!(config.acme_challenge_port(), Some(8600));
    }
}
