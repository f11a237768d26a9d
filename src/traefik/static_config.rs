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

use crate::backend::file::write_document_atomically;
use crate::config::{BackendSelection, Config, LetsEncryptConfig};
use crate::routing::ConfigDocument;
use crate::traefik::TraefikError;
use url::Url;

/// Builds the static configuration Traefik reads at startup: the public
/// and admin entry points, the API block, the provider pointing at the
/// chosen backend and an optional ACME certificate resolver. Fragments
/// supplied through `extraStaticConfig` are merged last and win on
/// conflict.
pub struct StaticConfigBuilder<'a> {
    config: &'a Config,
}

impl<'a> StaticConfigBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn build(&self) -> Result<ConfigDocument, TraefikError> {
        let entrypoint = self.config.traefik_entrypoint();
        let mut document = ConfigDocument::from_value(
            to_value(serde_json::json!({
                "entryPoints": {
                    entrypoint: {
                        "address": format!(":{}", self.config.public_port()),
                    },
                    "auth_api": {
                        "address": self.config.traefik_api_address(),
                    },
                },
                "api": {
                    "dashboard": true,
                    "insecure": false,
                },
                "ping": {
                    "entryPoint": "auth_api",
                },
            }))?,
        );

        document.merge_from(self.provider_section()?);

        if let Some(letsencrypt) = self.config.letsencrypt() {
            document.merge_from(self.acme_section(letsencrypt)?);
        }

        if let Some(level) = self.config.traefik_log_level() {
            document.merge_from(to_value(serde_json::json!({
                "log": { "level": level },
            }))?);
        }

        if let Some(extra) = self.config.extra_static_config() {
            document.merge_from(extra.clone());
        }

        Ok(document)
    }

    pub async fn write(&self) -> Result<(), TraefikError> {
        let document = self.build()?;
        write_document_atomically(self.config.static_config_file(), &document.as_value())
            .await
            .map_err(|err| TraefikError::ConfigFile {
                path: self.config.static_config_file().to_path_buf(),
                err: err.to_string(),
            })
    }

    fn provider_section(&self) -> Result<serde_value::Value, TraefikError> {
        let root_key = self.config.kv_traefik_prefix();

        let section = match self.config.backend() {
            BackendSelection::Redis(redis) => {
                let mut provider = serde_json::json!({
                    "endpoints": [host_and_port(redis.url())],
                    "rootKey": root_key,
                });
                if let Some(username) = redis.username() {
                    provider["username"] = serde_json::json!(username);
                }
                if let Some(password) = redis.password() {
                    provider["password"] = serde_json::json!(password.unsecure());
                }
                serde_json::json!({ "providers": { "redis": provider } })
            }
            BackendSelection::Etcd(etcd) => {
                let mut provider = serde_json::json!({
                    "endpoints": [host_and_port(etcd.url())],
                    "rootKey": root_key,
                });
                if let Some(username) = etcd.username() {
                    provider["username"] = serde_json::json!(username);
                }
                if let Some(password) = etcd.password() {
                    provider["password"] = serde_json::json!(password.unsecure());
                }
                serde_json::json!({ "providers": { "etcd": provider } })
            }
            BackendSelection::Consul(consul) => {
                let mut provider = serde_json::json!({
                    "endpoints": [host_and_port(consul.url())],
                    "rootKey": root_key,
                });
                if let Some(token) = consul.token() {
                    provider["token"] = serde_json::json!(token.unsecure());
                }
                serde_json::json!({ "providers": { "consul": provider } })
            }
            BackendSelection::File(file) => serde_json::json!({
                "providers": {
                    "file": {
                        "filename": file.dynamic_config_file(),
                        "watch": true,
                    },
                },
            }),
        };

        to_value(section)
    }

    fn acme_section(
        &self,
        letsencrypt: &LetsEncryptConfig,
    ) -> Result<serde_value::Value, TraefikError> {
        // a dedicated challenge port gets its own entry point, otherwise
        // the challenge shares the public one
        let (challenge_entrypoint, mut section) = match letsencrypt.acme_challenge_port() {
            Some(port) => (
                "acme",
                serde_json::json!({
                    "entryPoints": {
                        "acme": { "address": format!(":{port}") },
                    },
                }),
            ),
            None => (
                self.config.traefik_entrypoint(),
                serde_json::json!({}),
            ),
        };

        section["certificatesResolvers"] = serde_json::json!({
            (LetsEncryptConfig::RESOLVER_NAME): {
                "acme": {
                    "email": letsencrypt.email(),
                    "storage": letsencrypt.storage(),
                    "caServer": letsencrypt.acme_server().as_str(),
                    "httpChallenge": { "entryPoint": challenge_entrypoint },
                },
            },
        });

        if !letsencrypt.domains().is_empty() {
            section["entryPoints"][self.config.traefik_entrypoint()]["http"]["tls"] =
                serde_json::json!({
                    "certResolver": LetsEncryptConfig::RESOLVER_NAME,
                    "domains": letsencrypt
                        .domains()
                        .iter()
                        .map(|domain| serde_json::json!({ "main": domain }))
                        .collect::<Vec<_>>(),
                });
        }

        to_value(section)
    }
}

fn host_and_port(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or("127.0.0.1"),
        url.port_or_known_default().unwrap_or(80)
    )
}

fn to_value(value: serde_json::Value) -> Result<serde_value::Value, TraefikError> {
    serde_value::to_value(value).map_err(|err| TraefikError::InvalidApiResponse {
        err: format!("cannot build static configuration: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_value::Value;

    fn string_at(document: &ConfigDocument, path: &str) -> Option<String> {
        document.get(path).and_then(|value| match value {
            Value::String(value) => Some(value.clone()),
            _ => None,
        })
    }

    #[test]
    fn default_configuration_uses_the_file_provider() {
        let config = Config::default();

        let document = StaticConfigBuilder::new(&config).build().unwrap();

        assert_eq!(
            string_at(&document, "entryPoints/http/address"),
            Some(String::from(":8000"))
        );
        assert_eq!(
            string_at(&document, "entryPoints/auth_api/address"),
            Some(String::from("127.0.0.1:8099"))
        );
        assert_eq!(document.get("api/dashboard"), Some(&Value::Bool(true)));
        assert_eq!(document.get("api/insecure"), Some(&Value::Bool(false)));
        assert_eq!(
            string_at(&document, "ping/entryPoint"),
            Some(String::from("auth_api"))
        );
        assert_eq!(
            string_at(&document, "providers/file/filename"),
            Some(String::from("rules.toml"))
        );
        assert_eq!(
            document.get("providers/file/watch"),
            Some(&Value::Bool(true))
        );
        assert!(document.get("certificatesResolvers").is_none());
    }

    #[test]
    fn redis_provider_points_at_the_traefik_prefix() {
        let config = crate::config_from_str!(
            r#"
            kvTraefikPrefix = 'proxy'

            [backend]
            type = 'Redis'
            url = 'redis://redis.example.com:6380'
            password = 'sekret'
            "#
        );

        let document = StaticConfigBuilder::new(&config).build().unwrap();

        assert_eq!(
            string_at(&document, "providers/redis/endpoints/0"),
            Some(String::from("redis.example.com:6380"))
        );
        assert_eq!(
            string_at(&document, "providers/redis/rootKey"),
            Some(String::from("proxy"))
        );
        assert_eq!(
            string_at(&document, "providers/redis/password"),
            Some(String::from("sekret"))
        );
    }

    #[test]
    fn letsencrypt_adds_a_certificate_resolver() {
        let config = crate::config_from_str!(
            r#"
            [letsencrypt]
            email = 'ops@example.com'
            domains = [ 'hub.example.com' ]
            "#
        );

        let document = StaticConfigBuilder::new(&config).build().unwrap();

        assert_eq!(
            string_at(&document, "certificatesResolvers/letsencrypt/acme/email"),
            Some(String::from("ops@example.com"))
        );
        assert_eq!(
            string_at(
                &document,
                "certificatesResolvers/letsencrypt/acme/httpChallenge/entryPoint"
            ),
            Some(String::from("http"))
        );
        assert_eq!(
            string_at(&document, "entryPoints/http/http/tls/certResolver"),
            Some(String::from("letsencrypt"))
        );
        assert_eq!(
            string_at(&document, "entryPoints/http/http/tls/domains/0/main"),
            Some(String::from("hub.example.com"))
        );
    }

    #[test]
    fn dedicated_challenge_port_gets_its_own_entry_point() {
        let config = crate::config_from_str!(
            r#"
            [letsencrypt]
            email = 'ops@example.com'
            acmeChallengePort = 8600
            "#
        );

        let document = StaticConfigBuilder::new(&config).build().unwrap();

        assert_eq!(
            string_at(&document, "entryPoints/acme/address"),
            Some(String::from(":8600"))
        );
        assert_eq!(
            string_at(
                &document,
                "certificatesResolvers/letsencrypt/acme/httpChallenge/entryPoint"
            ),
            Some(String::from("acme"))
        );
    }

    #[test]
    fn extra_static_config_wins_over_generated_values() {
        let config = crate::config_from_str!(
            r#"
            [extraStaticConfig.api]
            insecure = true

            [extraStaticConfig.accessLog]
            filePath = '/var/log/traefik-access.log'
            "#
        );

        let document = StaticConfigBuilder::new(&config).build().unwrap();

        assert_eq!(document.get("api/insecure"), Some(&Value::Bool(true)));
        assert_eq!(document.get("api/dashboard"), Some(&Value::Bool(true)));
        assert_eq!(
            string_at(&document, "accessLog/filePath"),
            Some(String::from("/var/log/traefik-access.log"))
        );
    }

    #[tokio::test]
    async fn write_serializes_toml_by_extension() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("traefik.toml");
        let config = crate::config_from_str!(&format!(
            r#"
            staticConfigFile = {path:?}
            "#
        ));

        StaticConfigBuilder::new(&config).write().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed = toml::from_str::<toml::Value>(&content).unwrap();

        assert!(parsed.get("entryPoints").is_some());
        assert_eq!(
            parsed["providers"]["file"]["watch"].as_bool(),
            Some(true)
        );
    }
}
