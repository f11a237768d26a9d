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

use crate::routing::TraefikRouterRule;
use crate::traefik::{ApiCredentials, TraefikError, TraefikVersion};
use async_trait::async_trait;
use log::{debug, trace};
use secstr::SecUtf8;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Polling starts fast to keep the common case snappy and backs off to a
/// relaxed pace for slow convergence.
const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether the waiter expects the router to show up or to disappear.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouterPresence {
    Present,
    Absent,
}

/// The slice of the admin API the proxy core depends on; the indirection
/// keeps the core testable without a live Traefik.
#[async_trait]
pub trait AdminGateway: Send + Sync {
    async fn wait_until_ready(&self, timeout: Duration) -> Result<(), TraefikError>;

    async fn wait_for_router(
        &self,
        router_name: &str,
        expected_rule: Option<&TraefikRouterRule>,
        presence: RouterPresence,
        timeout: Duration,
    ) -> Result<(), TraefikError>;

    async fn version(&self) -> Result<TraefikVersion, TraefikError>;
}

/// Authenticated client for Traefik's admin API.
pub struct TraefikApiClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: Option<SecUtf8>,
    version: OnceLock<TraefikVersion>,
}

#[derive(Debug, Deserialize)]
struct ApiRouter {
    name: String,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiVersion {
    #[serde(rename = "Version")]
    version: String,
}

impl TraefikApiClient {
    pub fn new(
        base_url: Url,
        credentials: &ApiCredentials,
        validate_cert: bool,
    ) -> Result<Self, TraefikError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!validate_cert)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| TraefikError::Api {
                err: err.to_string(),
            })?;

        Ok(Self {
            http,
            base_url,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            version: OnceLock::new(),
        })
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder, TraefikError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| TraefikError::Api {
                err: format!("cannot build URL for {path}: {err}"),
            })?;

        Ok(self.http.get(url).basic_auth(
            &self.username,
            self.password.as_ref().map(|password| password.unsecure()),
        ))
    }

    async fn routers(&self) -> Result<Vec<ApiRouter>, TraefikError> {
        let response = self
            .get("api/http/routers")?
            .send()
            .await
            .map_err(|err| TraefikError::Api {
                err: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TraefikError::Api {
                err: format!("traefik answered with {}", response.status()),
            });
        }

        response
            .json::<Vec<ApiRouter>>()
            .await
            .map_err(|err| TraefikError::InvalidApiResponse {
                err: err.to_string(),
            })
    }

    async fn ping(&self) -> Result<(), TraefikError> {
        let response = self
            .get("ping")?
            .send()
            .await
            .map_err(|err| TraefikError::Api {
                err: err.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TraefikError::Api {
                err: format!("ping answered with {}", response.status()),
            })
        }
    }

    /// Whether the reported router satisfies the waiter: the name has to
    /// match (admin API names carry an `@provider` suffix) and, when the
    /// rule is parseable, it has to equal the expected one so that a
    /// leftover router of an older controller run does not count.
    fn router_matches(
        router: &ApiRouter,
        router_name: &str,
        expected_rule: Option<&TraefikRouterRule>,
    ) -> bool {
        let name_matches = router.name == router_name
            || router.name.starts_with(&format!("{router_name}@"));

        if !name_matches {
            return false;
        }

        match (expected_rule, &router.rule) {
            (Some(expected), Some(reported)) => match reported.parse::<TraefikRouterRule>() {
                Ok(reported) => reported == *expected,
                Err(_) => true,
            },
            _ => true,
        }
    }

    fn router_enabled(&self, router: &ApiRouter) -> bool {
        match router.status.as_deref() {
            Some(status) => status == "enabled",
            // v2 omits the status on some endpoints, v3 always reports it
            None => self.version.get().copied() == Some(TraefikVersion::V2),
        }
    }
}

#[async_trait]
impl AdminGateway for TraefikApiClient {
    /// Polls the readiness endpoint until Traefik answers.
    async fn wait_until_ready(&self, timeout: Duration) -> Result<(), TraefikError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = INITIAL_POLL_INTERVAL;

        loop {
            match self.ping().await {
                Ok(()) => {
                    debug!("traefik is ready");
                    return Ok(());
                }
                Err(err) => {
                    trace!("traefik not ready yet: {err}");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(TraefikError::NotReady { timeout });
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Polls the router listing until the mutation is observable. Transient
    /// API failures (connection resets, 5xx while Traefik reloads) only
    /// delay the next poll.
    async fn wait_for_router(
        &self,
        router_name: &str,
        expected_rule: Option<&TraefikRouterRule>,
        presence: RouterPresence,
        timeout: Duration,
    ) -> Result<(), TraefikError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = INITIAL_POLL_INTERVAL;

        loop {
            match self.routers().await {
                Ok(routers) => {
                    let live = routers
                        .iter()
                        .find(|router| Self::router_matches(router, router_name, expected_rule));

                    let converged = match presence {
                        RouterPresence::Present => {
                            live.map(|router| self.router_enabled(router)).unwrap_or(false)
                        }
                        RouterPresence::Absent => live.is_none(),
                    };

                    if converged {
                        debug!("Router {router_name} converged to {presence:?}");
                        return Ok(());
                    }
                }
                Err(err) => {
                    trace!("traefik API not answering while waiting for {router_name}: {err}");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(TraefikError::NotConverged {
                    router: router_name.to_string(),
                    timeout,
                });
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// The version is probed once and cached for the lifetime of the
    /// client.
    async fn version(&self) -> Result<TraefikVersion, TraefikError> {
        if let Some(version) = self.version.get() {
            return Ok(*version);
        }

        let response = self
            .get("api/version")?
            .send()
            .await
            .map_err(|err| TraefikError::Api {
                err: err.to_string(),
            })?;

        let payload =
            response
                .json::<ApiVersion>()
                .await
                .map_err(|err| TraefikError::InvalidApiResponse {
                    err: err.to_string(),
                })?;

        let version = payload
            .version
            .parse::<TraefikVersion>()
            .map_err(|err| TraefikError::InvalidApiResponse { err })?;
        debug!("traefik reports version {}", payload.version);

        Ok(*self.version.get_or_init(|| version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RouteSpec;
    use std::str::FromStr;

    fn client() -> TraefikApiClient {
        let credentials = ApiCredentials {
            username: String::from("api_admin"),
            password: Some(SecUtf8::from("sekret")),
            hashed_password: String::from("$2y$05$abcdefghijklmnopqrstuv"),
        };
        TraefikApiClient::new(
            Url::parse("http://127.0.0.1:8099").unwrap(),
            &credentials,
            true,
        )
        .unwrap()
    }

    fn api_router(name: &str, rule: &str, status: Option<&str>) -> ApiRouter {
        ApiRouter {
            name: name.to_string(),
            rule: Some(rule.to_string()),
            status: status.map(str::to_string),
        }
    }

    #[test]
    fn deserialize_router_listing() {
        let routers = serde_json::from_str::<Vec<ApiRouter>>(
            r#"[
                {
                    "entryPoints": ["http"],
                    "service": "jupyterhub_%2Fuser%2Falice%2F",
                    "rule": "PathPrefix(`/user/alice`)",
                    "priority": 12,
                    "status": "enabled",
                    "using": ["http"],
                    "name": "jupyterhub_%2Fuser%2Falice%2F@redis"
                }
            ]"#,
        )
        .unwrap();

        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].name, "jupyterhub_%2Fuser%2Falice%2F@redis");
        assert_eq!(routers[0].status.as_deref(), Some("enabled"));
    }

    #[test]
    fn router_matches_with_provider_suffix() {
        let rule = TraefikRouterRule::for_route_spec(&RouteSpec::from_str("/user/alice/").unwrap());
        let router = api_router(
            "jupyterhub_%2Fuser%2Falice%2F@redis",
            "PathPrefix(`/user/alice`)",
            Some("enabled"),
        );

        assert!(TraefikApiClient::router_matches(
            &router,
            "jupyterhub_%2Fuser%2Falice%2F",
            Some(&rule)
        ));
    }

    #[test]
    fn router_with_different_rule_does_not_match() {
        let rule = TraefikRouterRule::for_route_spec(&RouteSpec::from_str("/user/alice/").unwrap());
        let router = api_router(
            "jupyterhub_%2Fuser%2Falice%2F@redis",
            "PathPrefix(`/user/bob`)",
            Some("enabled"),
        );

        assert!(!TraefikApiClient::router_matches(
            &router,
            "jupyterhub_%2Fuser%2Falice%2F",
            Some(&rule)
        ));
    }

    #[test]
    fn router_of_another_spec_does_not_match() {
        let router = api_router("jupyterhub_%2Fuser%2Fbob%2F@redis", "x", None);

        assert!(!TraefikApiClient::router_matches(
            &router,
            "jupyterhub_%2Fuser%2Falice%2F",
            None
        ));
    }

    #[test]
    fn missing_status_counts_as_enabled_only_for_v2() {
        let client = client();
        let router = api_router("jupyterhub_%2F@file", "PathPrefix(`/`)", None);

        assert!(!client.router_enabled(&router));

        client.version.set(TraefikVersion::V2).unwrap();
        assert!(client.router_enabled(&router));
    }

    #[test]
    fn disabled_router_is_not_enabled() {
        let client = client();
        let router = api_router("jupyterhub_%2F@file", "PathPrefix(`/`)", Some("disabled"));

        assert!(!client.router_enabled(&router));
    }
}
