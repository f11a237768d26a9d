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

use crate::backend::{with_backoff, Backend, BackendError, ChangeEvent, ChangeStream};
use crate::config::{BackendSelection, Config, ConfigError, LetsEncryptConfig};
use crate::models::{Route, RouteSpec, RouteSpecError};
use crate::routing::{keys, RouteRenderer, TraefikRouterRule};
use crate::routing::ConfigDocument;
use crate::traefik::{
    AdminGateway, ApiCredentials, RouterPresence, StaticConfigBuilder, TraefikApiClient,
    TraefikError, TraefikProcess,
};
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use url::Url;

/// How long `start()` waits for a freshly spawned Traefik to answer its
/// readiness endpoint.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// The routing-table controller: accepts JupyterHub-style route mutations,
/// projects them onto Traefik's dynamic configuration in the chosen
/// backend, optionally supervises an embedded Traefik child and confirms
/// every mutation against the live router set.
pub struct TraefikProxy {
    config: Config,
    backend: Arc<dyn Backend>,
    gateway: Box<dyn AdminGateway>,
    renderer: RouteRenderer,
    credentials: ApiCredentials,
    state: RwLock<Lifecycle>,
    /// Mirror of the index sub-tree, rebuilt from the backend on start,
    /// updated by every mutation and refreshed through the backend's
    /// change notifications; lookups never wait for the backend.
    routes: Arc<RwLock<HashMap<RouteSpec, Route>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// One mutex per spec serializes concurrent mutations of the same
    /// route; distinct specs interleave freely.
    spec_locks: Mutex<HashMap<RouteSpec, Arc<Mutex<()>>>>,
    /// Held (shared) by in-flight mutations so that `stop()` can wait for
    /// them to drain.
    operations: RwLock<()>,
    process: Mutex<Option<TraefikProcess>>,
}

impl TraefikProxy {
    /// Creates the controller and connects to the configured backend.
    /// Nothing is written and Traefik is not spawned before
    /// [`start`](Self::start).
    pub async fn new(config: Config) -> Result<Self, ProxyError> {
        config.validate()?;

        let backend: Arc<dyn Backend> = match config.backend() {
            BackendSelection::Redis(redis) => Arc::new(crate::backend::RedisBackend::new(redis)?),
            BackendSelection::Etcd(etcd) => {
                Arc::new(crate::backend::EtcdBackend::connect(etcd).await?)
            }
            BackendSelection::Consul(consul) => {
                warn!("The consul backend is deprecated, prefer the redis backend.");
                #[allow(deprecated)]
                let consul = crate::backend::ConsulBackend::new(consul)?;
                Arc::new(consul)
            }
            BackendSelection::File(file) => Arc::new(
                crate::backend::FileBackend::load(
                    file,
                    config.kv_jupyterhub_prefix(),
                    config.kv_traefik_prefix(),
                )
                .await?,
            ),
        };

        let credentials = ApiCredentials::from_config(&config).map_err(|err| {
            ProxyError::InvalidConfiguration {
                err: err.to_string(),
            }
        })?;
        let gateway = Box::new(TraefikApiClient::new(
            config.traefik_api_url().clone(),
            &credentials,
            config.traefik_api_validate_cert(),
        )?);

        Ok(Self::assemble(config, backend, gateway, credentials))
    }

    fn assemble(
        config: Config,
        backend: Arc<dyn Backend>,
        gateway: Box<dyn AdminGateway>,
        credentials: ApiCredentials,
    ) -> Self {
        let renderer = RouteRenderer::new(
            config.kv_jupyterhub_prefix().to_string(),
            config.kv_traefik_prefix().to_string(),
            config.traefik_entrypoint().to_string(),
            config
                .letsencrypt()
                .map(|_| LetsEncryptConfig::RESOLVER_NAME.to_string()),
        );

        Self {
            config,
            backend,
            gateway,
            renderer,
            credentials,
            state: RwLock::new(Lifecycle::New),
            routes: Arc::new(RwLock::new(HashMap::new())),
            watcher: Mutex::new(None),
            spec_locks: Mutex::new(HashMap::new()),
            operations: RwLock::new(()),
            process: Mutex::new(None),
        }
    }

    /// Brings the controller into the `running` state: rebuilds the route
    /// cache from the backend, seeds the admin-API routers, renders the
    /// static configuration and spawns Traefik (unless externally
    /// managed), and waits for readiness.
    pub async fn start(&self) -> Result<(), ProxyError> {
        self.transition(Lifecycle::New, Lifecycle::Starting).await?;

        match self.start_inner().await {
            Ok(()) => {
                *self.state.write().await = Lifecycle::Running;
                info!("Controller is running");
                Ok(())
            }
            Err(err) => {
                *self.state.write().await = Lifecycle::Stopped;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), ProxyError> {
        let index_prefix = keys::index_prefix(self.config.kv_jupyterhub_prefix());
        let routes = with_backoff("read index", self.config.retry(), || {
            Self::read_index(&self.backend, self.config.kv_jupyterhub_prefix())
        })
        .await?;
        info!("Restored {} routes from the backend", routes.len());
        *self.routes.write().await = routes;

        // other controllers may mutate the same backend; their changes
        // arrive through the watch stream where the backend offers one
        match self.backend.watch(&index_prefix).await {
            Ok(Some(stream)) => {
                *self.watcher.lock().await = Some(self.spawn_index_watcher(stream));
            }
            Ok(None) => {
                debug!("Backend offers no change notifications, relying on local writes only");
            }
            Err(err) => {
                warn!("Cannot watch the index sub-tree: {err}");
            }
        }

        let mut seed = self
            .renderer
            .render_api_access(&self.credentials.username, &self.credentials.hashed_password);
        if let Some(extra) = self.config.extra_dynamic_config() {
            let extra = ConfigDocument::from_value(extra.clone());
            for (path, value) in extra.flatten() {
                seed.set
                    .insert(format!("{}/{path}", self.config.kv_traefik_prefix()), value);
            }
        }
        with_backoff("seed dynamic configuration", self.config.retry(), || {
            self.backend.atomic_set(seed.set.clone())
        })
        .await?;

        if self.config.should_start() {
            StaticConfigBuilder::new(&self.config)
                .write()
                .await
                .map_err(|err| ProxyError::StartupFailed {
                    err: err.to_string(),
                })?;

            let process = TraefikProcess::spawn(
                self.config.traefik_path(),
                self.config.static_config_file(),
            )
            .map_err(|err| ProxyError::StartupFailed {
                err: err.to_string(),
            })?;

            if let Err(err) = self.gateway.wait_until_ready(STARTUP_TIMEOUT).await {
                process.kill().await;
                return Err(ProxyError::StartupFailed {
                    err: err.to_string(),
                });
            }

            *self.process.lock().await = Some(process);
        }

        // the admin API schema differs between v2 and v3, probe once so
        // that the convergence waiter can branch
        match self.gateway.version().await {
            Ok(version) => debug!("Managing a traefik {version:?} instance"),
            Err(err) => debug!("Cannot determine traefik version yet: {err}"),
        }

        Ok(())
    }

    /// Applies index changes made by other controllers to the in-memory
    /// mirror. Events that cannot be attributed to a single index entry
    /// (the file backend only reports that the document changed) trigger a
    /// full resync.
    fn spawn_index_watcher(&self, mut stream: ChangeStream) -> JoinHandle<()> {
        let routes = Arc::clone(&self.routes);
        let backend = Arc::clone(&self.backend);
        let jupyterhub_prefix = self.config.kv_jupyterhub_prefix().to_string();
        let index_prefix = keys::index_prefix(&jupyterhub_prefix);

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    ChangeEvent::Delete { key } => {
                        if let Ok(spec) = keys::route_spec_from_index_key(&jupyterhub_prefix, &key)
                        {
                            debug!("Index entry of {spec} disappeared from the backend");
                            routes.write().await.remove(&spec);
                        }
                    }
                    ChangeEvent::Put { key } => {
                        match keys::route_spec_from_index_key(&jupyterhub_prefix, &key) {
                            Ok(spec) => {
                                let value = backend
                                    .get_tree(&key)
                                    .await
                                    .ok()
                                    .and_then(|tree| tree.get(&key).cloned());
                                if let Some(route) = value
                                    .as_deref()
                                    .and_then(|value| serde_json::from_str::<Route>(value).ok())
                                {
                                    routes.write().await.insert(spec, route);
                                }
                            }
                            Err(_) => match Self::read_index(&backend, &jupyterhub_prefix).await {
                                Ok(resynced) => {
                                    *routes.write().await = resynced;
                                }
                                Err(err) => {
                                    warn!("Cannot resync routes below {index_prefix}: {err}");
                                }
                            },
                        }
                    }
                }
            }
        })
    }

    /// Reads and decodes the whole index sub-tree; unreadable entries are
    /// skipped so that one corrupt key cannot take the controller down.
    async fn read_index(
        backend: &Arc<dyn Backend>,
        jupyterhub_prefix: &str,
    ) -> Result<HashMap<RouteSpec, Route>, BackendError> {
        let tree = backend
            .get_tree(&keys::index_prefix(jupyterhub_prefix))
            .await?;

        let mut routes = HashMap::with_capacity(tree.len());
        for (key, value) in tree {
            let spec = match keys::route_spec_from_index_key(jupyterhub_prefix, &key) {
                Ok(spec) => spec,
                Err(err) => {
                    warn!("Skipping unreadable index entry {key}: {err}");
                    continue;
                }
            };
            match serde_json::from_str::<Route>(&value) {
                Ok(route) => {
                    routes.insert(spec, route);
                }
                Err(err) => {
                    warn!("Skipping corrupt index entry for {spec}: {err}");
                }
            }
        }

        Ok(routes)
    }

    /// Tears the controller down: waits for in-flight mutations to drain
    /// (bounded by the grace period) and stops the embedded Traefik. The
    /// backend is left untouched, other controllers may still be running
    /// against it.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        self.transition(Lifecycle::Running, Lifecycle::Stopping)
            .await?;

        if tokio::time::timeout(self.config.stop_grace_period(), self.operations.write())
            .await
            .is_err()
        {
            warn!("In-flight mutations did not drain before shutdown, proceeding anyway");
        }

        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }

        if let Some(process) = self.process.lock().await.take() {
            process.stop(self.config.stop_grace_period()).await;
        }

        *self.state.write().await = Lifecycle::Stopped;
        info!("Controller is stopped");
        Ok(())
    }

    /// Adds the route or replaces the route with the same canonical spec.
    /// Returns once the change is persisted and observable in the live
    /// router set.
    pub async fn add_route(
        &self,
        routespec: &str,
        target: &str,
        data: serde_json::Value,
    ) -> Result<(), ProxyError> {
        let spec = RouteSpec::from_str(routespec)?;
        let target = Url::parse(target).map_err(|err| ProxyError::InvalidTargetUrl {
            url: target.to_string(),
            err: err.to_string(),
        })?;
        self.ensure_running().await?;

        let _operation = self.operations.read().await;
        let lock = self.spec_lock(&spec).await;
        let _guard = lock.lock().await;

        info!("Adding route {spec} -> {target}");
        let route = Route::new(spec.clone(), target, data);
        let change = self
            .renderer
            .render_add(&route)
            .map_err(|err| ProxyError::Internal {
                err: format!("cannot serialize route {spec}: {err}"),
            })?;

        with_backoff("delete stale keys", self.config.retry(), || {
            self.backend.atomic_delete(&change.delete)
        })
        .await?;
        with_backoff("write route", self.config.retry(), || {
            self.backend.atomic_set(change.set.clone())
        })
        .await?;

        self.routes.write().await.insert(spec.clone(), route);

        let rule = TraefikRouterRule::for_route_spec(&spec);
        self.gateway
            .wait_for_router(
                &keys::router_name(&spec),
                Some(&rule),
                RouterPresence::Present,
                self.config.check_route_timeout(),
            )
            .await
            .map_err(|_| ProxyError::RouteNotConverged {
                spec: spec.to_string(),
                timeout: self.config.check_route_timeout(),
            })
    }

    /// Deletes the route. Deleting a route that does not exist is a
    /// successful no-op.
    pub async fn delete_route(&self, routespec: &str) -> Result<(), ProxyError> {
        let spec = RouteSpec::from_str(routespec)?;
        self.ensure_running().await?;

        let _operation = self.operations.read().await;
        let lock = self.spec_lock(&spec).await;
        let _guard = lock.lock().await;

        info!("Deleting route {spec}");
        let change = self.renderer.render_delete(&spec);

        with_backoff("delete route", self.config.retry(), || {
            self.backend.atomic_delete(&change.delete)
        })
        .await?;

        self.routes.write().await.remove(&spec);

        self.gateway
            .wait_for_router(
                &keys::router_name(&spec),
                None,
                RouterPresence::Absent,
                self.config.check_route_timeout(),
            )
            .await
            .map_err(|_| ProxyError::RouteNotConverged {
                spec: spec.to_string(),
                timeout: self.config.check_route_timeout(),
            })
    }

    /// Looks the route up by its canonical spec. Reads are served from the
    /// in-memory mirror and never wait for the backend.
    pub async fn get_route(&self, routespec: &str) -> Result<Option<Route>, ProxyError> {
        let spec = RouteSpec::from_str(routespec)?;

        Ok(self.routes.read().await.get(&spec).cloned())
    }

    /// A snapshot of the whole routing table. Concurrent mutations may or
    /// may not be reflected.
    pub async fn get_all_routes(&self) -> Result<HashMap<RouteSpec, Route>, ProxyError> {
        Ok(self.routes.read().await.clone())
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.state.read().await
    }

    async fn transition(&self, expected: Lifecycle, next: Lifecycle) -> Result<(), ProxyError> {
        let mut state = self.state.write().await;
        if *state != expected {
            return Err(ProxyError::LifecycleViolation { state: *state });
        }

        debug!("Controller transitions from {state} to {next}");
        *state = next;
        Ok(())
    }

    async fn ensure_running(&self) -> Result<(), ProxyError> {
        let state = self.state.read().await;
        if *state != Lifecycle::Running {
            return Err(ProxyError::LifecycleViolation { state: *state });
        }
        Ok(())
    }

    async fn spec_lock(&self, spec: &RouteSpec) -> Arc<Mutex<()>> {
        let mut locks = self.spec_locks.lock().await;
        locks.entry(spec.clone()).or_default().clone()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Lifecycle::New => "new",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        };
        write!(f, "{state}")
    }
}

/// Defines error cases of the [`TraefikProxy`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid route specification: {err}")]
    InvalidRouteSpec {
        #[from]
        err: RouteSpecError,
    },
    #[error("Invalid target URL “{url}”: {err}")]
    InvalidTargetUrl { url: String, err: String },
    #[error("Invalid configuration: {err}")]
    InvalidConfiguration { err: String },
    /// The backend kept failing after bounded retries.
    #[error("Cannot interact with the configuration backend: {err}")]
    BackendUnavailable { err: String },
    /// The Consul backend applied only part of a chunked transaction.
    #[error("The configuration backend applied the change only partially: {err}")]
    PartialWrite { err: String },
    #[error("Cannot start traefik: {err}")]
    StartupFailed { err: String },
    /// The backend write is not rolled back; the route will usually appear
    /// once Traefik catches up and the caller may simply retry the wait.
    #[error("Route {spec} was written but traefik did not reflect it within {timeout:?}")]
    RouteNotConverged { spec: String, timeout: Duration },
    #[error("Operation not permitted while the controller is in the {state} state")]
    LifecycleViolation { state: Lifecycle },
    #[error("Internal error (please, contact the administrator of the system): {err}")]
    Internal { err: String },
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::PartialWrite { err } => ProxyError::PartialWrite { err },
            err => ProxyError::BackendUnavailable {
                err: err.to_string(),
            },
        }
    }
}

impl From<ConfigError> for ProxyError {
    fn from(err: ConfigError) -> Self {
        ProxyError::InvalidConfiguration {
            err: err.to_string(),
        }
    }
}

impl From<TraefikError> for ProxyError {
    fn from(err: TraefikError) -> Self {
        match err {
            TraefikError::NotConverged { router, timeout } => ProxyError::RouteNotConverged {
                spec: router,
                timeout,
            },
            err => ProxyError::StartupFailed {
                err: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Dummy;
    use async_trait::async_trait;

    /// Gateway double that reports immediate convergence, standing in for
    /// a live Traefik.
    struct ImmediateGateway;

    #[async_trait]
    impl AdminGateway for ImmediateGateway {
        async fn wait_until_ready(&self, _timeout: Duration) -> Result<(), TraefikError> {
            Ok(())
        }

        async fn wait_for_router(
            &self,
            _router_name: &str,
            _expected_rule: Option<&TraefikRouterRule>,
            _presence: RouterPresence,
            _timeout: Duration,
        ) -> Result<(), TraefikError> {
            Ok(())
        }

        async fn version(&self) -> Result<crate::traefik::TraefikVersion, TraefikError> {
            Ok(crate::traefik::TraefikVersion::V3)
        }
    }

    fn proxy_on(backend: Dummy) -> TraefikProxy {
        let config = crate::config_from_str!(
            r#"
            shouldStart = false
            traefikApiHashedPassword = '$2y$05$abcdefghijklmnopqrstuv'
            "#
        );
        let credentials = ApiCredentials::from_config(&config).unwrap();
        TraefikProxy::assemble(
            config,
            Arc::new(backend),
            Box::new(ImmediateGateway),
            credentials,
        )
    }

    async fn running_proxy_on(backend: Dummy) -> TraefikProxy {
        let proxy = proxy_on(backend);
        proxy.start().await.unwrap();
        proxy
    }

    #[tokio::test]
    async fn reject_mutations_before_start() {
        let proxy = proxy_on(Dummy::new());

        let result = proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await;

        assert!(matches!(
            result,
            Err(ProxyError::LifecycleViolation {
                state: Lifecycle::New
            })
        ));
    }

    #[tokio::test]
    async fn add_and_get_route_under_both_spellings() {
        let proxy = running_proxy_on(Dummy::new()).await;

        proxy
            .add_route(
                "/user/alice/",
                "http://10.0.0.1:8888",
                serde_json::json!({ "hub": "a" }),
            )
            .await
            .unwrap();

        for spelling in ["/user/alice", "/user/alice/"] {
            let route = proxy.get_route(spelling).await.unwrap().unwrap();
            assert_eq!(route.routespec.as_str(), "/user/alice/");
            assert_eq!(route.target.as_str(), "http://10.0.0.1:8888/");
            assert_eq!(route.data, serde_json::json!({ "hub": "a" }));
        }
    }

    #[tokio::test]
    async fn add_route_projects_router_service_and_middleware() {
        let backend = Dummy::new();
        let proxy = running_proxy_on(backend.clone()).await;

        proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await
            .unwrap();

        let tree = backend.tree();
        let name = "jupyterhub_%2Fuser%2Falice%2F";
        assert_eq!(
            tree.get(&format!("traefik/http/routers/{name}/rule")),
            Some(&String::from("PathPrefix(`/user/alice`)"))
        );
        assert_eq!(
            tree.get(&format!("traefik/http/routers/{name}/service")),
            Some(&String::from(name))
        );
        assert_eq!(
            tree.get(&format!(
                "traefik/http/middlewares/{name}_strip/stripPrefix/prefixes/0"
            )),
            Some(&String::from("/user/alice"))
        );
        assert!(tree.contains_key("jupyterhub/routes/%2Fuser%2Falice%2F"));
    }

    #[tokio::test]
    async fn default_route_has_lowest_priority_and_no_middleware() {
        let backend = Dummy::new();
        let proxy = running_proxy_on(backend.clone()).await;

        proxy
            .add_route("/", "http://hub:8081", serde_json::json!({}))
            .await
            .unwrap();
        proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await
            .unwrap();

        let tree = backend.tree();
        let default_priority = tree
            .get("traefik/http/routers/jupyterhub_%2F/priority")
            .and_then(|p| p.parse::<usize>().ok())
            .unwrap();
        let nested_priority = tree
            .get("traefik/http/routers/jupyterhub_%2Fuser%2Falice%2F/priority")
            .and_then(|p| p.parse::<usize>().ok())
            .unwrap();

        assert_eq!(default_priority, 1);
        assert!(nested_priority > default_priority);
        assert!(!tree.contains_key("traefik/http/routers/jupyterhub_%2F/middlewares/0"));
    }

    #[tokio::test]
    async fn replacement_leaves_exactly_one_router_and_service() {
        let backend = Dummy::new();
        let proxy = running_proxy_on(backend.clone()).await;

        proxy
            .add_route("/x/", "http://10.0.0.1:1111", serde_json::json!({}))
            .await
            .unwrap();
        proxy
            .add_route("/x/", "http://10.0.0.2:2222", serde_json::json!({}))
            .await
            .unwrap();

        let route = proxy.get_route("/x/").await.unwrap().unwrap();
        assert_eq!(route.target.as_str(), "http://10.0.0.2:2222/");

        let tree = backend.tree();
        let routers = tree
            .keys()
            .filter(|key| key.starts_with("traefik/http/routers/jupyterhub_%2Fx%2F/"))
            .count();
        assert!(routers > 0);
        assert_eq!(
            tree.get("traefik/http/services/jupyterhub_%2Fx%2F/loadBalancer/servers/0/url"),
            Some(&String::from("http://10.0.0.2:2222/"))
        );
        assert_eq!(
            tree.keys()
                .filter(|key| key.starts_with("traefik/http/services/"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn delete_route_removes_index_and_projection() {
        let backend = Dummy::new();
        let proxy = running_proxy_on(backend.clone()).await;

        proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await
            .unwrap();
        proxy.delete_route("/user/alice").await.unwrap();

        assert_eq!(proxy.get_route("/user/alice/").await.unwrap(), None);
        assert!(!backend
            .tree()
            .keys()
            .any(|key| key.contains("%2Fuser%2Falice%2F")));
    }

    #[tokio::test]
    async fn deleting_a_missing_route_succeeds() {
        let proxy = running_proxy_on(Dummy::new()).await;

        proxy.delete_route("/missing/").await.unwrap();

        assert!(proxy.get_all_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_all_routes_returns_the_added_specs() {
        let proxy = running_proxy_on(Dummy::new()).await;

        proxy
            .add_route("/", "http://hub:8081", serde_json::json!({}))
            .await
            .unwrap();
        proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await
            .unwrap();
        proxy.delete_route("/user/alice/").await.unwrap();

        let routes = proxy.get_all_routes().await.unwrap();

        assert_eq!(routes.len(), 1);
        assert!(routes.contains_key(&RouteSpec::default_route()));
    }

    #[tokio::test]
    async fn restart_recovers_routes_from_the_backend() {
        let backend = Dummy::new();
        let proxy = running_proxy_on(backend.clone()).await;

        proxy
            .add_route(
                "/a/",
                "http://10.0.0.1:8888",
                serde_json::json!({ "hub": "a" }),
            )
            .await
            .unwrap();
        proxy.stop().await.unwrap();

        let restarted = running_proxy_on(backend).await;
        let route = restarted.get_route("/a/").await.unwrap().unwrap();

        assert_eq!(route.target.as_str(), "http://10.0.0.1:8888/");
        assert_eq!(route.data, serde_json::json!({ "hub": "a" }));
    }

    #[tokio::test]
    async fn start_seeds_the_admin_api_routers() {
        let backend = Dummy::new();
        let _proxy = running_proxy_on(backend.clone()).await;

        let tree = backend.tree();
        assert_eq!(
            tree.get("traefik/http/routers/api-access/service"),
            Some(&String::from("api@internal"))
        );
        assert_eq!(
            tree.get("traefik/http/middlewares/api-auth/basicAuth/users/0"),
            Some(&String::from("api_admin:$2y$05$abcdefghijklmnopqrstuv"))
        );
    }

    #[tokio::test]
    async fn invalid_specs_and_targets_are_rejected() {
        let proxy = running_proxy_on(Dummy::new()).await;

        assert!(matches!(
            proxy
                .add_route("spec with spaces", "http://x/", serde_json::json!({}))
                .await,
            Err(ProxyError::InvalidRouteSpec { .. })
        ));
        assert!(matches!(
            proxy
                .add_route("/valid/", "not a url", serde_json::json!({}))
                .await,
            Err(ProxyError::InvalidTargetUrl { .. })
        ));
    }

    #[tokio::test]
    async fn backend_failures_surface_after_retries() {
        let backend = Dummy::new();
        let proxy = {
            let config = crate::config_from_str!(
                r#"
                shouldStart = false
                traefikApiHashedPassword = '$2y$05$abcdefghijklmnopqrstuv'

                [retry]
                attempts = 1
                minDelayMs = 1
                maxDelayMs = 2
                "#
            );
            let credentials = ApiCredentials::from_config(&config).unwrap();
            TraefikProxy::assemble(
                config,
                Arc::new(backend.clone()),
                Box::new(ImmediateGateway),
                credentials,
            )
        };
        proxy.start().await.unwrap();

        backend.fail_with(BackendError::Unavailable {
            err: String::from("connection refused"),
        });

        let result = proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await;

        assert!(matches!(result, Err(ProxyError::BackendUnavailable { .. })));

        backend.clear_failure();
        proxy
            .add_route("/user/alice/", "http://10.0.0.1:8888", serde_json::json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_walks_through_the_states() {
        let proxy = proxy_on(Dummy::new());
        assert_eq!(proxy.lifecycle().await, Lifecycle::New);

        proxy.start().await.unwrap();
        assert_eq!(proxy.lifecycle().await, Lifecycle::Running);

        assert!(matches!(
            proxy.start().await,
            Err(ProxyError::LifecycleViolation { .. })
        ));

        proxy.stop().await.unwrap();
        assert_eq!(proxy.lifecycle().await, Lifecycle::Stopped);

        assert!(matches!(
            proxy
                .add_route("/x/", "http://10.0.0.1:1111", serde_json::json!({}))
                .await,
            Err(ProxyError::LifecycleViolation {
                state: Lifecycle::Stopped
            })
        ));
    }
}
