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

use crate::models::{Route, RouteSpec};
use crate::routing::keys;
use crate::routing::rule::TraefikRouterRule;
use serde_value::Value;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// A nested configuration document in Traefik's shape: string keys, scalar
/// leaves, and sequences addressed through numeric path components
/// following [Traefik's KV schema](https://doc.traefik.io/traefik/providers/kv/).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigDocument {
    root: BTreeMap<Value, Value>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Self {
        let mut document = Self::new();
        document.merge_from(value);
        document
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn as_value(&self) -> Value {
        Value::Map(self.root.clone())
    }

    /// Deep-merges `other` into this document. Values of `other` win on
    /// conflicts, maps are merged recursively, everything else is replaced.
    pub fn merge_from(&mut self, other: Value) {
        if let Value::Map(other) = other {
            merge_maps(&mut self.root, other);
        }
    }

    /// Sets a scalar at the given `/`-separated path, creating intermediate
    /// maps and sequences. A path component of digits addresses a sequence
    /// index; indices must be filled in order, as Traefik's KV schema emits
    /// them.
    pub fn set(&mut self, path: &str, scalar: Value) {
        let segments = path.split('/').collect::<Vec<_>>();
        set_in_map(&mut self.root, &segments, scalar);
    }

    /// Sets a scalar from its backend string representation. The file
    /// provider is strictly typed, so integral and boolean payloads must
    /// not be written as quoted strings.
    pub fn set_coerced(&mut self, path: &str, scalar: &str) {
        self.set(path, coerce_scalar(scalar));
    }

    /// Removes the value at the path and prunes maps that became empty.
    /// Returns whether a value was removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let segments = path.split('/').collect::<Vec<_>>();
        remove_in_map(&mut self.root, &segments)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut value: Option<&Value> = None;
        let mut map = Some(&self.root);

        for segment in path.split('/') {
            let current = match (map.take(), value.take()) {
                (Some(map), _) => map.get(&Value::String(segment.to_string())),
                (None, Some(Value::Seq(seq))) => {
                    seq.get(segment.parse::<usize>().ok()?)
                }
                _ => None,
            }?;

            if let Value::Map(inner) = current {
                map = Some(inner);
            }
            value = Some(current);
        }

        value
    }

    /// Flattens the document into `(path, scalar)` pairs. Empty maps and
    /// sequences yield no pairs at all, not a sentinel value.
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut path = VecDeque::new();

        flatten_value(&mut pairs, &Value::Map(self.root.clone()), &mut path);

        pairs
    }

    /// Rebuilds a document from flattened pairs, the inverse of
    /// [`flatten`](Self::flatten).
    pub fn unflatten<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut document = Self::new();
        for (path, scalar) in pairs {
            document.set_coerced(path, scalar);
        }
        document
    }
}

fn merge_maps(own: &mut BTreeMap<Value, Value>, other: BTreeMap<Value, Value>) {
    for (key, other_value) in other {
        match own.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(other_value);
            }
            Entry::Occupied(mut entry) => match (entry.get_mut(), other_value) {
                (Value::Map(own_inner), Value::Map(other_inner)) => {
                    merge_maps(own_inner, other_inner);
                }
                (slot, other_value) => {
                    *slot = other_value;
                }
            },
        }
    }
}

fn set_in_map(map: &mut BTreeMap<Value, Value>, segments: &[&str], scalar: Value) {
    let (segment, remainder) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    let key = Value::String(segment.to_string());

    if remainder.is_empty() {
        map.insert(key, scalar);
        return;
    }

    let child = map.entry(key).or_insert_with(|| empty_container(remainder[0]));
    set_in_value(child, remainder, scalar);
}

fn set_in_value(value: &mut Value, segments: &[&str], scalar: Value) {
    // a non-numeric segment on a sequence means the container shape
    // changed under the same path; start over with a map
    if matches!(value, Value::Seq(_)) && segments[0].parse::<usize>().is_err() {
        *value = Value::Map(BTreeMap::new());
    }

    match value {
        Value::Map(map) => set_in_map(map, segments, scalar),
        Value::Seq(seq) => {
            let (segment, remainder) = match segments.split_first() {
                Some(split) => split,
                None => return,
            };
            let index = match segment.parse::<usize>() {
                Ok(index) => index,
                Err(_) => return,
            };

            while seq.len() <= index {
                seq.push(Value::Unit);
            }

            if remainder.is_empty() {
                seq[index] = scalar;
            } else {
                if !matches!(seq[index], Value::Map(_) | Value::Seq(_)) {
                    seq[index] = empty_container(remainder[0]);
                }
                set_in_value(&mut seq[index], remainder, scalar);
            }
        }
        other => {
            *other = empty_container(segments[0]);
            set_in_value(other, segments, scalar);
        }
    }
}

fn empty_container(next_segment: &str) -> Value {
    if next_segment.bytes().all(|b| b.is_ascii_digit()) && !next_segment.is_empty() {
        Value::Seq(Vec::new())
    } else {
        Value::Map(BTreeMap::new())
    }
}

fn remove_in_map(map: &mut BTreeMap<Value, Value>, segments: &[&str]) -> bool {
    let (segment, remainder) = match segments.split_first() {
        Some(split) => split,
        None => return false,
    };
    let key = Value::String(segment.to_string());

    if remainder.is_empty() {
        return map.remove(&key).is_some();
    }

    let removed = match map.get_mut(&key) {
        Some(Value::Map(inner)) => remove_in_map(inner, remainder),
        Some(Value::Seq(seq)) => remainder[0]
            .parse::<usize>()
            .ok()
            .filter(|index| *index < seq.len())
            .map(|index| {
                if remainder.len() == 1 {
                    seq.remove(index);
                    return true;
                }

                let removed = match &mut seq[index] {
                    Value::Map(inner) => remove_in_map(inner, &remainder[1..]),
                    _ => false,
                };
                if removed && matches!(&seq[index], Value::Map(inner) if inner.is_empty()) {
                    seq.remove(index);
                }
                removed
            })
            .unwrap_or(false),
        _ => false,
    };

    if removed {
        let empty = match map.get(&key) {
            Some(Value::Map(inner)) => inner.is_empty(),
            Some(Value::Seq(seq)) => seq.is_empty(),
            _ => false,
        };
        if empty {
            map.remove(&key);
        }
    }

    removed
}

fn flatten_value(pairs: &mut Vec<(String, String)>, value: &Value, path: &mut VecDeque<String>) {
    match value {
        // An empty mapping produces zero pairs, as does the unit value.
        Value::Unit => {}
        Value::Map(map) => {
            for (key, child) in map {
                path.push_back(scalar_to_string(key));
                flatten_value(pairs, child, path);
                path.pop_back();
            }
        }
        Value::Seq(seq) => {
            for (index, child) in seq.iter().enumerate() {
                path.push_back(index.to_string());
                flatten_value(pairs, child, path);
                path.pop_back();
            }
        }
        Value::Option(inner) => {
            if let Some(inner) = inner {
                flatten_value(pairs, inner, path);
            }
        }
        Value::Newtype(inner) => flatten_value(pairs, inner, path),
        scalar => {
            pairs.push((path_to_string(path), scalar_to_string(scalar)));
        }
    }
}

fn path_to_string(path: &VecDeque<String>) -> String {
    path.iter()
        .cloned()
        .reduce(|acc, segment| format!("{acc}/{segment}"))
        .unwrap_or_default()
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Bool(v) => format!("{v}"),
        Value::U8(v) => format!("{v}"),
        Value::U16(v) => format!("{v}"),
        Value::U32(v) => format!("{v}"),
        Value::U64(v) => format!("{v}"),
        Value::I8(v) => format!("{v}"),
        Value::I16(v) => format!("{v}"),
        Value::I32(v) => format!("{v}"),
        Value::I64(v) => format!("{v}"),
        Value::F32(v) => format!("{v}"),
        Value::F64(v) => format!("{v}"),
        Value::Char(v) => format!("{v}"),
        Value::String(v) => v.clone(),
        _ => String::new(),
    }
}

fn coerce_scalar(scalar: &str) -> Value {
    if let Ok(value) = scalar.parse::<i64>() {
        return Value::I64(value);
    }
    match scalar {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(scalar.to_string()),
    }
}

/// The minimal change a mutation applies to the backend: keys to set and
/// keys to delete. Deletions of missing keys are no-ops by the backend
/// contract, so renderers enumerate them unconditionally to reap orphans
/// that a crashed writer may have left behind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteChange {
    pub set: BTreeMap<String, String>,
    pub delete: Vec<String>,
}

/// Renders routes into the backend key space: one index entry per route
/// under the JupyterHub prefix and its projection onto routers, services
/// and middlewares under the Traefik prefix.
#[derive(Clone, Debug)]
pub struct RouteRenderer {
    jupyterhub_prefix: String,
    traefik_prefix: String,
    entrypoint: String,
    cert_resolver: Option<String>,
}

impl RouteRenderer {
    pub fn new(
        jupyterhub_prefix: String,
        traefik_prefix: String,
        entrypoint: String,
        cert_resolver: Option<String>,
    ) -> Self {
        Self {
            jupyterhub_prefix,
            traefik_prefix,
            entrypoint,
            cert_resolver,
        }
    }

    fn router_key(&self, spec: &RouteSpec, suffix: &str) -> String {
        format!(
            "{}/http/routers/{}/{suffix}",
            self.traefik_prefix,
            keys::router_name(spec)
        )
    }

    fn service_url_key(&self, spec: &RouteSpec) -> String {
        format!(
            "{}/http/services/{}/loadBalancer/servers/0/url",
            self.traefik_prefix,
            keys::router_name(spec)
        )
    }

    fn middleware_prefixes_key(&self, spec: &RouteSpec) -> String {
        format!(
            "{}/http/middlewares/{}/stripPrefix/prefixes/0",
            self.traefik_prefix,
            keys::strip_middleware_name(spec)
        )
    }

    /// Whether the route needs a strip-prefix middleware: only specs with a
    /// non-root path do, otherwise the backend would see a double prefix.
    fn needs_strip_middleware(spec: &RouteSpec) -> bool {
        spec.path() != "/"
    }

    pub fn render_add(&self, route: &Route) -> Result<RouteChange, serde_json::Error> {
        let spec = &route.routespec;
        let mut change = RouteChange::default();

        change.set.insert(
            keys::index_key(&self.jupyterhub_prefix, spec),
            serde_json::to_string(route)?,
        );

        change.set.insert(
            self.router_key(spec, "rule"),
            TraefikRouterRule::for_route_spec(spec).to_string(),
        );
        change
            .set
            .insert(self.router_key(spec, "priority"), spec.priority().to_string());
        change
            .set
            .insert(self.router_key(spec, "service"), keys::router_name(spec));
        change
            .set
            .insert(self.router_key(spec, "entryPoints/0"), self.entrypoint.clone());
        change
            .set
            .insert(self.service_url_key(spec), route.target.to_string());

        if Self::needs_strip_middleware(spec) {
            change.set.insert(
                self.router_key(spec, "middlewares/0"),
                keys::strip_middleware_name(spec),
            );
            change.set.insert(
                self.middleware_prefixes_key(spec),
                spec.prefix_path().to_string(),
            );
        } else {
            change.delete.push(self.router_key(spec, "middlewares/0"));
            change.delete.push(self.middleware_prefixes_key(spec));
        }

        match &self.cert_resolver {
            Some(resolver) => {
                change
                    .set
                    .insert(self.router_key(spec, "tls/certResolver"), resolver.clone());
            }
            None => {
                change.delete.push(self.router_key(spec, "tls/certResolver"));
            }
        }

        Ok(change)
    }

    /// Enumerates every key that may belong to the spec without reading the
    /// backend; keys are a pure function of the spec.
    pub fn render_delete(&self, spec: &RouteSpec) -> RouteChange {
        RouteChange {
            set: BTreeMap::new(),
            delete: vec![
                keys::index_key(&self.jupyterhub_prefix, spec),
                self.router_key(spec, "rule"),
                self.router_key(spec, "priority"),
                self.router_key(spec, "service"),
                self.router_key(spec, "entryPoints/0"),
                self.router_key(spec, "middlewares/0"),
                self.router_key(spec, "tls/certResolver"),
                self.service_url_key(spec),
                self.middleware_prefixes_key(spec),
            ],
        }
    }

    /// Exposes Traefik's internal API and ping services on the `auth_api`
    /// entry point. The API router is guarded by HTTP basic auth with the
    /// given bcrypt user entry; the ping router stays open so that
    /// readiness can be checked without credentials.
    pub fn render_api_access(&self, username: &str, hashed_password: &str) -> RouteChange {
        let mut change = RouteChange::default();
        let tr = &self.traefik_prefix;

        change.set.insert(
            format!("{tr}/http/routers/api-access/rule"),
            String::from("PathPrefix(`/api`)"),
        );
        change.set.insert(
            format!("{tr}/http/routers/api-access/entryPoints/0"),
            String::from("auth_api"),
        );
        change.set.insert(
            format!("{tr}/http/routers/api-access/service"),
            String::from("api@internal"),
        );
        change.set.insert(
            format!("{tr}/http/routers/api-access/middlewares/0"),
            String::from("api-auth"),
        );
        change.set.insert(
            format!("{tr}/http/middlewares/api-auth/basicAuth/users/0"),
            format!("{username}:{hashed_password}"),
        );

        change.set.insert(
            format!("{tr}/http/routers/api-ping/rule"),
            String::from("PathPrefix(`/ping`)"),
        );
        change.set.insert(
            format!("{tr}/http/routers/api-ping/entryPoints/0"),
            String::from("auth_api"),
        );
        change.set.insert(
            format!("{tr}/http/routers/api-ping/service"),
            String::from("ping@internal"),
        );

        change
    }

    /// Projects index entries into a full dynamic document, used by the
    /// file backend and for recovery after a crashed writer.
    pub fn project_from_index<'a, I>(&self, routes: I) -> Result<ConfigDocument, serde_json::Error>
    where
        I: IntoIterator<Item = &'a Route>,
    {
        let mut document = ConfigDocument::new();
        for route in routes {
            for (key, value) in self.render_add(route)?.set {
                document.set_coerced(&key, &value);
            }
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use url::Url;

    fn renderer() -> RouteRenderer {
        RouteRenderer::new(
            String::from("jupyterhub"),
            String::from("traefik"),
            String::from("http"),
            None,
        )
    }

    fn route(spec: &str, target: &str) -> Route {
        Route::new(
            RouteSpec::from_str(spec).unwrap(),
            Url::parse(target).unwrap(),
            serde_json::json!({}),
        )
    }

    #[test]
    fn render_add_for_path_route() {
        let change = renderer()
            .render_add(&route("/user/alice/", "http://10.0.0.1:8888"))
            .unwrap();

        let name = "jupyterhub_%2Fuser%2Falice%2F";
        assert_eq!(
            change.set.get(&format!("traefik/http/routers/{name}/rule")),
            Some(&String::from("PathPrefix(`/user/alice`)"))
        );
        assert_eq!(
            change.set.get(&format!("traefik/http/routers/{name}/priority")),
            Some(&String::from("12"))
        );
        assert_eq!(
            change
                .set
                .get(&format!("traefik/http/routers/{name}/middlewares/0")),
            Some(&format!("{name}_strip"))
        );
        assert_eq!(
            change.set.get(&format!(
                "traefik/http/middlewares/{name}_strip/stripPrefix/prefixes/0"
            )),
            Some(&String::from("/user/alice"))
        );
        assert_eq!(
            change.set.get(&format!(
                "traefik/http/services/{name}/loadBalancer/servers/0/url"
            )),
            Some(&String::from("http://10.0.0.1:8888/"))
        );
        assert!(change
            .set
            .contains_key("jupyterhub/routes/%2Fuser%2Falice%2F"));
    }

    #[test]
    fn render_add_for_default_route_has_no_middleware() {
        let change = renderer()
            .render_add(&route("/", "http://hub:8081"))
            .unwrap();

        let name = "jupyterhub_%2F";
        assert_eq!(
            change.set.get(&format!("traefik/http/routers/{name}/priority")),
            Some(&String::from("1"))
        );
        assert!(!change
            .set
            .contains_key(&format!("traefik/http/routers/{name}/middlewares/0")));
        // stale middleware keys of a crashed writer are reaped
        assert!(change
            .delete
            .contains(&format!("traefik/http/routers/{name}/middlewares/0")));
    }

    #[test]
    fn render_add_for_host_only_route_has_no_middleware() {
        let change = renderer()
            .render_add(&route("hub.example.com/", "http://10.0.0.2:80"))
            .unwrap();

        let name = "jupyterhub_hub.example.com%2F";
        assert_eq!(
            change.set.get(&format!("traefik/http/routers/{name}/rule")),
            Some(&String::from("Host(`hub.example.com`)"))
        );
        assert!(!change
            .set
            .keys()
            .any(|key| key.contains("middlewares") || key.contains("stripPrefix")));
    }

    #[test]
    fn render_add_with_cert_resolver() {
        let renderer = RouteRenderer::new(
            String::from("jupyterhub"),
            String::from("traefik"),
            String::from("http"),
            Some(String::from("letsencrypt")),
        );

        let change = renderer
            .render_add(&route("/user/alice/", "http://10.0.0.1:8888"))
            .unwrap();

        assert_eq!(
            change.set.get(
                "traefik/http/routers/jupyterhub_%2Fuser%2Falice%2F/tls/certResolver"
            ),
            Some(&String::from("letsencrypt"))
        );
    }

    #[test]
    fn render_delete_enumerates_all_keys_of_the_spec() {
        let renderer = renderer();
        let added = renderer
            .render_add(&route("/user/alice/", "http://10.0.0.1:8888"))
            .unwrap();
        let deleted = renderer.render_delete(&RouteSpec::from_str("/user/alice/").unwrap());

        assert!(deleted.set.is_empty());
        for key in added.set.keys() {
            assert!(deleted.delete.contains(key), "missing delete for {key}");
        }
    }

    #[test]
    fn flatten_and_unflatten_round_trip() {
        let mut document = ConfigDocument::new();
        document.set(
            "http/routers/a/rule",
            Value::String(String::from("PathPrefix(`/a`)")),
        );
        document.set("http/routers/a/priority", Value::I64(3));
        document.set(
            "http/routers/a/entryPoints/0",
            Value::String(String::from("http")),
        );
        document.set(
            "http/services/a/loadBalancer/servers/0/url",
            Value::String(String::from("http://10.0.0.1:8888/")),
        );

        let pairs = document.flatten();
        let restored = ConfigDocument::unflatten(
            pairs.iter().map(|(key, value)| (key.as_str(), value.as_str())),
        );

        assert_eq!(restored, document);
    }

    #[test]
    fn flatten_emits_nothing_for_empty_mappings() {
        let mut document = ConfigDocument::new();
        document.set("a/b", Value::Map(BTreeMap::new()));
        document.set("a/c", Value::Seq(Vec::new()));

        assert_eq!(document.flatten(), Vec::new());
    }

    #[test]
    fn merge_lets_the_caller_win() {
        let mut document = ConfigDocument::new();
        document.set("api/dashboard", Value::Bool(true));
        document.set("api/insecure", Value::Bool(false));

        document.merge_from(
            serde_value::to_value(serde_json::json!({
                "api": { "insecure": true },
                "log": { "level": "DEBUG" }
            }))
            .unwrap(),
        );

        assert_eq!(document.get("api/dashboard"), Some(&Value::Bool(true)));
        assert_eq!(document.get("api/insecure"), Some(&Value::Bool(true)));
        assert!(document.get("log/level").is_some());
    }

    #[test]
    fn remove_prunes_empty_parents() {
        let mut document = ConfigDocument::new();
        document.set("http/routers/a/rule", Value::String(String::from("x")));

        assert!(document.remove("http/routers/a/rule"));
        assert!(document.is_empty());
        assert!(!document.remove("http/routers/a/rule"));
    }

    #[test]
    fn coerces_backend_strings_into_typed_scalars() {
        let mut document = ConfigDocument::new();
        document.set_coerced("http/routers/a/priority", "13");
        document.set_coerced("providers/file/watch", "true");
        document.set_coerced("http/routers/a/rule", "PathPrefix(`/a`)");

        assert_eq!(
            document.get("http/routers/a/priority"),
            Some(&Value::I64(13))
        );
        assert_eq!(document.get("providers/file/watch"), Some(&Value::Bool(true)));
        assert_eq!(
            document.get("http/routers/a/rule"),
            Some(&Value::String(String::from("PathPrefix(`/a`)")))
        );
    }

    #[test]
    fn projection_contains_one_router_per_route() {
        let document = renderer()
            .project_from_index(&[
                route("/", "http://hub:8081"),
                route("/user/alice/", "http://10.0.0.1:8888"),
            ])
            .unwrap();

        assert!(document
            .get("traefik/http/routers/jupyterhub_%2F/rule")
            .is_some());
        assert!(document
            .get("traefik/http/routers/jupyterhub_%2Fuser%2Falice%2F/rule")
            .is_some());
        assert_eq!(
            document.get("traefik/http/routers/jupyterhub_%2Fuser%2Falice%2F/priority"),
            Some(&Value::I64(12))
        );
    }
}
