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

use crate::models::RouteSpec;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::str::FromStr;

/// Escape set for backend keys: every byte outside `[A-Za-z0-9._-]` is
/// percent-encoded, including `/`, so that a route specification survives
/// as a single path component in Consul and etcd where slashes are
/// structural. Redis has no such constraint but uses the same scheme for
/// uniformity.
const KEY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

pub fn escape_route_spec(spec: &RouteSpec) -> String {
    utf8_percent_encode(spec.as_str(), KEY_ESCAPE).to_string()
}

pub fn unescape_route_spec(escaped: &str) -> Result<RouteSpec, KeyDecodingError> {
    let decoded = percent_decode_str(escaped)
        .decode_utf8()
        .map_err(|err| KeyDecodingError::InvalidEncoding {
            key: escaped.to_string(),
            err: err.to_string(),
        })?;

    RouteSpec::from_str(&decoded).map_err(|err| KeyDecodingError::InvalidEncoding {
        key: escaped.to_string(),
        err: err.to_string(),
    })
}

/// Name of the router and of the service written for the given spec.
pub fn router_name(spec: &RouteSpec) -> String {
    format!("jupyterhub_{}", escape_route_spec(spec))
}

/// Name of the strip-prefix middleware written for specs with a non-root
/// path.
pub fn strip_middleware_name(spec: &RouteSpec) -> String {
    format!("{}_strip", router_name(spec))
}

/// The sub-tree of the index that holds one entry per route.
pub fn index_prefix(jupyterhub_prefix: &str) -> String {
    format!("{jupyterhub_prefix}/routes")
}

pub fn index_key(jupyterhub_prefix: &str, spec: &RouteSpec) -> String {
    format!(
        "{}/{}",
        index_prefix(jupyterhub_prefix),
        escape_route_spec(spec)
    )
}

pub fn route_spec_from_index_key(
    jupyterhub_prefix: &str,
    key: &str,
) -> Result<RouteSpec, KeyDecodingError> {
    let prefix = index_prefix(jupyterhub_prefix);
    let escaped = key
        .strip_prefix(prefix.as_str())
        .and_then(|remainder| remainder.strip_prefix('/'))
        .ok_or_else(|| KeyDecodingError::ForeignKey {
            key: key.to_string(),
        })?;

    unescape_route_spec(escaped)
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum KeyDecodingError {
    #[error("Key “{key}” does not belong to the routing-table index.")]
    ForeignKey { key: String },
    #[error("Cannot decode key “{key}”: {err}")]
    InvalidEncoding { key: String, err: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/user/alice/", "%2Fuser%2Falice%2F")]
    #[case("/", "%2F")]
    #[case("hub.example.com/lab/", "hub.example.com%2Flab%2F")]
    #[case("/user/weird*name!/", "%2Fuser%2Fweird%2Aname%21%2F")]
    fn escape_known_specs(#[case] spec: &str, #[case] expected: &str) {
        let spec = RouteSpec::from_str(spec).unwrap();

        assert_eq!(escape_route_spec(&spec), expected);
    }

    #[test]
    fn escaped_spec_ends_with_escaped_slash() {
        let spec = RouteSpec::from_str("/user/alice/").unwrap();

        assert!(escape_route_spec(&spec).ends_with("%2F"));
    }

    #[rstest]
    #[case("/user/alice/")]
    #[case("hub.example.com/lab/")]
    #[case("/user/müller/")]
    #[case("/a+b/c&d/")]
    #[case("/")]
    fn escape_round_trip(#[case] spec: &str) {
        let spec = RouteSpec::from_str(spec).unwrap();

        assert_eq!(unescape_route_spec(&escape_route_spec(&spec)), Ok(spec));
    }

    #[test]
    fn escaping_is_injective_for_similar_specs() {
        let specs = ["/a/b/", "/a%2Fb/", "/a.b/", "/a_b/"]
            .iter()
            .map(|spec| escape_route_spec(&RouteSpec::from_str(spec).unwrap()))
            .collect::<std::collections::HashSet<_>>();

        assert_eq!(specs.len(), 4);
    }

    #[test]
    fn index_key_round_trip() {
        let spec = RouteSpec::from_str("/user/alice/").unwrap();
        let key = index_key("jupyterhub", &spec);

        assert_eq!(key, "jupyterhub/routes/%2Fuser%2Falice%2F");
        assert_eq!(route_spec_from_index_key("jupyterhub", &key), Ok(spec));
    }

    #[test]
    fn reject_keys_outside_of_the_index() {
        let result = route_spec_from_index_key("jupyterhub", "traefik/http/routers/x/rule");

        assert!(matches!(result, Err(KeyDecodingError::ForeignKey { .. })));
    }

    #[test]
    fn router_names_for_default_and_nested_routes() {
        let default_route = RouteSpec::default_route();
        let nested = RouteSpec::from_str("/user/alice/").unwrap();

        assert_eq!(router_name(&default_route), "jupyterhub_%2F");
        assert_eq!(router_name(&nested), "jupyterhub_%2Fuser%2Falice%2F");
        assert_eq!(
            strip_middleware_name(&nested),
            "jupyterhub_%2Fuser%2Falice%2F_strip"
        );
    }
}
