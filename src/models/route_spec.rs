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

use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Deref;
use std::str::FromStr;

/// A route specification of the form `[host]/path/` that the host uses to
/// identify a route. The stored form is canonical: the path carries exactly
/// one trailing slash so that `/prefix` and `/prefix/` denote the same route.
/// A leading `/` denotes a host-less route; otherwise everything before the
/// first `/` is the host matcher.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouteSpec(String);

impl RouteSpec {
    /// The route that catches every request no other route matches.
    pub fn default_route() -> Self {
        Self(String::from("/"))
    }

    pub fn is_default_route(&self) -> bool {
        self.0 == "/"
    }

    /// The host matcher of the spec, `None` for path-only routes.
    pub fn host(&self) -> Option<&str> {
        if self.0.starts_with('/') {
            None
        } else {
            self.0.split_once('/').map(|(host, _)| host)
        }
    }

    /// The path of the spec, including the canonical trailing slash.
    pub fn path(&self) -> &str {
        match self.0.find('/') {
            Some(index) => &self.0[index..],
            None => "/",
        }
    }

    /// The path as it appears in `PathPrefix` rules and strip-prefix
    /// middlewares: without the trailing slash so that requests for both
    /// `/p` and `/p/…` match. The root path stays `/`.
    pub fn prefix_path(&self) -> &str {
        let path = self.path();
        if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        }
    }

    /// Router priority derived from the spec: longer specs beat shorter
    /// ones, leaving the default route `/` with the lowest priority of 1.
    pub fn priority(&self) -> usize {
        self.0.len()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl FromStr for RouteSpec {
    type Err = RouteSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref INVALID_CHARS_REGEX: Regex = Regex::new("\\s").unwrap();
        }

        if spec.is_empty() {
            return Err(RouteSpecError::Empty);
        }
        if INVALID_CHARS_REGEX.is_match(spec) {
            return Err(RouteSpecError::InvalidChars {
                spec: spec.to_string(),
            });
        }
        if spec.contains("://") {
            return Err(RouteSpecError::ContainsScheme {
                spec: spec.to_string(),
            });
        }

        let mut canonical = spec.to_string();
        if !canonical.ends_with('/') {
            canonical.push('/');
        }

        Ok(RouteSpec(canonical))
    }
}

impl<'de> serde::Deserialize<'de> for RouteSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let spec = String::deserialize(deserializer)?;
        Self::from_str(&spec).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for RouteSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl Deref for RouteSpec {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RouteSpec {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RouteSpecError {
    #[error("Route specifications must not be empty.")]
    Empty,
    #[error("Invalid characters in route specification “{spec}”: whitespace is not allowed.")]
    InvalidChars { spec: String },
    #[error("Route specification “{spec}” must not contain a URL scheme.")]
    ContainsScheme { spec: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/user/alice", "/user/alice/")]
    #[case("/user/alice/", "/user/alice/")]
    #[case("hub.example.com/lab", "hub.example.com/lab/")]
    #[case("hub.example.com", "hub.example.com/")]
    #[case("/", "/")]
    fn canonicalize_trailing_slash(#[case] spec: &str, #[case] expected: &str) {
        let spec = RouteSpec::from_str(spec).unwrap();

        assert_eq!(spec.as_str(), expected);
    }

    #[test]
    fn specs_with_and_without_trailing_slash_are_equal() {
        assert_eq!(
            RouteSpec::from_str("/user/alice").unwrap(),
            RouteSpec::from_str("/user/alice/").unwrap()
        );
    }

    #[test]
    fn path_only_spec_has_no_host() {
        let spec = RouteSpec::from_str("/user/alice/").unwrap();

        assert_eq!(spec.host(), None);
        assert_eq!(spec.path(), "/user/alice/");
        assert_eq!(spec.prefix_path(), "/user/alice");
    }

    #[test]
    fn host_spec_splits_at_first_slash() {
        let spec = RouteSpec::from_str("hub.example.com/lab/").unwrap();

        assert_eq!(spec.host(), Some("hub.example.com"));
        assert_eq!(spec.path(), "/lab/");
        assert_eq!(spec.prefix_path(), "/lab");
    }

    #[test]
    fn host_only_spec_has_root_path() {
        let spec = RouteSpec::from_str("hub.example.com").unwrap();

        assert_eq!(spec.host(), Some("hub.example.com"));
        assert_eq!(spec.path(), "/");
        assert_eq!(spec.prefix_path(), "/");
    }

    #[test]
    fn default_route_keeps_single_slash() {
        let spec = RouteSpec::default_route();

        assert!(spec.is_default_route());
        assert_eq!(spec.host(), None);
        assert_eq!(spec.priority(), 1);
    }

    #[test]
    fn longer_specs_win_on_priority() {
        let default_route = RouteSpec::from_str("/").unwrap();
        let short = RouteSpec::from_str("/a/").unwrap();
        let long = RouteSpec::from_str("/a/b/").unwrap();

        assert!(long.priority() > short.priority());
        assert!(short.priority() > default_route.priority());
    }

    #[rstest]
    #[case("")]
    #[case("/user/ alice/")]
    #[case("/user\t/")]
    #[case("http://example.com/")]
    fn reject_invalid_specs(#[case] spec: &str) {
        assert!(RouteSpec::from_str(spec).is_err());
    }

    #[test]
    fn serde_round_trip_canonicalizes() {
        let spec = serde_json::from_str::<RouteSpec>(r#""/user/alice""#).unwrap();

        assert_eq!(spec.as_str(), "/user/alice/");
        assert_eq!(
            serde_json::to_string(&spec).unwrap(),
            r#""/user/alice/""#.to_string()
        );
    }
}
