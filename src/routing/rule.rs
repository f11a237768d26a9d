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
use pest::Parser;
use std::fmt::Display;
use std::str::FromStr;

/// A [Traefik router rule](https://doc.traefik.io/traefik/routing/routers/#rule)
/// composed of `Host` and `PathPrefix` matchers. Rules are derived
/// deterministically from a [`RouteSpec`] and parsed back from the strings
/// Traefik's admin API reports, which may differ in whitespace from the
/// rendered form.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TraefikRouterRule {
    matches: Vec<Matcher>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Matcher {
    Host { domain: String },
    PathPrefix { path: String },
}

impl TraefikRouterRule {
    /// Derives the rule for a route specification:
    ///
    /// - host-less specs match by path prefix only,
    /// - host specs with a root path match by host only,
    /// - host specs with a path match by host and path prefix.
    pub fn for_route_spec(spec: &RouteSpec) -> Self {
        let mut matches = Vec::with_capacity(2);

        match spec.host() {
            Some(host) => {
                matches.push(Matcher::Host {
                    domain: host.to_string(),
                });
                if spec.path() != "/" {
                    matches.push(Matcher::PathPrefix {
                        path: spec.prefix_path().to_string(),
                    });
                }
            }
            None => {
                matches.push(Matcher::PathPrefix {
                    path: spec.prefix_path().to_string(),
                });
            }
        }

        Self { matches }
    }

    pub fn matches(&self) -> &Vec<Matcher> {
        &self.matches
    }
}

#[derive(pest_derive::Parser)]
#[grammar_inline = r#"
ident = { (ASCII_ALPHANUMERIC | PUNCTUATION)+ }

Root = _{ (Host | PathPrefix) ~ ( " "* ~ "&&" ~ " "* ~ (Host | PathPrefix))* }

Host = { "Host" ~ "(`" ~ ident ~ "`)" }
PathPrefix = { "PathPrefix" ~ "(`" ~ ident ~ "`)" }
"#]
struct RuleParser;

impl FromStr for TraefikRouterRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rule = TraefikRouterRule {
            matches: Vec::new(),
        };

        let pairs = RuleParser::parse(Rule::Root, s).map_err(|e| e.to_string())?;

        for pair in pairs {
            match pair.as_rule() {
                Rule::Host => {
                    let domain = pair
                        .into_inner()
                        .map(|pair| pair.as_str().to_string())
                        .collect::<String>();

                    rule.matches.push(Matcher::Host { domain });
                }
                Rule::PathPrefix => {
                    let path = pair
                        .into_inner()
                        .map(|pair| pair.as_str().to_string())
                        .collect::<String>();

                    rule.matches.push(Matcher::PathPrefix { path });
                }
                Rule::ident | Rule::Root => {}
            }
        }

        Ok(rule)
    }
}

impl Display for TraefikRouterRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, m) in self.matches.iter().enumerate() {
            if i > 0 {
                write!(f, " && ")?;
            }
            match m {
                Matcher::Host { domain } => {
                    write!(f, "Host(`{domain}`)")?;
                }
                Matcher::PathPrefix { path } => {
                    write!(f, "PathPrefix(`{path}`)")?;
                }
            }
        }
        Ok(())
    }
}
