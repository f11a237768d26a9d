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
use serde::{Deserialize, Serialize};
use url::Url;

/// One entry of the routing table: the specification the host named the
/// route by, the URL the proxy forwards matching requests to, and opaque
/// caller data that round-trips unchanged through the persistence layer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Route {
    pub routespec: RouteSpec,
    pub target: Url,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Route {
    pub fn new(routespec: RouteSpec, target: Url, data: serde_json::Value) -> Self {
        Self {
            routespec,
            target,
            data,
        }
    }
}
