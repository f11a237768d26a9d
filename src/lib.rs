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

//! Adapts a JupyterHub-style proxy management API onto the Traefik reverse
//! proxy: routes of the form “host+path prefix → backend URL” are
//! persisted as Traefik dynamic configuration in a file or a key-value
//! store (Redis, etcd, Consul), an optional embedded Traefik child is
//! supervised, and every mutation is confirmed against Traefik's admin
//! API before it is reported as done.

pub mod backend;
pub mod config;
pub mod models;
pub mod proxy;
pub mod routing;
pub mod traefik;

pub use crate::backend::{Backend, BackendError};
pub use crate::config::Config;
pub use crate::models::{Route, RouteSpec};
pub use crate::proxy::{Lifecycle, ProxyError, TraefikProxy};
