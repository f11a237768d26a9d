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

use crate::backend::{Backend, BackendError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// In-memory backend used by unit tests. Shares its tree across clones so
/// that a restarted controller observes the state of the previous one.
#[derive(Clone, Default)]
pub struct DummyBackend {
    tree: Arc<Mutex<BTreeMap<String, String>>>,
    failure: Arc<Mutex<Option<BackendError>>>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> BTreeMap<String, String> {
        self.tree.lock().unwrap().clone()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.tree
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Every following operation fails with the given error until
    /// [`clear_failure`](Self::clear_failure) is called.
    pub fn fail_with(&self, error: BackendError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    fn take_failure(&self) -> Option<BackendError> {
        self.failure.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for DummyBackend {
    async fn atomic_set(&self, entries: BTreeMap<String, String>) -> Result<(), BackendError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        self.tree.lock().unwrap().extend(entries);
        Ok(())
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        let mut tree = self.tree.lock().unwrap();
        for key in keys {
            tree.remove(key);
        }
        Ok(())
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>, BackendError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        Ok(self
            .tree
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
