// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory lease document.
//!
//! Behaves like the ConfigMap store (versioned, compare-and-swap writes)
//! and can inject outages, conflicts and latency for tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CreateOutcome, Document, DocumentStore, DocumentVersion, WriteOutcome};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    document: Option<(BTreeMap<String, String>, u64)>,
    last_version: u64,
    writes: u64,
    failures: u32,
    conflicts: u32,
    latency: Duration,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(StoreError::Rejected("injected failure".to_string()));
        }
        Ok(())
    }
}

/// A versioned document held in memory.
#[derive(Debug)]
pub struct MemoryStore {
    location: String,
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates a store with no document.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Creates a store whose document already holds `data`.
    pub fn with_data(location: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        let mut state = State::default();
        let version = state.bump();
        state.document = Some((data, version));
        Self {
            location: location.into(),
            state: Mutex::new(state),
        }
    }

    /// Makes the next `n` store calls fail.
    pub async fn inject_failures(&self, n: u32) {
        self.state.lock().await.failures = n;
    }

    /// Makes the next `n` replaces lose the race against another writer.
    pub async fn inject_conflicts(&self, n: u32) {
        self.state.lock().await.conflicts = n;
    }

    /// Delays every store call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Number of successful creates and replaces.
    pub async fn writes(&self) -> u64 {
        self.state.lock().await.writes
    }

    /// Current document contents, if the document exists.
    pub async fn snapshot(&self) -> Option<BTreeMap<String, String>> {
        self.state.lock().await.document.as_ref().map(|(data, _)| data.clone())
    }

    /// Writes one entry unconditionally, as an outside writer would.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state.lock().await;
        let version = state.bump();
        let mut data = state.document.take().map(|(data, _)| data).unwrap_or_default();
        data.insert(key.into(), value.into());
        state.document = Some((data, version));
    }

    /// Deletes the whole document.
    pub async fn delete(&self) {
        self.state.lock().await.document = None;
    }

    async fn pause(&self) {
        let latency = self.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn parse_version(version: &DocumentVersion) -> Option<u64> {
    version.as_str().parse().ok()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn location(&self) -> String {
        self.location.clone()
    }

    async fn get(&self) -> Result<Option<Document>, StoreError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.document.as_ref().map(|(data, version)| Document {
            data: data.clone(),
            version: DocumentVersion::new(version.to_string()),
        }))
    }

    async fn create(&self, data: BTreeMap<String, String>) -> Result<CreateOutcome, StoreError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_failure()?;
        if state.document.is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let version = state.bump();
        state.document = Some((data.clone(), version));
        state.writes += 1;
        Ok(CreateOutcome::Created(Document {
            data,
            version: DocumentVersion::new(version.to_string()),
        }))
    }

    async fn replace(
        &self,
        data: BTreeMap<String, String>,
        version: &DocumentVersion,
    ) -> Result<WriteOutcome, StoreError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_failure()?;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            // Another writer got there first.
            let current = state.bump();
            if let Some((_, v)) = state.document.as_mut() {
                *v = current;
            }
            return Ok(WriteOutcome::Conflict);
        }

        let current = state.document.as_ref().map(|(_, v)| *v);
        if current.is_none() || current != parse_version(version) {
            return Ok(WriteOutcome::Conflict);
        }

        let next = state.bump();
        state.document = Some((data, next));
        state.writes += 1;
        Ok(WriteOutcome::Written(DocumentVersion::new(next.to_string())))
    }
}
