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

//! Versioned document storage for the lease set.
//!
//! The lease set lives in a single shared document. Every read returns a
//! [`DocumentVersion`] and every write must present the version it was
//! based on; a stale version is rejected with [`WriteOutcome::Conflict`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod client;
pub mod configmap;
pub mod memory;

pub use client::{LeaseStoreClient, RetryPolicy};
pub use configmap::ConfigMapStore;
pub use memory::MemoryStore;

/// Opaque version token of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentVersion(String);

impl DocumentVersion {
    /// Wraps a store-specific version string.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The raw version string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document contents.
    pub data: BTreeMap<String, String>,
    /// Version the contents were read at.
    pub version: DocumentVersion,
}

/// Result of creating the document.
#[derive(Debug)]
pub enum CreateOutcome {
    /// The document was created.
    Created(Document),
    /// Somebody else created it first.
    AlreadyExists,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write landed; the document is now at the returned version.
    Written(DocumentVersion),
    /// The document changed (or vanished) since it was read.
    Conflict,
}

/// Storage for the shared lease document.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Human readable location of the document, for logs.
    fn location(&self) -> String;

    /// Reads the document. Returns `None` if it does not exist.
    async fn get(&self) -> Result<Option<Document>, StoreError>;

    /// Creates the document with the given contents.
    async fn create(&self, data: BTreeMap<String, String>) -> Result<CreateOutcome, StoreError>;

    /// Replaces the document if it is still at `version`.
    async fn replace(
        &self,
        data: BTreeMap<String, String>,
        version: &DocumentVersion,
    ) -> Result<WriteOutcome, StoreError>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    fn location(&self) -> String {
        (**self).location()
    }

    async fn get(&self) -> Result<Option<Document>, StoreError> {
        (**self).get().await
    }

    async fn create(&self, data: BTreeMap<String, String>) -> Result<CreateOutcome, StoreError> {
        (**self).create(data).await
    }

    async fn replace(
        &self,
        data: BTreeMap<String, String>,
        version: &DocumentVersion,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).replace(data, version).await
    }
}
