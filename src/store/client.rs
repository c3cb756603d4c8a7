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

//! Lease-set level access to the document store.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::{CreateOutcome, DocumentStore, DocumentVersion, WriteOutcome};
use crate::error::{LeaseError, Result, StoreError};
use crate::lease::LeaseSet;

/// Default deadline for a single store call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry with jittered exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of read-modify-write attempts per operation.
    pub max_attempts: u32,

    /// Backoff before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given (1-based) failed attempt.
    ///
    /// Doubles per attempt and adds up to 100% jitter, capped at
    /// `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_backoff.saturating_mul(1 << exp);
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        let delay = Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter));
        delay.min(self.max_backoff)
    }
}

/// Reads and conditionally writes the lease set.
///
/// Every store call is bounded by the request timeout. A call that runs
/// out of time is reported as [`StoreError::Timeout`].
#[derive(Debug, Clone)]
pub struct LeaseStoreClient<S> {
    store: S,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<S: DocumentStore> LeaseStoreClient<S> {
    /// Creates a client with the default timeout and retry policy.
    pub fn new(store: S) -> Self {
        Self {
            store,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The retry policy in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn with_deadline<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout).into()),
        }
    }

    /// Reads the lease set without creating the document.
    pub async fn fetch(&self) -> Result<Option<(LeaseSet, DocumentVersion)>> {
        let doc = self.with_deadline(self.store.get()).await?;
        Ok(doc.map(|doc| (LeaseSet::from_data(doc.data), doc.version)))
    }

    /// Reads the lease set, creating an empty document if there is none.
    pub async fn fetch_or_create(&self) -> Result<(LeaseSet, DocumentVersion)> {
        for attempt in 1..=self.retry.max_attempts {
            if let Some(found) = self.fetch().await? {
                return Ok(found);
            }

            tracing::info!(document = %self.store.location(), "lease document not found, creating it");
            match self.with_deadline(self.store.create(Default::default())).await? {
                CreateOutcome::Created(doc) => {
                    return Ok((LeaseSet::from_data(doc.data), doc.version));
                }
                CreateOutcome::AlreadyExists => {
                    tracing::debug!(attempt, "lease document created concurrently, reading again");
                }
            }
        }

        Err(LeaseError::StoreContention {
            attempts: self.retry.max_attempts,
        })
    }

    /// Writes the lease set if the document is still at `version`.
    pub async fn write_if_unchanged(
        &self,
        leases: &LeaseSet,
        version: &DocumentVersion,
    ) -> Result<WriteOutcome> {
        self.with_deadline(self.store.replace(leases.data().clone(), version))
            .await
    }

    /// Creates the document holding `leases`.
    ///
    /// A document created concurrently by someone else is reported as a
    /// conflict, like a stale replace.
    pub async fn create_with(&self, leases: &LeaseSet) -> Result<WriteOutcome> {
        match self.with_deadline(self.store.create(leases.data().clone())).await? {
            CreateOutcome::Created(doc) => Ok(WriteOutcome::Written(doc.version)),
            CreateOutcome::AlreadyExists => Ok(WriteOutcome::Conflict),
        }
    }

    /// Removes the lease stored under `key`.
    ///
    /// A missing document or a missing key is not an error. Returns true
    /// if a lease was removed.
    pub async fn delete_entry(&self, key: &str) -> Result<bool> {
        for attempt in 1..=self.retry.max_attempts {
            let Some(doc) = self.with_deadline(self.store.get()).await? else {
                tracing::debug!(key, "lease document not found, nothing to release");
                return Ok(false);
            };

            let mut leases = LeaseSet::from_data(doc.data);
            if !leases.remove(key) {
                tracing::debug!(key, "no lease held, nothing to release");
                return Ok(false);
            }

            match self.write_if_unchanged(&leases, &doc.version).await? {
                WriteOutcome::Written(_) => return Ok(true),
                WriteOutcome::Conflict => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        key,
                        attempt,
                        backoff = ?backoff,
                        "lease document changed during release, retrying"
                    );
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(LeaseError::StoreContention {
            attempts: self.retry.max_attempts,
        })
    }
}
