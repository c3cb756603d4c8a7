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

//! Ensure and release of address leases.
//!
//! Each operation is an independent read-modify-write transaction against
//! the lease document. Nothing is shared in process: concurrent callers
//! only meet at the store's compare-and-swap, and the loser re-reads and
//! tries again.

use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus};

use crate::allocator::{choose_free, validate_requested};
use crate::error::{LeaseError, Result};
use crate::lease::{request_key, LeasePort, LeaseRecord, LeaseSet};
use crate::range::AddressRange;
use crate::store::{DocumentStore, LeaseStoreClient, WriteOutcome};

/// A request for an address on behalf of one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseRequest {
    /// Namespace of the service.
    pub namespace: String,

    /// Name of the service.
    pub name: String,

    /// Display name reported as the ingress hostname.
    pub hostname: String,

    /// Ports to expose.
    pub ports: Vec<LeasePort>,

    /// Address asked for explicitly, if any.
    pub requested_address: Option<Ipv4Addr>,

    /// Ingress already reported on the service.
    pub observed: Vec<LoadBalancerIngress>,
}

impl LeaseRequest {
    /// Creates a request for service `namespace/name`, displayed by its name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            hostname: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Sets the ports to expose.
    pub fn with_ports(mut self, ports: Vec<LeasePort>) -> Self {
        self.ports = ports;
        self
    }

    /// Asks for a specific address.
    pub fn with_requested_address(mut self, address: Option<Ipv4Addr>) -> Self {
        self.requested_address = address;
        self
    }

    /// Sets the ingress already observed on the service.
    pub fn with_observed(mut self, observed: Vec<LoadBalancerIngress>) -> Self {
        self.observed = observed;
        self
    }

    /// Key the lease is stored under.
    pub fn key(&self) -> String {
        request_key(&self.namespace, &self.name)
    }

    fn to_record(&self, address: Ipv4Addr) -> LeaseRecord {
        LeaseRecord {
            namespace: self.namespace.clone(),
            service_name: self.name.clone(),
            address,
            hostname: self.hostname.clone(),
            ports: self.ports.clone(),
        }
    }
}

/// Hands out addresses from a pool and tracks them in the lease document.
#[derive(Debug, Clone)]
pub struct LeaseAllocator<S> {
    range: AddressRange,
    client: LeaseStoreClient<S>,
}

impl<S: DocumentStore> LeaseAllocator<S> {
    /// Creates an allocator for `range` backed by `client`.
    pub fn new(range: AddressRange, client: LeaseStoreClient<S>) -> Self {
        Self { range, client }
    }

    /// The pool addresses are allocated from.
    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    /// The lease store client.
    pub fn client(&self) -> &LeaseStoreClient<S> {
        &self.client
    }

    /// Makes sure the request holds an address and returns the resulting status.
    ///
    /// Ingress already observed on the service is returned as is, without
    /// touching the store, even if a different address is now requested.
    /// A requested address that is leased to another service fails with
    /// [`LeaseError::IpConflict`]; there is no fallback to the pool.
    pub async fn ensure(&self, request: &LeaseRequest) -> Result<LoadBalancerStatus> {
        let key = request.key();

        if !request.observed.is_empty() {
            tracing::debug!(key = %key, "service already has an ingress address");
            return Ok(LoadBalancerStatus {
                ingress: Some(request.observed.clone()),
            });
        }

        let retry = self.client.retry_policy();
        for attempt in 1..=retry.max_attempts {
            let (mut leases, version) = match self.client.fetch().await? {
                Some((leases, version)) => (leases, Some(version)),
                None => (LeaseSet::new(), None),
            };
            let existing = leases.get(&key)?;

            let address = match request.requested_address {
                Some(address) => {
                    validate_requested(&leases, address, &key)?;
                    address
                }
                None => match &existing {
                    Some(lease) if self.range.contains(lease.address) => lease.address,
                    _ => choose_free(&leases, &self.range)?,
                },
            };

            let record = request.to_record(address);
            if existing.as_ref() == Some(&record) {
                tracing::debug!(key = %key, address = %address, "lease already up to date");
                return Ok(record.to_status());
            }

            leases.insert(&record)?;
            let outcome = match &version {
                Some(version) => self.client.write_if_unchanged(&leases, version).await?,
                // The first lease creates the document.
                None => self.client.create_with(&leases).await?,
            };
            match outcome {
                WriteOutcome::Written(_) => {
                    tracing::info!(key = %key, address = %address, attempt, "leased address");
                    return Ok(record.to_status());
                }
                WriteOutcome::Conflict => {
                    let backoff = retry.backoff(attempt);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        backoff = ?backoff,
                        "lease document changed concurrently, retrying"
                    );
                    if attempt < retry.max_attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(LeaseError::StoreContention {
            attempts: retry.max_attempts,
        })
    }

    /// Releases the lease held under `key`. Releasing twice is fine.
    pub async fn release(&self, key: &str) -> Result<()> {
        if self.client.delete_entry(key).await? {
            tracing::info!(key = %key, "released address");
        }
        Ok(())
    }

    /// Returns the lease held under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<LeaseRecord>> {
        let (leases, _) = self.client.fetch_or_create().await?;
        leases.get(key)
    }

    /// Addresses are fixed once leased, so updates have nothing to do.
    pub async fn update(&self, request: &LeaseRequest) -> Result<()> {
        tracing::debug!(key = %request.key(), "lease update is a no-op");
        Ok(())
    }

    /// All leases, ordered by key.
    pub async fn list(&self) -> Result<Vec<LeaseRecord>> {
        let (leases, _) = self.client.fetch_or_create().await?;
        Ok(leases.records()?.into_iter().map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::lease::Protocol;
    use crate::store::{MemoryStore, RetryPolicy};

    fn allocator(pool: &str) -> (Arc<MemoryStore>, LeaseAllocator<Arc<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new("kube-system/static-ip-tracker"));
        let client = LeaseStoreClient::new(store.clone()).with_retry_policy(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        });
        (store, LeaseAllocator::new(pool.parse().unwrap(), client))
    }

    fn ip(status: &LoadBalancerStatus) -> String {
        status.ingress.as_ref().unwrap()[0].ip.clone().unwrap()
    }

    #[tokio::test]
    async fn test_ensure_reports_ports_and_hostname() {
        let (_, allocator) = allocator("10.0.0.1-10.0.0.3");
        let request = LeaseRequest::new("default", "web").with_ports(vec![LeasePort {
            port: 443,
            protocol: Protocol::Tcp,
        }]);

        let status = allocator.ensure(&request).await.unwrap();
        let ingress = &status.ingress.unwrap()[0];
        assert_eq!(ingress.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(ingress.hostname.as_deref(), Some("web"));
        let ports = ingress.ports.as_ref().unwrap();
        assert_eq!(ports[0].port, 443);
        assert_eq!(ports[0].protocol, "TCP");
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        let request = LeaseRequest::new("default", "web");

        let first = allocator.ensure(&request).await.unwrap();
        let writes = store.writes().await;
        let second = allocator.ensure(&request).await.unwrap();

        assert_eq!(ip(&first), ip(&second));
        assert_eq!(store.writes().await, writes);
    }

    #[tokio::test]
    async fn test_first_lease_creates_document() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        let request = LeaseRequest::new("default", "web");

        allocator.ensure(&request).await.unwrap();
        allocator.ensure(&request).await.unwrap();

        assert_eq!(store.writes().await, 1);
        let data = store.snapshot().await.unwrap();
        assert!(data.contains_key("default_web"));
    }

    #[tokio::test]
    async fn test_create_with_existing_document_conflicts() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        let other = LeaseRequest::new("default", "db");
        let mut seeded = LeaseSet::new();
        seeded.insert(&other.to_record(Ipv4Addr::new(10, 0, 0, 1))).unwrap();

        allocator.client().create_with(&seeded).await.unwrap();
        assert_eq!(
            allocator.client().create_with(&seeded).await.unwrap(),
            WriteOutcome::Conflict
        );

        let status = allocator.ensure(&LeaseRequest::new("default", "web")).await.unwrap();
        assert_eq!(ip(&status), "10.0.0.2");
        assert_eq!(store.writes().await, 2);
    }

    #[tokio::test]
    async fn test_observed_ingress_wins() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        let observed = LoadBalancerIngress {
            ip: Some("10.0.0.9".to_string()),
            ..Default::default()
        };
        let request = LeaseRequest::new("default", "web")
            .with_requested_address(Some(Ipv4Addr::new(10, 0, 0, 2)))
            .with_observed(vec![observed]);

        let status = allocator.ensure(&request).await.unwrap();
        assert_eq!(ip(&status), "10.0.0.9");
        assert_eq!(store.snapshot().await, None);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        allocator.client().fetch_or_create().await.unwrap();
        store.inject_conflicts(2).await;

        let status = allocator.ensure(&LeaseRequest::new("default", "web")).await.unwrap();
        assert_eq!(ip(&status), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_contention_budget() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        allocator.client().fetch_or_create().await.unwrap();
        store.inject_conflicts(5).await;

        let err = allocator.ensure(&LeaseRequest::new("default", "web")).await.unwrap_err();
        assert!(matches!(err, LeaseError::StoreContention { attempts: 5 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_requested_address_outside_pool() {
        let (_, allocator) = allocator("10.0.0.1-10.0.0.3");
        let request = LeaseRequest::new("default", "manual")
            .with_requested_address(Some(Ipv4Addr::new(192, 168, 10, 10)));

        let status = allocator.ensure(&request).await.unwrap();
        assert_eq!(ip(&status), "192.168.10.10");

        // An out-of-pool lease does not consume pool addresses.
        let status = allocator.ensure(&LeaseRequest::new("default", "auto")).await.unwrap();
        assert_eq!(ip(&status), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_get_update_list_release() {
        let (_, allocator) = allocator("10.0.0.1-10.0.0.3");
        let request = LeaseRequest::new("default", "web");
        allocator.ensure(&request).await.unwrap();
        allocator.ensure(&LeaseRequest::new("default", "db")).await.unwrap();

        let lease = allocator.get("default_web").await.unwrap().unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(10, 0, 0, 1));
        allocator.update(&request).await.unwrap();

        let names: Vec<_> = allocator
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.service_name)
            .collect();
        assert_eq!(names, vec!["db", "web"]);

        allocator.release("default_web").await.unwrap();
        allocator.release("default_web").await.unwrap();
        assert!(allocator.get("default_web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_outage_propagates() {
        let (store, allocator) = allocator("10.0.0.1-10.0.0.3");
        store.inject_failures(1).await;

        let err = allocator.ensure(&LeaseRequest::new("default", "web")).await.unwrap_err();
        assert!(matches!(err, LeaseError::StoreUnavailable(_)));

        store.inject_failures(1).await;
        assert!(allocator.release("default_web").await.is_err());
    }
}
