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

//! Service load balancer backed by the static IP pool.
//!
//! This is the surface the service controller drives: it is handed a
//! `Service` on every reconcile and decides nothing about when to call.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};

use crate::allocation::{LeaseAllocator, LeaseRequest};
use crate::config::DEFAULT_STATIC_IP_ANNOTATION;
use crate::error::{LeaseError, Result};
use crate::lease::{request_key, LeasePort, Protocol};
use crate::range::AddressRange;
use crate::store::client::DEFAULT_REQUEST_TIMEOUT;
use crate::store::{DocumentStore, LeaseStoreClient, RetryPolicy};

/// Name reported for every load balancer of this provider.
pub const LOAD_BALANCER_NAME: &str = "static-ip-range";

/// Operations the service controller performs on load balancers.
#[async_trait]
pub trait LoadBalancer: Send + Sync + 'static {
    /// Returns the status of the service's load balancer, if one exists.
    async fn get_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>>;

    /// Returns the name of the service's load balancer.
    fn get_load_balancer_name(&self, cluster_name: &str, service: &Service) -> String;

    /// Creates the load balancer if needed and returns its status.
    async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus>;

    /// Updates the hosts behind the load balancer.
    async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<()>;

    /// Deletes the load balancer. Succeeds if it does not exist.
    async fn ensure_load_balancer_deleted(&self, cluster_name: &str, service: &Service) -> Result<()>;
}

/// Resolves the lease document store for a cluster.
pub trait StoreBuilder: Send + Sync + 'static {
    /// Store type handed out.
    type Store: DocumentStore;

    /// Returns the store holding the leases of `cluster_name`.
    fn store(&self, cluster_name: &str) -> Result<Self::Store>;
}

/// Uses one store regardless of the cluster name.
#[derive(Debug, Clone)]
pub struct SingleStore<S>(pub S);

impl<S: DocumentStore + Clone> StoreBuilder for SingleStore<S> {
    type Store = S;

    fn store(&self, _cluster_name: &str) -> Result<S> {
        Ok(self.0.clone())
    }
}

/// Load balancer handing out addresses from a static pool.
#[derive(Debug, Clone)]
pub struct StaticLoadBalancer<B> {
    range: AddressRange,
    stores: B,
    annotation: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<B: StoreBuilder> StaticLoadBalancer<B> {
    /// Creates a load balancer for `range` with default settings.
    pub fn new(range: AddressRange, stores: B) -> Self {
        Self {
            range,
            stores,
            annotation: DEFAULT_STATIC_IP_ANNOTATION.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the annotation carrying a requested address.
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    /// Sets the per-call store deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy for contended writes.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds an allocator bound to the cluster's lease document.
    pub fn allocator(&self, cluster_name: &str) -> Result<LeaseAllocator<B::Store>> {
        let client = LeaseStoreClient::new(self.stores.store(cluster_name)?)
            .with_timeout(self.timeout)
            .with_retry_policy(self.retry.clone());
        Ok(LeaseAllocator::new(self.range, client))
    }

    /// Translates a service into a lease request.
    pub fn lease_request(&self, service: &Service) -> Result<LeaseRequest> {
        let (namespace, name) = service_identity(service)?;

        let requested_address = match service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.annotation))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
        {
            Some(value) => Some(
                value
                    .parse::<Ipv4Addr>()
                    .map_err(|_| LeaseError::InvalidRequestedAddress(value.to_string()))?,
            ),
            None => None,
        };

        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| -> Result<LeasePort> {
                        let protocol = match p.protocol.as_deref() {
                            None => Protocol::default(),
                            Some(value) => value.parse().map_err(LeaseError::InvalidService)?,
                        };
                        Ok(LeasePort { port: p.port, protocol })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let observed = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.clone())
            .unwrap_or_default();

        Ok(LeaseRequest::new(namespace, name)
            .with_ports(ports)
            .with_requested_address(requested_address)
            .with_observed(observed))
    }
}

/// Namespace and name of a service. Services without a namespace are
/// treated as living in `default`.
fn service_identity(service: &Service) -> Result<(&str, &str)> {
    let name = service
        .metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| LeaseError::InvalidService("service has no name".to_string()))?;
    let namespace = service
        .metadata
        .namespace
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or("default");
    Ok((namespace, name))
}

#[async_trait]
impl<B: StoreBuilder> LoadBalancer for StaticLoadBalancer<B> {
    async fn get_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>> {
        let (namespace, name) = service_identity(service)?;
        let lease = self
            .allocator(cluster_name)?
            .get(&request_key(namespace, name))
            .await?;
        Ok(lease.map(|l| l.to_status()))
    }

    fn get_load_balancer_name(&self, _cluster_name: &str, _service: &Service) -> String {
        LOAD_BALANCER_NAME.to_string()
    }

    async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        _nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        let request = self.lease_request(service)?;
        self.allocator(cluster_name)?.ensure(&request).await
    }

    async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        _nodes: &[Node],
    ) -> Result<()> {
        let request = self.lease_request(service)?;
        self.allocator(cluster_name)?.update(&request).await
    }

    async fn ensure_load_balancer_deleted(&self, cluster_name: &str, service: &Service) -> Result<()> {
        let (namespace, name) = service_identity(service)?;
        self.allocator(cluster_name)?
            .release(&request_key(namespace, name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::store::MemoryStore;

    fn load_balancer() -> StaticLoadBalancer<SingleStore<Arc<MemoryStore>>> {
        let store = Arc::new(MemoryStore::new("kube-system/static-ip-tracker"));
        StaticLoadBalancer::new("10.0.0.1-10.0.0.3".parse().unwrap(), SingleStore(store))
    }

    fn service(annotation: Option<&str>, protocols: &[Option<&str>]) -> Service {
        let annotations = annotation.map(|ip| {
            BTreeMap::from([(DEFAULT_STATIC_IP_ANNOTATION.to_string(), ip.to_string())])
        });
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                annotations,
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    protocols
                        .iter()
                        .enumerate()
                        .map(|(i, protocol)| ServicePort {
                            port: 8000 + i as i32,
                            protocol: protocol.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_lease_request_from_service() {
        let lb = load_balancer();
        let request = lb
            .lease_request(&service(Some(" 10.0.0.2 "), &[None, Some("UDP")]))
            .unwrap();

        assert_eq!(request.key(), "shop_web");
        assert_eq!(request.hostname, "web");
        assert_eq!(request.requested_address, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(
            request.ports,
            vec![
                LeasePort { port: 8000, protocol: Protocol::Tcp },
                LeasePort { port: 8001, protocol: Protocol::Udp },
            ]
        );
        assert!(request.observed.is_empty());
    }

    #[test]
    fn test_empty_annotation_is_ignored() {
        let request = load_balancer().lease_request(&service(Some(""), &[])).unwrap();
        assert_eq!(request.requested_address, None);
    }

    #[test]
    fn test_invalid_service_input() {
        let lb = load_balancer();
        assert!(matches!(
            lb.lease_request(&service(Some("not-an-ip"), &[])),
            Err(LeaseError::InvalidRequestedAddress(_))
        ));
        assert!(matches!(
            lb.lease_request(&service(None, &[Some("ICMP")])),
            Err(LeaseError::InvalidService(_))
        ));
        assert!(matches!(
            lb.lease_request(&Service::default()),
            Err(LeaseError::InvalidService(_))
        ));
    }

    #[test]
    fn test_load_balancer_name() {
        let lb = load_balancer();
        assert_eq!(lb.get_load_balancer_name("kubernetes", &service(None, &[])), LOAD_BALANCER_NAME);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let lb = load_balancer();
        let svc = service(None, &[Some("TCP")]);

        assert_eq!(lb.get_load_balancer("kubernetes", &svc).await.unwrap(), None);

        let status = lb.ensure_load_balancer("kubernetes", &svc, &[]).await.unwrap();
        assert_eq!(status.ingress.as_ref().unwrap()[0].ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(lb.get_load_balancer("kubernetes", &svc).await.unwrap(), Some(status));

        lb.update_load_balancer("kubernetes", &svc, &[]).await.unwrap();
        lb.ensure_load_balancer_deleted("kubernetes", &svc).await.unwrap();
        lb.ensure_load_balancer_deleted("kubernetes", &svc).await.unwrap();
        assert_eq!(lb.get_load_balancer("kubernetes", &svc).await.unwrap(), None);
    }
}
