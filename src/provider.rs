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

//! The static cloud provider.
//!
//! Only load balancers are offered. Instances, zones, clusters and routes
//! are left to the cluster itself.

use kube::Client;

use crate::config::{ConfigError, StaticCloudConfig};
use crate::error::Result;
use crate::load_balancer::{StaticLoadBalancer, StoreBuilder};
use crate::range::AddressRange;
use crate::store::ConfigMapStore;

/// Name the provider registers under.
pub const PROVIDER_NAME: &str = "static-cloud";

/// Hands out ConfigMap stores for the tracker document.
///
/// kube clients are bound to one cluster, so the cluster name only shows
/// up in logs.
#[derive(Clone)]
pub struct ConfigMapStoreBuilder {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapStoreBuilder {
    /// Creates a builder for ConfigMap `namespace/name`.
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl StoreBuilder for ConfigMapStoreBuilder {
    type Store = ConfigMapStore;

    fn store(&self, cluster_name: &str) -> Result<ConfigMapStore> {
        tracing::trace!(
            cluster = %cluster_name,
            configmap = %format!("{}/{}", self.namespace, self.name),
            "using lease tracker"
        );
        Ok(ConfigMapStore::new(
            self.client.clone(),
            self.namespace.clone(),
            self.name.clone(),
        ))
    }
}

/// Cloud provider that allocates service addresses from a static pool.
pub struct StaticCloudProvider {
    config: StaticCloudConfig,
    range: AddressRange,
    client: Option<Client>,
}

impl StaticCloudProvider {
    /// Creates a provider from a validated config.
    pub fn new(config: StaticCloudConfig) -> std::result::Result<Self, ConfigError> {
        let range = config.validate()?;
        Ok(Self {
            config,
            range,
            client: None,
        })
    }

    /// Hands the provider the client it talks to the apiserver with.
    pub fn initialize(&mut self, client: Client) {
        self.client = Some(client);
    }

    /// Returns the provider name.
    pub fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }

    /// Reports that a cluster ID is set, so the service controller runs.
    pub fn has_cluster_id(&self) -> bool {
        true
    }

    /// The configured address pool.
    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    /// The provider config.
    pub fn config(&self) -> &StaticCloudConfig {
        &self.config
    }

    /// Returns the load balancer, or `None` before [`initialize`](Self::initialize).
    pub fn load_balancer(&self) -> Option<StaticLoadBalancer<ConfigMapStoreBuilder>> {
        let client = self.client.clone()?;
        let section = &self.config.static_cloud;
        let stores = ConfigMapStoreBuilder::new(
            client,
            section.ip_tracker_config_map_namespace.clone(),
            section.ip_tracker_config_map.clone(),
        );
        Some(
            StaticLoadBalancer::new(self.range, stores)
                .with_annotation(section.static_ip_annotation.clone())
                .with_timeout(section.request_timeout)
                .with_retry_policy(self.config.retry_policy()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_requires_valid_config() {
        let yaml = r#"
static_cloud:
  ip_pool: 10.0.0.1-10.0.0.3
  ip_tracker_config_map_namespace: kube-system
  ip_tracker_config_map: static-ip-tracker
"#;
        let provider = StaticCloudProvider::new(StaticCloudConfig::from_yaml(yaml).unwrap()).unwrap();
        assert_eq!(provider.provider_name(), "static-cloud");
        assert!(provider.has_cluster_id());
        assert_eq!(provider.range().to_string(), "10.0.0.1-10.0.0.3");
        assert!(provider.load_balancer().is_none());

        let bad = yaml.replace("10.0.0.3", "10.0.1.3");
        assert!(StaticCloudProvider::new(StaticCloudConfig::from_yaml(&bad).unwrap()).is_err());
    }
}
