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

//! Configuration structures for the static cloud provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LeaseError;
use crate::range::AddressRange;
use crate::store::client::DEFAULT_REQUEST_TIMEOUT;
use crate::store::RetryPolicy;

/// Annotation a service uses to ask for a specific address.
pub const DEFAULT_STATIC_IP_ANNOTATION: &str = "pg-yang.github.com/static.ip";

/// Top-level cloud config file.
///
/// ```yaml
/// static_cloud:
///   ip_pool: 10.0.0.1-10.0.0.3
///   ip_tracker_config_map_namespace: kube-system
///   ip_tracker_config_map: static-ip-tracker
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticCloudConfig {
    /// Settings of the static cloud provider.
    pub static_cloud: StaticCloudSection,
}

/// Settings of the static cloud provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticCloudSection {
    /// Address pool, `"<start>-<end>"`.
    pub ip_pool: String,

    /// Namespace of the lease tracker ConfigMap.
    pub ip_tracker_config_map_namespace: String,

    /// Name of the lease tracker ConfigMap.
    pub ip_tracker_config_map: String,

    /// Service annotation carrying a requested address.
    #[serde(default = "default_static_ip_annotation")]
    pub static_ip_annotation: String,

    /// Deadline for each call to the apiserver.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Retry settings for contended lease document writes.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_static_ip_annotation() -> String {
    DEFAULT_STATIC_IP_ANNOTATION.to_string()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

/// Retry settings for lease document writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Attempts per operation before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first conflict.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on a single backoff.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_initial_backoff() -> Duration {
    RetryPolicy::default().initial_backoff
}

fn default_max_backoff() -> Duration {
    RetryPolicy::default().max_backoff
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

/// Error type for configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse cloud config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid ip_pool: {0}")]
    Pool(#[source] LeaseError),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("retry.max_attempts must be at least 1")]
    NoAttempts,

    #[error("request_timeout must be greater than zero")]
    ZeroTimeout,
}

impl StaticCloudConfig {
    /// Parses a YAML cloud config.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Checks the config and returns the parsed address pool.
    pub fn validate(&self) -> Result<AddressRange, ConfigError> {
        let section = &self.static_cloud;
        if section.ip_tracker_config_map_namespace.trim().is_empty() {
            return Err(ConfigError::Empty("ip_tracker_config_map_namespace"));
        }
        if section.ip_tracker_config_map.trim().is_empty() {
            return Err(ConfigError::Empty("ip_tracker_config_map"));
        }
        if section.static_ip_annotation.trim().is_empty() {
            return Err(ConfigError::Empty("static_ip_annotation"));
        }
        if section.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if section.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        section.ip_pool.parse().map_err(ConfigError::Pool)
    }

    /// Retry policy derived from the config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.static_cloud.retry)
    }
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
static_cloud:
  ip_pool: 10.0.0.1-10.0.0.3
  ip_tracker_config_map_namespace: kube-system
  ip_tracker_config_map: static-ip-tracker
"#;

    #[test]
    fn test_deserialize_basic_config() {
        let config = StaticCloudConfig::from_yaml(BASIC).unwrap();
        let section = &config.static_cloud;
        assert_eq!(section.ip_pool, "10.0.0.1-10.0.0.3");
        assert_eq!(section.static_ip_annotation, DEFAULT_STATIC_IP_ANNOTATION);
        assert_eq!(section.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.retry_policy(), RetryPolicy::default());

        let range = config.validate().unwrap();
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_deserialize_full_config() {
        let yaml = r#"
static_cloud:
  ip_pool: 192.168.1.100-192.168.1.150
  ip_tracker_config_map_namespace: lb
  ip_tracker_config_map: leases
  static_ip_annotation: example.com/ip
  request_timeout: 3s
  retry:
    max_attempts: 8
    initial_backoff: 20ms
    max_backoff: 2s
"#;
        let config = StaticCloudConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.static_cloud.request_timeout, Duration::from_secs(3));
        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 8);
        assert_eq!(retry.initial_backoff, Duration::from_millis(20));
        assert_eq!(retry.max_backoff, Duration::from_secs(2));
        assert_eq!(config.validate().unwrap().len(), 51);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = StaticCloudConfig::from_yaml(BASIC).unwrap();
        config.static_cloud.ip_pool = "10.0.0.200-10.0.1.10".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Pool(_))));

        let mut config = StaticCloudConfig::from_yaml(BASIC).unwrap();
        config.static_cloud.ip_tracker_config_map = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::Empty("ip_tracker_config_map"))));

        let mut config = StaticCloudConfig::from_yaml(BASIC).unwrap();
        config.static_cloud.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoAttempts)));
    }

    #[test]
    fn test_missing_pool_fails_to_parse() {
        let yaml = "static_cloud:\n  ip_tracker_config_map_namespace: a\n  ip_tracker_config_map: b\n";
        assert!(matches!(StaticCloudConfig::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }
}
