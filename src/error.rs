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

//! Error types for lease allocation.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// Failures talking to the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store call did not complete within {0:?}")]
    Timeout(Duration),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("store rejected the request: {0}")]
    Rejected(String),
}

/// Errors returned by the allocation protocol.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("no free address left in pool {range}")]
    PoolExhausted { range: String },

    #[error("address {address} is already leased to {holder}")]
    IpConflict { address: Ipv4Addr, holder: String },

    #[error("lease document kept changing, gave up after {attempts} attempts")]
    StoreContention { attempts: u32 },

    #[error("lease store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("lease record {key} is corrupt: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("invalid address range {spec:?}: {reason}")]
    InvalidRange { spec: String, reason: String },

    #[error("requested address {0:?} is not a valid IPv4 address")]
    InvalidRequestedAddress(String),

    #[error("invalid service: {0}")]
    InvalidService(String),

    #[error("failed to encode lease record {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

impl LeaseError {
    /// Returns true if the caller should requeue and try again later.
    ///
    /// Pool exhaustion, conflicts and corrupt or invalid input need an
    /// operator (or a different request) before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaseError::StoreContention { .. } | LeaseError::StoreUnavailable(_)
        )
    }
}

/// Result type for lease operations.
pub type Result<T> = std::result::Result<T, LeaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LeaseError::StoreContention { attempts: 5 }.is_retryable());
        assert!(LeaseError::StoreUnavailable(StoreError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(!LeaseError::PoolExhausted { range: "10.0.0.1-10.0.0.3".into() }.is_retryable());
        assert!(!LeaseError::IpConflict {
            address: Ipv4Addr::new(10, 0, 0, 1),
            holder: "ns_a".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_encode_failure_is_not_retryable() {
        let source = serde_json::from_str::<u8>("x").unwrap_err();
        let err = LeaseError::Encode {
            key: "default_web".into(),
            source,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("failed to encode lease record default_web"));
    }

    #[test]
    fn test_conflict_message_names_holder() {
        let err = LeaseError::IpConflict {
            address: Ipv4Addr::new(10, 0, 0, 1),
            holder: "default_web".into(),
        };
        assert_eq!(err.to_string(), "address 10.0.0.1 is already leased to default_web");
    }
}
