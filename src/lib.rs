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

//! static-cloud-provider - LoadBalancer addresses from a static IP pool
//!
//! This library assigns IPv4 addresses from a fixed pool to Kubernetes
//! `LoadBalancer` services and records every lease in a shared ConfigMap:
//! - Address ranges and lowest-free allocation
//! - Lease records and their stored JSON form
//! - Versioned document stores with compare-and-swap writes
//! - The ensure/release protocol and the load balancer surface
//! - Configuration and health checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocation;
pub mod allocator;
pub mod config;
pub mod error;
pub mod health;
pub mod lease;
pub mod load_balancer;
pub mod provider;
pub mod range;
pub mod store;

// Re-export commonly used types
pub use allocation::{LeaseAllocator, LeaseRequest};
pub use config::StaticCloudConfig;
pub use error::{LeaseError, Result, StoreError};
pub use lease::{LeasePort, LeaseRecord, LeaseSet, Protocol};
pub use load_balancer::{LoadBalancer, SingleStore, StaticLoadBalancer, StoreBuilder};
pub use provider::StaticCloudProvider;
pub use range::AddressRange;
pub use store::{DocumentStore, LeaseStoreClient, RetryPolicy};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
