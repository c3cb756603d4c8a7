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

//! Lease records and the lease set they live in.
//!
//! Each record is stored as one JSON value in the tracker ConfigMap,
//! keyed by `<namespace>_<name>`:
//!
//! ```json
//! {"namespace": "default", "service_name": "web",
//!  "load_balancer_status": {"ingress": [
//!    {"ip": "10.0.0.1", "hostname": "web",
//!     "ports": [{"port": 80, "protocol": "TCP"}]}]}}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, PortStatus};
use serde::{Deserialize, Serialize};

use crate::error::{LeaseError, Result};

/// Builds the key a service's lease is stored under.
pub fn request_key(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// TCP (the Kubernetes default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl Protocol {
    /// Kubernetes spelling of the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port exposed on the assigned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeasePort {
    /// Port number.
    pub port: i32,
    /// Port protocol.
    pub protocol: Protocol,
}

/// One service's address allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Namespace of the owning service.
    pub namespace: String,
    /// Name of the owning service.
    pub service_name: String,
    /// The leased address.
    pub address: Ipv4Addr,
    /// Display name reported as the ingress hostname.
    pub hostname: String,
    /// Exposed ports, in service declaration order.
    pub ports: Vec<LeasePort>,
}

/// Stored shape of a record.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseEntry {
    namespace: String,
    service_name: String,
    load_balancer_status: Option<LoadBalancerStatus>,
}

impl LeaseRecord {
    /// Key this record is stored under.
    pub fn key(&self) -> String {
        request_key(&self.namespace, &self.service_name)
    }

    /// The load balancer status reported for this lease.
    pub fn to_status(&self) -> LoadBalancerStatus {
        let ports: Vec<PortStatus> = self
            .ports
            .iter()
            .map(|p| PortStatus {
                port: p.port,
                protocol: p.protocol.to_string(),
                error: None,
            })
            .collect();

        LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(self.address.to_string()),
                hostname: (!self.hostname.is_empty()).then(|| self.hostname.clone()),
                ports: (!ports.is_empty()).then_some(ports),
                ..Default::default()
            }]),
        }
    }

    /// Encodes the record into its stored JSON form.
    pub fn encode(&self) -> Result<String> {
        let entry = LeaseEntry {
            namespace: self.namespace.clone(),
            service_name: self.service_name.clone(),
            load_balancer_status: Some(self.to_status()),
        };
        serde_json::to_string(&entry).map_err(|source| LeaseError::Encode {
            key: self.key(),
            source,
        })
    }

    /// Decodes a stored record.
    ///
    /// `key` only labels the error; the record's own key is derived from
    /// its namespace and service name.
    pub fn decode(key: &str, text: &str) -> Result<Self> {
        let corrupt = |reason: String| LeaseError::CorruptRecord {
            key: key.to_string(),
            reason,
        };

        let entry: LeaseEntry =
            serde_json::from_str(text).map_err(|e| corrupt(format!("malformed json: {e}")))?;

        let mut ingress = entry
            .load_balancer_status
            .and_then(|s| s.ingress)
            .unwrap_or_default();
        if ingress.len() != 1 {
            return Err(corrupt(format!(
                "expected exactly one ingress entry, found {}",
                ingress.len()
            )));
        }
        let ingress = ingress.remove(0);

        let ip = ingress
            .ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| corrupt("missing assigned address".to_string()))?;
        let address: Ipv4Addr = ip
            .parse()
            .map_err(|_| corrupt(format!("{ip:?} is not an IPv4 address")))?;

        let ports = ingress
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| -> Result<LeasePort> {
                let protocol = p.protocol.parse::<Protocol>().map_err(corrupt)?;
                Ok(LeasePort {
                    port: p.port,
                    protocol,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            namespace: entry.namespace,
            service_name: entry.service_name,
            address,
            hostname: ingress.hostname.unwrap_or_default(),
            ports,
        })
    }
}

/// All leases of a pool, as held in the tracker document.
///
/// Entries are kept in their encoded form so that a mutation rewrites
/// only the entry it touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseSet {
    entries: BTreeMap<String, String>,
}

impl LeaseSet {
    /// Creates an empty lease set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the raw document data.
    pub fn from_data(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Raw document data.
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Consumes the set, returning the raw document data.
    pub fn into_data(self) -> BTreeMap<String, String> {
        self.entries
    }

    /// Number of leases.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no lease is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if a lease is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Decodes the lease stored under `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<LeaseRecord>> {
        self.entries
            .get(key)
            .map(|text| LeaseRecord::decode(key, text))
            .transpose()
    }

    /// Decodes every lease, ordered by key. Fails on the first corrupt entry.
    pub fn records(&self) -> Result<Vec<(String, LeaseRecord)>> {
        self.entries
            .iter()
            .map(|(key, text)| -> Result<(String, LeaseRecord)> {
                Ok((key.clone(), LeaseRecord::decode(key, text)?))
            })
            .collect()
    }

    /// Maps every assigned address to the key holding it.
    pub fn assigned(&self) -> Result<HashMap<Ipv4Addr, String>> {
        let mut assigned = HashMap::with_capacity(self.entries.len());
        for (key, record) in self.records()? {
            assigned.insert(record.address, key);
        }
        Ok(assigned)
    }

    /// Inserts or replaces a lease under the record's key.
    pub fn insert(&mut self, record: &LeaseRecord) -> Result<()> {
        self.entries.insert(record.key(), record.encode()?);
        Ok(())
    }

    /// Removes the lease stored under `key`. Returns true if one was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}
