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

//! Address selection over a lease set.

use std::net::Ipv4Addr;

use crate::error::{LeaseError, Result};
use crate::lease::LeaseSet;
use crate::range::AddressRange;

/// Returns the lowest address of `range` not leased in `leases`.
pub fn choose_free(leases: &LeaseSet, range: &AddressRange) -> Result<Ipv4Addr> {
    let assigned = leases.assigned()?;
    range
        .iter()
        .find(|addr| !assigned.contains_key(addr))
        .ok_or_else(|| LeaseError::PoolExhausted {
            range: range.to_string(),
        })
}

/// Checks that `address` is not leased to anyone other than `key`.
///
/// Requested addresses may lie outside the pool; only uniqueness is
/// enforced.
pub fn validate_requested(leases: &LeaseSet, address: Ipv4Addr, key: &str) -> Result<()> {
    for (holder, record) in leases.records()? {
        if record.address == address && holder != key {
            return Err(LeaseError::IpConflict { address, holder });
        }
    }
    Ok(())
}
