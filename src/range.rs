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

//! Address ranges for the static IP pool.
//!
//! A pool is a contiguous run of addresses that differ only in the last
//! octet, written as `"<start>-<end>"`, e.g. `10.0.0.10-10.0.0.20`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::LeaseError;

/// A closed interval of IPv4 addresses within one three-octet prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    prefix: [u8; 3],
    first: u8,
    last: u8,
}

impl AddressRange {
    /// Creates a range from its two endpoints.
    ///
    /// Both endpoints must share their first three octets and `start`
    /// must not come after `end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, LeaseError> {
        let [a, b, c, first] = start.octets();
        let [x, y, z, last] = end.octets();

        if [a, b, c] != [x, y, z] {
            return Err(LeaseError::InvalidRange {
                spec: format!("{start}-{end}"),
                reason: "start and end must share their first three octets".to_string(),
            });
        }
        if first > last {
            return Err(LeaseError::InvalidRange {
                spec: format!("{start}-{end}"),
                reason: "start must not be greater than end".to_string(),
            });
        }

        Ok(Self {
            prefix: [a, b, c],
            first,
            last,
        })
    }

    /// First address of the range.
    pub fn start(&self) -> Ipv4Addr {
        self.addr(self.first)
    }

    /// Last address of the range.
    pub fn end(&self) -> Ipv4Addr {
        self.addr(self.last)
    }

    /// Returns true if `addr` lies inside the range.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let [a, b, c, d] = addr.octets();
        [a, b, c] == self.prefix && (self.first..=self.last).contains(&d)
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> usize {
        usize::from(self.last - self.first) + 1
    }

    /// A range always holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates the range in ascending order, starting over on every call.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (self.first..=self.last).map(move |d| self.addr(d))
    }

    fn addr(&self, last_octet: u8) -> Ipv4Addr {
        let [a, b, c] = self.prefix;
        Ipv4Addr::new(a, b, c, last_octet)
    }
}

impl FromStr for AddressRange {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| LeaseError::InvalidRange {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid("expected <start>-<end>"))?;
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|_| invalid("start is not a dotted-quad IPv4 address"))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|_| invalid("end is not a dotted-quad IPv4 address"))?;

        Self::new(start, end)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start(), self.end())
    }
}
