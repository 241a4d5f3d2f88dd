//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod bus;
pub mod southbound;
pub mod task;
pub mod timeline;

// Useful type definition(s) of tokio channels.
pub type Sender<T> = tokio::sync::mpsc::Sender<T>;
pub type Receiver<T> = tokio::sync::mpsc::Receiver<T>;
pub type UnboundedSender<T> = tokio::sync::mpsc::UnboundedSender<T>;
pub type UnboundedReceiver<T> = tokio::sync::mpsc::UnboundedReceiver<T>;
pub type Responder<T> = tokio::sync::oneshot::Sender<T>;

// Number of hosts assumed by the GID derivation formula.
const GID_HOST_SPACE: u32 = 64;

// 64-bit OpenFlow datapath identifier.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct Dpid(pub u64);

// Switch port number.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct PortNo(pub u32);

// Administrative area (domain) identifier.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct AreaId(pub u32);

// Controller instance identifier within an area. Instance 0 is the
// implicit primary.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

// Election term counter. Strictly monotone per area.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

// Deterministic candidate (src-dst host pair) identifier.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct Gid(pub u32);

// 48-bit MAC address.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct MacAddr(pub [u8; 6]);

// Host identity: stable short name plus its address pair.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct HostId {
    pub name: String,
    pub mac: MacAddr,
    pub ip: std::net::Ipv4Addr,
}

// Topology node: a data-plane switch or an attached host. Hosts are
// keyed by name so two controllers derive identical graphs.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum NodeId {
    Switch(Dpid),
    Host(String),
}

// ===== impl Dpid =====

impl std::fmt::Display for Dpid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for Dpid {
    fn from(id: u64) -> Dpid {
        Dpid(id)
    }
}

// ===== impl PortNo =====

impl PortNo {
    // Ports above this value are OpenFlow reserved ports and never carry
    // topology links.
    pub const MAX_PHYS: PortNo = PortNo(0xffff_ff00);

    pub fn is_physical(&self) -> bool {
        *self < Self::MAX_PHYS
    }
}

impl std::fmt::Display for PortNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ===== impl AreaId =====

impl std::fmt::Display for AreaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

// ===== impl InstanceId =====

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ===== impl Epoch =====

impl Epoch {
    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ===== impl Gid =====

impl Gid {
    /// Derive the candidate identifier for an ordered host pair.
    ///
    /// The formula is `(h1 - 1) * (n - 1) + dh2` over the numeric suffixes
    /// of the host names, with `dh2 = h2 - 1` when `h2 > h1`. Every
    /// controller derives the same identifier for the same pair.
    pub fn from_pair(src: &str, dst: &str) -> Option<Gid> {
        let h1 = host_number(src)?;
        let h2 = host_number(dst)?;
        if h1 == h2 || h1 == 0 || h2 == 0 {
            return None;
        }

        let n = GID_HOST_SPACE;
        let dh2 = if h2 > h1 { h2 - 1 } else { h2 };
        Some(Gid((h1 - 1) * (n - 1) + dh2))
    }

    /// Recover the host-number pair encoded in the identifier.
    pub fn host_numbers(&self) -> (u32, u32) {
        if self.0 == 0 {
            return (0, 0);
        }
        let n = GID_HOST_SPACE;
        let h1 = (self.0 - 1) / (n - 1) + 1;
        let dh2 = self.0 - (h1 - 1) * (n - 1);
        let h2 = if dh2 >= h1 { dh2 + 1 } else { dh2 };
        (h1, h2)
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// First run of decimal digits in a host name ("h12" -> 12).
fn host_number(name: &str) -> Option<u32> {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

// ===== impl MacAddr =====

impl MacAddr {
    pub const BROADCAST: Self = MacAddr([0xff; 6]);

    pub fn as_bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseMacAddrError;

impl std::fmt::Display for ParseMacAddrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid MAC address format")
    }
}

impl std::error::Error for ParseMacAddrError {}

impl FromStr for MacAddr {
    type Err = ParseMacAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(ParseMacAddrError);
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| ParseMacAddrError)?;
            count += 1;
        }
        if count != 6 {
            return Err(ParseMacAddrError);
        }
        Ok(MacAddr(bytes))
    }
}

// ===== impl NodeId =====

impl NodeId {
    pub fn is_host(&self) -> bool {
        matches!(self, NodeId::Host(_))
    }

    pub fn as_switch(&self) -> Option<Dpid> {
        match self {
            NodeId::Switch(dpid) => Some(*dpid),
            NodeId::Host(_) => None,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeId::Switch(dpid) => write!(f, "{}", dpid),
            NodeId::Host(name) => write!(f, "{}", name),
        }
    }
}

impl From<Dpid> for NodeId {
    fn from(dpid: Dpid) -> NodeId {
        NodeId::Switch(dpid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_is_deterministic_and_direction_sensitive() {
        let fwd = Gid::from_pair("h1", "h2").unwrap();
        let rev = Gid::from_pair("h2", "h1").unwrap();
        assert_ne!(fwd, rev);
        assert_eq!(fwd, Gid::from_pair("h1", "h2").unwrap());

        assert_eq!(fwd.host_numbers(), (1, 2));
        assert_eq!(rev.host_numbers(), (2, 1));
    }

    #[test]
    fn gid_rejects_degenerate_pairs() {
        assert_eq!(Gid::from_pair("h3", "h3"), None);
        assert_eq!(Gid::from_pair("host", "h2"), None);
    }

    #[test]
    fn mac_addr_parse_roundtrip() {
        let mac: MacAddr = "00:1b:21:3c:4d:5e".parse().unwrap();
        assert_eq!(mac.to_string(), "00:1b:21:3c:4d:5e");
        assert!("00:1b:21:3c:4d".parse::<MacAddr>().is_err());
        assert!("00:1b:21:3c:4d:5e:6f".parse::<MacAddr>().is_err());
    }
}
