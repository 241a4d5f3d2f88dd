//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{Dpid, Gid, MacAddr, PortNo};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PortFlags: u8 {
        const ADMIN_UP = 0x01;
        const LINK_UP = 0x02;
    }
}

// One hop of an installed path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct PathHop {
    pub dpid: Dpid,
    pub in_port: PortNo,
    pub out_port: PortNo,
}

// Fast-failover group bucket. The switch forwards through the first
// bucket whose watch port is up, without controller involvement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Bucket {
    pub egress: PortNo,
    pub watch: PortNo,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum GroupOp {
    Add,
    Modify,
    Delete,
}

// Fast-failover group modification. Groups are keyed per switch by the
// candidate GID.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct GroupMod {
    pub dpid: Dpid,
    pub gid: Gid,
    pub op: GroupOp,
    pub buckets: Vec<Bucket>,
}

// Flow match fields used by the protection scheme.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum FlowMatch {
    // First-hop match on the host pair at the ingress port.
    Ingress {
        in_port: PortNo,
        dst_ip: std::net::Ipv4Addr,
    },
    // Downstream match on the candidate GID metadata tag.
    Metadata(Gid),
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum FlowAction {
    // Tag the candidate GID and forward through its group.
    TagAndGroup(Gid),
    // Forward through the group.
    Group(Gid),
    // Rewrite the destination MAC and deliver on the host port.
    Deliver { eth_dst: MacAddr, out_port: PortNo },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum FlowOp {
    Add,
    Delete,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct FlowMod {
    pub dpid: Dpid,
    pub gid: Gid,
    pub op: FlowOp,
    pub r#match: FlowMatch,
    pub action: FlowAction,
    pub priority: u16,
}

// Controller-to-switch requests. The OpenFlow encoder consuming these is
// an external collaborator.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SwitchMsg {
    Flow(FlowMod),
    Group(GroupMod),
    Barrier { dpid: Dpid, xid: u32 },
    PortStatsRequest { dpid: Dpid },
    FlowStatsRequest { dpid: Dpid },
    RoleChange { dpid: Dpid, master: bool, generation: u64 },
}

// Per-port counter sample from a stats reply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PortCounters {
    pub port: PortNo,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
}

// Per-flow counter sample. Flows are identified by the candidate GID.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct FlowCounters {
    pub gid: Gid,
    pub packets: u64,
    pub bytes: u64,
}

// Switch-to-controller events delivered by the southbound adapter.
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SwitchEvent {
    PortStats {
        dpid: Dpid,
        ports: Vec<PortCounters>,
    },
    FlowStats {
        dpid: Dpid,
        flows: Vec<FlowCounters>,
    },
    PortStatus {
        dpid: Dpid,
        port: PortNo,
        flags: PortFlags,
    },
    PortDesc {
        dpid: Dpid,
        port: PortNo,
        speed_bps: u64,
    },
    BarrierReply {
        dpid: Dpid,
        xid: u32,
    },
    Disconnect {
        dpid: Dpid,
    },
}
