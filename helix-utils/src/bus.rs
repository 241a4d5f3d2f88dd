//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::southbound::PathHop;
use crate::{AreaId, Dpid, Epoch, Gid, InstanceId, PortNo};
use crate::{UnboundedReceiver, UnboundedSender};

// Useful type definition(s).
pub type BusReceiver = UnboundedReceiver<BusEnvelope>;
pub type BusSender = UnboundedSender<BusEnvelope>;

// Address of a bus participant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum BusAddr {
    // Local controller instance within an area.
    Instance(AreaId, InstanceId),
    // Root controller.
    Root(u32),
}

// Delivery scope of a published message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BusDest {
    // All instances of the given area. Root controllers observe area
    // traffic as well (they bind to every area topic).
    Area(AreaId),
    // Root controllers only.
    Roots,
}

// A message as delivered to a subscriber. Sequence numbers are monotone
// per sender; receivers treat a decrease as an invariant violation.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct BusEnvelope {
    pub src: BusAddr,
    pub seq: u64,
    pub msg: BusMsg,
}

// Inter-controller message kinds.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum BusMsg {
    // Periodic liveness beacon from every instance.
    Heartbeat { epoch: Epoch },
    // Request for immediate heartbeats, sent by a joining instance.
    RoleQuery,
    // Master claim for a new epoch.
    RoleAnnounce { epoch: Epoch },
    // Root-mediated demotion of a stale master after a partition heals.
    RoleDemote { epoch: Epoch },
    // Master-to-slave candidate/path state push.
    StateSync(StateSnapshot),
    // Area topology advisory for the root link/host catalogues.
    TopologyUpdate(TopologySnapshot),
    // Request to compute a path towards a host outside the local area.
    InterAreaRequest {
        req_id: u64,
        src_host: String,
        dst_host: String,
    },
    // Stitched path descriptor, or None when no path exists.
    InterAreaResponse {
        req_id: u64,
        src_host: String,
        dst_host: String,
        path: Option<StitchedPath>,
    },
    // Root asking an area master for a local path segment.
    SegmentRequest {
        req_id: u64,
        from: SegmentEndpoint,
        to: SegmentEndpoint,
    },
    SegmentResponse {
        req_id: u64,
        segment: Option<PathSegment>,
    },
    // Congestion on an inter-area link the local TE engine cannot fix.
    InterAreaCongested {
        dpid: Dpid,
        port: PortNo,
        rate_bps: u64,
        candidates: Vec<(String, String)>,
    },
    // Egress switch/port change of an inter-area candidate.
    EgressChange {
        gid: Gid,
        egress: (Dpid, PortNo),
    },
}

// Endpoint of a segment request: a host inside the area or a border
// switch of an inter-area link.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SegmentEndpoint {
    Host(String),
    Border(Dpid, PortNo),
}

// Path segment computed by an area master on behalf of the root.
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PathSegment {
    pub hops: Vec<PathHop>,
    // Highest usage/capacity ratio along the segment, for stitching
    // tie-breaks.
    pub max_utilisation: f64,
}

// Inter-area path descriptor returned by the root.
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct StitchedPath {
    pub link: InterAreaLink,
    pub src_segment: PathSegment,
    pub dst_segment: PathSegment,
    // Destination address, for the ingress classifier in the source
    // area.
    pub dst_ip: std::net::Ipv4Addr,
}

// Physical link between two areas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct InterAreaLink {
    pub area_a: AreaId,
    pub sw_a: Dpid,
    pub port_a: PortNo,
    pub area_b: AreaId,
    pub sw_b: Dpid,
    pub port_b: PortNo,
}

// Candidate state pushed from master to slaves.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct StateSnapshot {
    pub epoch: Epoch,
    pub candidates: Vec<CandidateSync>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct CandidateSync {
    pub gid: Gid,
    pub src: String,
    pub dst: String,
    pub primary: Vec<PathHop>,
    pub backup: Vec<PathHop>,
    pub rate_bps: u64,
}

// Area topology advisory.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct TopologySnapshot {
    pub hosts: Vec<crate::HostId>,
    pub inter_area_links: Vec<InterAreaLink>,
}

// ===== Bus hub =====

/// In-process publish/subscribe hub connecting the controller instances
/// of all areas and the root controllers.
///
/// Delivery is in-order per sender (an mpsc channel per subscriber) and a
/// sender never receives its own messages back. The hub holds no
/// process-global state: a test can run two independent hubs side by
/// side.
#[derive(Clone, Debug, Default)]
pub struct Bus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    addr: BusAddr,
    tx: BusSender,
}

/// A participant's handle onto the bus. Cloning shares the sequence
/// counter so all clones publish in one monotone sequence.
#[derive(Clone, Debug)]
pub struct BusHandle {
    bus: Bus,
    addr: BusAddr,
    seq: Arc<AtomicU64>,
}

// ===== impl Bus =====

impl Bus {
    pub fn new() -> Bus {
        Bus::default()
    }

    /// Attach a participant, returning its publish handle and delivery
    /// channel.
    pub fn join(&self, addr: BusAddr) -> (BusHandle, BusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(Subscriber { addr, tx });
        let handle = BusHandle {
            bus: self.clone(),
            addr,
            seq: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }

    fn publish(&self, src: BusAddr, seq: u64, dest: BusDest, msg: BusMsg) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in inner.subscribers.iter() {
            if sub.addr == src {
                continue;
            }
            let deliver = match (dest, sub.addr) {
                (BusDest::Area(area), BusAddr::Instance(sub_area, _)) => {
                    area == sub_area
                }
                // Roots observe all area traffic.
                (_, BusAddr::Root(_)) => true,
                (BusDest::Roots, BusAddr::Instance(..)) => false,
            };
            if deliver {
                let envelope = BusEnvelope {
                    src,
                    seq,
                    msg: msg.clone(),
                };
                let _ = sub.tx.send(envelope);
            }
        }
    }
}

// ===== impl BusHandle =====

impl BusHandle {
    pub fn addr(&self) -> BusAddr {
        self.addr
    }

    /// Publish a message to the given scope. Sends from one handle carry
    /// strictly increasing sequence numbers.
    pub fn publish(&self, dest: BusDest, msg: BusMsg) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(self.addr, seq, dest, msg);
    }

    /// Leave the bus. Subsequent publishes are dropped by the hub once
    /// the delivery channel closes.
    pub fn leave(&self) {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.subscribers.retain(|sub| sub.addr != self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(area: u32, id: u32) -> BusAddr {
        BusAddr::Instance(AreaId(area), InstanceId(id))
    }

    #[test]
    fn area_scoped_delivery() {
        let bus = Bus::new();
        let (h0, _rx0) = bus.join(inst(1, 0));
        let (_h1, mut rx1) = bus.join(inst(1, 1));
        let (_h2, mut rx2) = bus.join(inst(2, 0));
        let (_hr, mut rxr) = bus.join(BusAddr::Root(0));

        h0.publish(BusDest::Area(AreaId(1)), BusMsg::RoleQuery);

        let env = rx1.try_recv().unwrap();
        assert_eq!(env.src, inst(1, 0));
        assert_eq!(env.seq, 0);
        // Other areas do not see it; roots do.
        assert!(rx2.try_recv().is_err());
        assert!(rxr.try_recv().is_ok());
    }

    #[test]
    fn sender_does_not_hear_itself() {
        let bus = Bus::new();
        let (h0, mut rx0) = bus.join(inst(1, 0));
        let (_h1, mut rx1) = bus.join(inst(1, 1));

        h0.publish(BusDest::Area(AreaId(1)), BusMsg::RoleQuery);
        h0.publish(BusDest::Area(AreaId(1)), BusMsg::RoleQuery);

        assert!(rx0.try_recv().is_err());
        assert_eq!(rx1.try_recv().unwrap().seq, 0);
        assert_eq!(rx1.try_recv().unwrap().seq, 1);
    }
}
