//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use enum_as_inner::EnumAsInner;
use helix_utils::southbound::PortFlags;
use helix_utils::{Dpid, HostId, NodeId, PortNo};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::Error;

// Neighbour sets are small; avoid heap traffic on the SPF hot path.
pub type Neighbours<'a> = SmallVec<[(NodeId, PortNo, &'a PortDesc); 8]>;

// Default nominal capacity for ports whose speed is still unknown.
const DFLT_CAPACITY_BPS: u64 = 1_000_000_000;

// The far end of a switch port.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Peer {
    Switch { dpid: Dpid, port: PortNo },
    Host(String),
}

// Switch port description: peer, administrative state, nominal capacity
// and the rolling send-rate estimate maintained by the stats collector.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct PortDesc {
    pub port: PortNo,
    pub peer: Option<Peer>,
    pub flags: PortFlags,
    pub capacity_bps: u64,
    pub tx_rate_bps: u64,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Switch {
    pub ports: BTreeMap<PortNo, PortDesc>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Host {
    pub id: HostId,
    // Switch port the host hangs off.
    pub attachment: (Dpid, PortNo),
}

/// Directed multigraph of switches and hosts.
///
/// Each physical link contributes two directed edges (one per port end)
/// with independent usage. A link reported down is retained inactive so
/// recovery can revive it without re-discovery.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Topology {
    switches: BTreeMap<Dpid, Switch>,
    hosts: BTreeMap<String, Host>,
    // Static capacity overrides from the port-description CSV.
    fixed_speed: BTreeMap<(Dpid, PortNo), u64>,
}

// ===== impl PortDesc =====

impl PortDesc {
    fn new(port: PortNo, capacity_bps: u64) -> PortDesc {
        PortDesc {
            port,
            peer: None,
            flags: PortFlags::ADMIN_UP | PortFlags::LINK_UP,
            capacity_bps,
            tx_rate_bps: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(PortFlags::ADMIN_UP | PortFlags::LINK_UP)
    }

    pub fn utilisation(&self) -> f64 {
        if self.capacity_bps == 0 {
            return 0.0;
        }
        self.tx_rate_bps as f64 / self.capacity_bps as f64
    }
}

// ===== impl Topology =====

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Registers a static capacity for a port, overriding any speed later
    /// reported by the switch.
    pub fn set_fixed_speed(&mut self, dpid: Dpid, port: PortNo, bps: u64) {
        self.fixed_speed.insert((dpid, port), bps);
        if let Some(desc) = self
            .switches
            .get_mut(&dpid)
            .and_then(|sw| sw.ports.get_mut(&port))
        {
            desc.capacity_bps = bps;
        }
    }

    /// Adds a switch-to-switch link, creating both directed edges.
    ///
    /// Returns an error if either end already points at a different peer
    /// (broken back-reference invariant).
    pub fn add_link(
        &mut self,
        u: Dpid,
        p_u: PortNo,
        v: Dpid,
        p_v: PortNo,
        cap: u64,
    ) -> Result<bool, Error> {
        for (near, near_port, far, far_port) in
            [(u, p_u, v, p_v), (v, p_v, u, p_u)]
        {
            if let Some(desc) = self
                .switches
                .get(&near)
                .and_then(|sw| sw.ports.get(&near_port))
            {
                match &desc.peer {
                    Some(Peer::Switch { dpid, port })
                        if *dpid == far && *port == far_port => {}
                    None => (),
                    Some(_) => {
                        return Err(Error::TopologyInconsistent(
                            near, near_port,
                        ));
                    }
                }
            }
        }

        let mut changed = false;
        for (near, near_port, far, far_port) in
            [(u, p_u, v, p_v), (v, p_v, u, p_u)]
        {
            let desc = self.port_entry(near, near_port, cap);
            let peer = Peer::Switch {
                dpid: far,
                port: far_port,
            };
            if desc.peer.as_ref() != Some(&peer) || !desc.is_active() {
                desc.peer = Some(peer);
                desc.flags.insert(PortFlags::ADMIN_UP | PortFlags::LINK_UP);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Marks both directions of a link inactive. The edge is retained for
    /// revert on recovery.
    pub fn link_down(&mut self, dpid: Dpid, port: PortNo) -> bool {
        let Some((peer_dpid, peer_port)) = self.peer_switch(dpid, port)
        else {
            return false;
        };
        let mut changed = false;
        for (sw, pn) in [(dpid, port), (peer_dpid, peer_port)] {
            if let Some(desc) = self
                .switches
                .get_mut(&sw)
                .and_then(|sw| sw.ports.get_mut(&pn))
                && desc.flags.contains(PortFlags::LINK_UP)
            {
                desc.flags.remove(PortFlags::LINK_UP);
                changed = true;
            }
        }
        changed
    }

    /// Reactivates an inactive link.
    pub fn link_up(&mut self, dpid: Dpid, port: PortNo) -> bool {
        let Some((peer_dpid, peer_port)) = self.peer_switch(dpid, port)
        else {
            return false;
        };
        let mut changed = false;
        for (sw, pn) in [(dpid, port), (peer_dpid, peer_port)] {
            if let Some(desc) = self
                .switches
                .get_mut(&sw)
                .and_then(|sw| sw.ports.get_mut(&pn))
                && !desc.flags.contains(PortFlags::LINK_UP)
            {
                desc.flags.insert(PortFlags::LINK_UP);
                changed = true;
            }
        }
        changed
    }

    /// Deletes both directions of a link.
    pub fn remove_link(&mut self, dpid: Dpid, port: PortNo) -> bool {
        let peer = self.peer_switch(dpid, port);
        let mut changed = false;
        if let Some(sw) = self.switches.get_mut(&dpid) {
            changed |= sw.ports.remove(&port).is_some();
        }
        if let Some((peer_dpid, peer_port)) = peer
            && let Some(sw) = self.switches.get_mut(&peer_dpid)
        {
            changed |= sw.ports.remove(&peer_port).is_some();
        }
        changed
    }

    /// Attaches a discovered host to a switch port.
    pub fn add_host(
        &mut self,
        id: HostId,
        dpid: Dpid,
        port: PortNo,
    ) -> Result<bool, Error> {
        if let Some(desc) =
            self.switches.get(&dpid).and_then(|sw| sw.ports.get(&port))
            && let Some(peer) = &desc.peer
            && *peer != Peer::Host(id.name.clone())
        {
            return Err(Error::TopologyInconsistent(dpid, port));
        }

        let name = id.name.clone();
        let known = self.hosts.contains_key(&name);
        self.hosts.insert(
            name.clone(),
            Host {
                id,
                attachment: (dpid, port),
            },
        );
        let desc = self.port_entry(dpid, port, DFLT_CAPACITY_BPS);
        desc.peer = Some(Peer::Host(name));
        desc.flags.insert(PortFlags::ADMIN_UP | PortFlags::LINK_UP);
        Ok(!known)
    }

    /// Detaches a host, deleting both ends of its link.
    pub fn remove_host(&mut self, name: &str) -> bool {
        let Some(host) = self.hosts.remove(name) else {
            return false;
        };
        let (dpid, port) = host.attachment;
        if let Some(sw) = self.switches.get_mut(&dpid) {
            sw.ports.remove(&port);
        }
        true
    }

    /// Removes a switch and every link touching it.
    pub fn remove_switch(&mut self, dpid: Dpid) -> bool {
        let Some(sw) = self.switches.remove(&dpid) else {
            return false;
        };
        for desc in sw.ports.values() {
            match &desc.peer {
                Some(Peer::Switch { dpid: peer, port }) => {
                    if let Some(peer_sw) = self.switches.get_mut(peer) {
                        peer_sw.ports.remove(port);
                    }
                }
                Some(Peer::Host(name)) => {
                    self.hosts.remove(name);
                }
                None => (),
            }
        }
        true
    }

    /// Updates the rolling send-rate estimate of a directed edge.
    pub fn set_port_usage(&mut self, dpid: Dpid, port: PortNo, bps: u64) {
        if let Some(desc) = self
            .switches
            .get_mut(&dpid)
            .and_then(|sw| sw.ports.get_mut(&port))
        {
            desc.tx_rate_bps = bps;
        }
    }

    /// Updates a port capacity from an OpenFlow port description, unless
    /// a static override exists.
    pub fn set_port_capacity(&mut self, dpid: Dpid, port: PortNo, bps: u64) {
        if self.fixed_speed.contains_key(&(dpid, port)) {
            return;
        }
        let desc = self.port_entry(dpid, port, bps);
        desc.capacity_bps = bps;
    }

    pub fn edge(&self, dpid: Dpid, port: PortNo) -> Option<&PortDesc> {
        self.switches.get(&dpid).and_then(|sw| sw.ports.get(&port))
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> + '_ {
        self.hosts.values()
    }

    pub fn switches(&self) -> impl Iterator<Item = Dpid> + '_ {
        self.switches.keys().copied()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        match node {
            NodeId::Switch(dpid) => self.switches.contains_key(dpid),
            NodeId::Host(name) => self.hosts.contains_key(name),
        }
    }

    /// Active neighbours of a node, with the egress port used to reach
    /// each (hosts have no ports; their single edge reports the peer's
    /// ingress instead).
    pub fn neighbours(&self, node: &NodeId) -> Neighbours<'_> {
        match node {
            NodeId::Switch(dpid) => match self.switches.get(dpid) {
                Some(sw) => sw
                    .ports
                    .values()
                    .filter(|desc| desc.is_active())
                    .filter_map(|desc| {
                        let peer = match desc.peer.as_ref()? {
                            Peer::Switch { dpid, .. } => {
                                NodeId::Switch(*dpid)
                            }
                            Peer::Host(name) => NodeId::Host(name.clone()),
                        };
                        Some((peer, desc.port, desc))
                    })
                    .collect(),
                None => Neighbours::new(),
            },
            NodeId::Host(name) => match self.hosts.get(name) {
                Some(host) => {
                    let (dpid, port) = host.attachment;
                    match self.edge(dpid, port) {
                        Some(desc) if desc.is_active() => {
                            let mut neighbours = Neighbours::new();
                            neighbours.push((
                                NodeId::Switch(dpid),
                                port,
                                desc,
                            ));
                            neighbours
                        }
                        _ => Neighbours::new(),
                    }
                }
                None => Neighbours::new(),
            },
        }
    }

    /// Finds the port pair connecting two nodes, if any.
    pub fn find_ports(
        &self,
        from: &NodeId,
        to: &NodeId,
    ) -> Option<(PortNo, PortNo)> {
        match from {
            NodeId::Switch(dpid) => {
                let sw = self.switches.get(dpid)?;
                sw.ports.values().find_map(|desc| match (&desc.peer, to) {
                    (
                        Some(Peer::Switch { dpid, port }),
                        NodeId::Switch(to_dpid),
                    ) if dpid == to_dpid => Some((desc.port, *port)),
                    (Some(Peer::Host(name)), NodeId::Host(to_name))
                        if name == to_name =>
                    {
                        Some((desc.port, PortNo(0)))
                    }
                    _ => None,
                })
            }
            NodeId::Host(name) => {
                let host = self.hosts.get(name)?;
                let (dpid, port) = host.attachment;
                match to {
                    NodeId::Switch(to_dpid) if *to_dpid == dpid => {
                        Some((PortNo(0), port))
                    }
                    _ => None,
                }
            }
        }
    }

    /// All directed switch edges, active or not.
    pub fn links(
        &self,
    ) -> impl Iterator<Item = (Dpid, PortNo, &PortDesc)> + '_ {
        self.switches.iter().flat_map(|(dpid, sw)| {
            sw.ports.values().map(move |desc| (*dpid, desc.port, desc))
        })
    }

    /// Whether the directed edge leads to a host (egress ports are never
    /// TE-optimised; the destination attachment is fixed).
    pub fn is_host_port(&self, dpid: Dpid, port: PortNo) -> bool {
        self.edge(dpid, port)
            .and_then(|desc| desc.peer.as_ref())
            .is_some_and(|peer| peer.is_host())
    }

    fn peer_switch(
        &self,
        dpid: Dpid,
        port: PortNo,
    ) -> Option<(Dpid, PortNo)> {
        let (dpid, port) =
            self.edge(dpid, port)?.peer.as_ref()?.as_switch()?;
        Some((*dpid, *port))
    }

    fn port_entry(
        &mut self,
        dpid: Dpid,
        port: PortNo,
        cap: u64,
    ) -> &mut PortDesc {
        let cap = self
            .fixed_speed
            .get(&(dpid, port))
            .copied()
            .unwrap_or(cap);
        self.switches
            .entry(dpid)
            .or_default()
            .ports
            .entry(port)
            .or_insert_with(|| PortDesc::new(port, cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostId {
        HostId {
            name: name.to_owned(),
            mac: helix_utils::MacAddr::default(),
            ip: std::net::Ipv4Addr::UNSPECIFIED,
        }
    }

    #[test]
    fn link_back_reference_is_enforced() {
        let mut topo = Topology::new();
        topo.add_link(Dpid(1), PortNo(1), Dpid(2), PortNo(1), 1_000)
            .unwrap();
        // Same ports, different peer.
        let err = topo
            .add_link(Dpid(1), PortNo(1), Dpid(3), PortNo(1), 1_000)
            .unwrap_err();
        assert!(matches!(err, Error::TopologyInconsistent(..)));
    }

    #[test]
    fn link_down_is_revertible() {
        let mut topo = Topology::new();
        topo.add_link(Dpid(1), PortNo(1), Dpid(2), PortNo(1), 1_000)
            .unwrap();

        assert!(topo.link_down(Dpid(1), PortNo(1)));
        // Edge retained, both directions inactive.
        assert!(!topo.edge(Dpid(1), PortNo(1)).unwrap().is_active());
        assert!(!topo.edge(Dpid(2), PortNo(1)).unwrap().is_active());
        assert!(topo.neighbours(&NodeId::Switch(Dpid(1))).is_empty());

        assert!(topo.link_up(Dpid(2), PortNo(1)));
        assert_eq!(topo.neighbours(&NodeId::Switch(Dpid(1))).len(), 1);
    }

    #[test]
    fn host_attach_detach() {
        let mut topo = Topology::new();
        topo.add_link(Dpid(1), PortNo(1), Dpid(2), PortNo(1), 1_000)
            .unwrap();
        topo.add_host(host("h1"), Dpid(1), PortNo(2)).unwrap();

        assert_eq!(
            topo.find_ports(
                &NodeId::Switch(Dpid(1)),
                &NodeId::Host("h1".to_owned())
            ),
            Some((PortNo(2), PortNo(0)))
        );
        assert!(topo.is_host_port(Dpid(1), PortNo(2)));
        assert!(topo.remove_host("h1"));
        assert!(topo.edge(Dpid(1), PortNo(2)).is_none());
    }

    #[test]
    fn fixed_speed_overrides_port_desc() {
        let mut topo = Topology::new();
        topo.set_fixed_speed(Dpid(1), PortNo(1), 200);
        topo.add_link(Dpid(1), PortNo(1), Dpid(2), PortNo(1), 1_000)
            .unwrap();
        topo.set_port_capacity(Dpid(1), PortNo(1), 1_000);
        assert_eq!(topo.edge(Dpid(1), PortNo(1)).unwrap().capacity_bps, 200);
        assert_eq!(
            topo.edge(Dpid(2), PortNo(1)).unwrap().capacity_bps,
            1_000
        );
    }
}
