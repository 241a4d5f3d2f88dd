//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::bus::InterAreaLink;
use helix_utils::{AreaId, Epoch, HostId, InstanceId};

// Heartbeats an area master may miss before its area is considered
// unreachable.
const MAX_MISSED_HEARTBEATS: u8 = 3;

// Liveness and leadership view of one area.
#[derive(Clone, Debug, Default)]
pub struct AreaState {
    pub master: Option<InstanceId>,
    pub epoch: Epoch,
    pub missed: u8,
}

/// The root controller's view of the wide-area network: inter-area
/// links, host locations and per-area leadership. Purely advisory; the
/// root holds no switch connections.
#[derive(Clone, Debug, Default)]
pub struct Catalogue {
    links: Vec<InterAreaLink>,
    hosts: BTreeMap<String, (AreaId, HostId)>,
    areas: BTreeMap<AreaId, AreaState>,
}

// ===== impl Catalogue =====

impl Catalogue {
    pub fn new() -> Catalogue {
        Catalogue::default()
    }

    /// Registers an inter-area link from the controller map.
    pub fn add_link(&mut self, link: InterAreaLink) {
        if !self.links.contains(&link) {
            self.links.push(link);
        }
    }

    /// Records a host's area from a topology advisory.
    pub fn learn_host(&mut self, area: AreaId, host: HostId) {
        self.hosts.insert(host.name.clone(), (area, host));
    }

    pub fn forget_host(&mut self, name: &str) {
        self.hosts.remove(name);
    }

    pub fn host_area(&self, name: &str) -> Option<AreaId> {
        self.hosts.get(name).map(|(area, _)| *area)
    }

    pub fn host(&self, name: &str) -> Option<&HostId> {
        self.hosts.get(name).map(|(_, host)| host)
    }

    /// Links connecting two areas, in either orientation, restricted to
    /// live areas. The returned links are normalised so `area_a` is the
    /// source area.
    pub fn links_between(
        &self,
        src: AreaId,
        dst: AreaId,
    ) -> Vec<InterAreaLink> {
        self.links
            .iter()
            .filter(|link| self.is_live(src) && self.is_live(dst))
            .filter_map(|link| {
                if link.area_a == src && link.area_b == dst {
                    Some(*link)
                } else if link.area_a == dst && link.area_b == src {
                    Some(InterAreaLink {
                        area_a: src,
                        sw_a: link.sw_b,
                        port_a: link.port_b,
                        area_b: dst,
                        sw_b: link.sw_a,
                        port_b: link.port_a,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn area(&self, area: AreaId) -> Option<&AreaState> {
        self.areas.get(&area)
    }

    pub fn is_live(&self, area: AreaId) -> bool {
        self.areas
            .get(&area)
            .map(|state| state.missed < MAX_MISSED_HEARTBEATS)
            .unwrap_or(false)
    }

    /// Refreshes area liveness from an instance heartbeat.
    pub fn heartbeat(&mut self, area: AreaId, epoch: Epoch) {
        let state = self.areas.entry(area).or_default();
        state.missed = 0;
        state.epoch = state.epoch.max(epoch);
    }

    /// Records a master claim. Returns the epoch to demote the claimant
    /// with when a higher-epoch master is already on record (split-brain
    /// rejoin).
    pub fn role_announce(
        &mut self,
        area: AreaId,
        instance: InstanceId,
        epoch: Epoch,
    ) -> Option<Epoch> {
        let state = self.areas.entry(area).or_default();
        state.missed = 0;
        if epoch > state.epoch
            || (state.master.is_none() && epoch == state.epoch)
        {
            state.epoch = epoch;
            state.master = Some(instance);
            return None;
        }
        if state.master != Some(instance) {
            return Some(state.epoch);
        }
        None
    }

    /// One failure-detection tick over all known areas.
    pub fn tick(&mut self) {
        for state in self.areas.values_mut() {
            state.missed = state.missed.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_utils::{Dpid, PortNo};

    fn link(a: u32, b: u32) -> InterAreaLink {
        InterAreaLink {
            area_a: AreaId(a),
            sw_a: Dpid(a as u64 * 10),
            port_a: PortNo(1),
            area_b: AreaId(b),
            sw_b: Dpid(b as u64 * 10),
            port_b: PortNo(2),
        }
    }

    #[test]
    fn links_are_orientation_normalised() {
        let mut cat = Catalogue::new();
        cat.add_link(link(1, 2));
        cat.heartbeat(AreaId(1), Epoch(1));
        cat.heartbeat(AreaId(2), Epoch(1));

        let forward = cat.links_between(AreaId(1), AreaId(2));
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].sw_a, Dpid(10));

        let reverse = cat.links_between(AreaId(2), AreaId(1));
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].sw_a, Dpid(20));
        assert_eq!(reverse[0].port_a, PortNo(2));
    }

    #[test]
    fn dead_area_links_are_pruned() {
        let mut cat = Catalogue::new();
        cat.add_link(link(1, 2));
        cat.heartbeat(AreaId(1), Epoch(1));
        cat.heartbeat(AreaId(2), Epoch(1));
        assert_eq!(cat.links_between(AreaId(1), AreaId(2)).len(), 1);

        for _ in 0..MAX_MISSED_HEARTBEATS {
            cat.tick();
        }
        cat.heartbeat(AreaId(1), Epoch(1));
        assert!(cat.links_between(AreaId(1), AreaId(2)).is_empty());
    }

    #[test]
    fn stale_master_claim_is_rejected() {
        let mut cat = Catalogue::new();
        assert_eq!(
            cat.role_announce(AreaId(1), InstanceId(1), Epoch(2)),
            None
        );
        // The partitioned old master rejoins with a stale epoch.
        assert_eq!(
            cat.role_announce(AreaId(1), InstanceId(0), Epoch(1)),
            Some(Epoch(2))
        );
        // The current master re-announcing is fine.
        assert_eq!(
            cat.role_announce(AreaId(1), InstanceId(1), Epoch(2)),
            None
        );
    }
}
