//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::bus::BusAddr;
use helix_utils::{AreaId, Epoch, InstanceId};
use helix_utils::timeline;

use crate::debug::Debug;
use crate::error::Error;

// Heartbeats a peer may miss before it is declared failed.
pub const MAX_MISSED_HEARTBEATS: u8 = 3;

// Election state machine.
pub mod fsm {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub enum State {
        // Waiting for the init window to learn the live set.
        #[default]
        Init,
        Slave,
        Master,
    }
}

// Externally visible effects of an election step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    // This instance became master; announce the new epoch on the bus.
    Announce(Epoch),
    // This instance stepped down to slave.
    Demoted,
    // A peer was declared failed.
    PeerFailed(InstanceId),
}

#[derive(Clone, Copy, Debug)]
struct PeerState {
    epoch: Epoch,
    missed: u8,
}

/// Deterministic intra-cluster leader election.
///
/// The live instance with the lowest instance ID is master. Epochs are
/// strictly monotone per area; a returning master demotes itself on
/// seeing a higher epoch. Pure state machine: heartbeat and timer
/// plumbing lives with the instance event loop.
#[derive(Debug)]
pub struct Election {
    area_id: AreaId,
    instance_id: InstanceId,
    state: fsm::State,
    // Highest epoch observed in the area.
    area_epoch: Epoch,
    // Master that last announced, if still live.
    announced_master: Option<InstanceId>,
    peers: BTreeMap<InstanceId, PeerState>,
}

// ===== impl Election =====

impl Election {
    pub fn new(area_id: AreaId, instance_id: InstanceId) -> Election {
        Election {
            area_id,
            instance_id,
            state: fsm::State::Init,
            area_epoch: Epoch::default(),
            announced_master: None,
            peers: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> fsm::State {
        self.state
    }

    pub fn is_master(&self) -> bool {
        self.state == fsm::State::Master
    }

    pub fn epoch(&self) -> Epoch {
        self.area_epoch
    }

    /// Processes a peer heartbeat. A stale master observing a higher
    /// epoch demotes itself.
    pub fn on_heartbeat(
        &mut self,
        from: InstanceId,
        epoch: Epoch,
    ) -> Result<Option<Action>, Error> {
        if let Some(peer) = self.peers.get(&from)
            && epoch < peer.epoch
        {
            return Err(Error::EpochRegression(
                BusAddr::Instance(self.area_id, from),
                peer.epoch,
                epoch,
            ));
        }
        self.peers.insert(from, PeerState { epoch, missed: 0 });

        if epoch > self.area_epoch {
            self.area_epoch = epoch;
            if self.state == fsm::State::Master {
                return Ok(Some(self.demote()));
            }
        }
        Ok(None)
    }

    /// Processes a master claim. Only a strictly higher epoch displaces
    /// the current view; a stale claim is left to resolve itself when the
    /// claimant sees our heartbeats.
    pub fn on_role_announce(
        &mut self,
        from: InstanceId,
        epoch: Epoch,
    ) -> Option<Action> {
        self.peers
            .entry(from)
            .and_modify(|peer| {
                peer.epoch = epoch;
                peer.missed = 0;
            })
            .or_insert(PeerState { epoch, missed: 0 });

        if epoch <= self.area_epoch && self.state == fsm::State::Master {
            return None;
        }
        self.area_epoch = self.area_epoch.max(epoch);
        self.announced_master = Some(from);
        match self.state {
            fsm::State::Master => Some(self.demote()),
            fsm::State::Init => {
                // A live master ends the init phase early.
                self.set_state(fsm::State::Slave);
                None
            }
            fsm::State::Slave => None,
        }
    }

    /// Root-mediated demotion after a healed partition.
    pub fn on_demote(&mut self, epoch: Epoch) -> Option<Action> {
        self.area_epoch = self.area_epoch.max(epoch);
        match self.state {
            fsm::State::Master => Some(self.demote()),
            _ => None,
        }
    }

    /// Ends the init window: with no live master in sight, the lowest
    /// instance ID claims the area.
    pub fn on_init_timeout(&mut self) -> Option<Action> {
        if self.state != fsm::State::Init {
            return None;
        }
        let lowest_live =
            self.peers.keys().next().copied().unwrap_or(self.instance_id);
        if self.announced_master.is_none()
            && self.instance_id <= lowest_live
        {
            Some(self.promote())
        } else {
            self.set_state(fsm::State::Slave);
            None
        }
    }

    /// One failure-detection tick, expected at the heartbeat interval.
    /// Expires silent peers; when the master fell, the lowest surviving
    /// instance claims the area.
    pub fn on_tick(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let presumed = self.presumed_master();

        let mut failed = Vec::new();
        for (instance, peer) in self.peers.iter_mut() {
            peer.missed = peer.missed.saturating_add(1);
            if peer.missed >= MAX_MISSED_HEARTBEATS {
                failed.push(*instance);
            }
        }
        let mut master_lost = false;
        for instance in failed {
            self.peers.remove(&instance);
            if self.announced_master == Some(instance) {
                self.announced_master = None;
            }
            if presumed == Some(instance) {
                master_lost = true;
            }
            Debug::InstanceFailed(instance).log();
            timeline::emul_event("inst_fail", format_args!("{}", instance));
            actions.push(Action::PeerFailed(instance));
        }

        if master_lost && self.state == fsm::State::Slave {
            let lowest_live = self
                .peers
                .keys()
                .next()
                .copied()
                .unwrap_or(self.instance_id);
            if self.instance_id <= lowest_live {
                actions.push(self.promote());
            }
        }
        actions
    }

    // Current master as this instance sees it: the last announcer if
    // still live, else the lowest live instance.
    fn presumed_master(&self) -> Option<InstanceId> {
        if let Some(master) = self.announced_master
            && self.peers.contains_key(&master)
        {
            return Some(master);
        }
        let mut live: Vec<InstanceId> =
            self.peers.keys().copied().collect();
        live.push(self.instance_id);
        live.into_iter().min()
    }

    fn promote(&mut self) -> Action {
        self.area_epoch = self.area_epoch.next();
        self.announced_master = Some(self.instance_id);
        self.set_state(fsm::State::Master);
        Action::Announce(self.area_epoch)
    }

    fn demote(&mut self) -> Action {
        self.set_state(fsm::State::Slave);
        Action::Demoted
    }

    fn set_state(&mut self, new_state: fsm::State) {
        if self.state != new_state {
            self.state = new_state;
            Debug::RoleChange(new_state, self.area_epoch).log();
            let role = match new_state {
                fsm::State::Master => "master",
                fsm::State::Slave => "slave",
                fsm::State::Init => "unknown",
            };
            timeline::emul_event("role", format_args!("{}", role));
        }
    }
}
