//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use helix_utils::bus::BusMsg;
use helix_utils::{Dpid, Epoch, Gid, InstanceId, PortNo};
use tracing::{debug, debug_span};

use crate::election;
use crate::instance::fsm;
use crate::te::ChangeKind;

// Local-controller debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    // Instance
    InstanceStart,
    InstanceStateChange(fsm::State, fsm::State),
    // Topology
    TopologyChanged,
    // Candidates
    CandidateCreate(Gid, &'a str, &'a str),
    CandidateDelete(Gid),
    CandidateNoPath(Gid),
    PathsInstalled(Gid, usize),
    // Stats
    StatsCounterReset(Dpid, PortNo),
    StatsReady,
    // TE
    TeCongestionDetected(Dpid, PortNo, f64),
    TePathChange(Gid, ChangeKind),
    TeCandidateUnusable(Gid, Dpid, PortNo),
    TePartialRejected(Gid, Dpid, PortNo),
    TeResidualCongestion(usize),
    // Election
    RoleChange(election::fsm::State, Epoch),
    InstanceFailed(InstanceId),
    // Internal bus
    BusRx(&'a BusMsg),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceStart => {
                debug!("{}", self);
            }
            Debug::InstanceStateChange(old, new) => {
                debug!(?old, ?new, "{}", self);
            }
            Debug::TopologyChanged => {
                debug!("{}", self);
            }
            Debug::CandidateCreate(gid, src, dst) => {
                debug!(%gid, %src, %dst, "{}", self);
            }
            Debug::CandidateDelete(gid) | Debug::CandidateNoPath(gid) => {
                debug!(%gid, "{}", self);
            }
            Debug::PathsInstalled(gid, rules) => {
                debug!(%gid, %rules, "{}", self);
            }
            Debug::StatsCounterReset(dpid, port) => {
                debug!(%dpid, %port, "{}", self);
            }
            Debug::StatsReady => {
                debug!("{}", self);
            }
            Debug::TeCongestionDetected(dpid, port, ratio) => {
                debug!(%dpid, %port, %ratio, "{}", self);
            }
            Debug::TePathChange(gid, kind) => {
                debug!(%gid, ?kind, "{}", self);
            }
            Debug::TeCandidateUnusable(gid, dpid, port)
            | Debug::TePartialRejected(gid, dpid, port) => {
                debug!(%gid, %dpid, %port, "{}", self);
            }
            Debug::TeResidualCongestion(links) => {
                debug!(%links, "{}", self);
            }
            Debug::RoleChange(state, epoch) => {
                debug!(?state, %epoch, "{}", self);
            }
            Debug::InstanceFailed(instance) => {
                debug!(%instance, "{}", self);
            }
            Debug::BusRx(msg) => {
                debug_span!("bus").in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap();
                        debug!(%data, "{}", self);
                    })
                })
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceStart => {
                write!(f, "starting instance")
            }
            Debug::InstanceStateChange(..) => {
                write!(f, "instance state change")
            }
            Debug::TopologyChanged => {
                write!(f, "topology changed")
            }
            Debug::CandidateCreate(..) => {
                write!(f, "candidate created")
            }
            Debug::CandidateDelete(..) => {
                write!(f, "candidate deleted")
            }
            Debug::CandidateNoPath(..) => {
                write!(f, "candidate parked without path")
            }
            Debug::PathsInstalled(..) => {
                write!(f, "protection rules installed")
            }
            Debug::StatsCounterReset(..) => {
                write!(f, "counter reset detected, sample dropped")
            }
            Debug::StatsReady => {
                write!(f, "stats cycle complete")
            }
            Debug::TeCongestionDetected(..) => {
                write!(f, "link congestion detected")
            }
            Debug::TePathChange(..) => {
                write!(f, "path change accepted")
            }
            Debug::TeCandidateUnusable(..) => {
                write!(f, "candidate cannot avoid congested link")
            }
            Debug::TePartialRejected(..) => {
                write!(f, "partial solution rejected")
            }
            Debug::TeResidualCongestion(..) => {
                write!(f, "residual congestion after pass")
            }
            Debug::RoleChange(..) => {
                write!(f, "role change")
            }
            Debug::InstanceFailed(..) => {
                write!(f, "peer instance failed")
            }
            Debug::BusRx(..) => {
                write!(f, "message")
            }
        }
    }
}
