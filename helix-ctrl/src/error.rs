//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use helix_utils::bus::BusAddr;
use helix_utils::{Dpid, Epoch, Gid, NodeId, PortNo};
use tracing::{error, warn};

// Local-controller errors.
#[derive(Debug)]
pub enum Error {
    // Topology
    TopologyInconsistent(Dpid, PortNo),
    HostNotFound(String),
    // Path computation
    PathNotFound(NodeId, NodeId),
    // Southbound
    SwitchUnresponsive(Dpid),
    BarrierTimeout(Dpid, u32),
    // Invariant violations (fatal, exit code 3)
    EpochRegression(BusAddr, Epoch, Epoch),
    SequenceRegression(BusAddr, u64, u64),
    GroupRefDangling(Dpid, Gid),
    // Bus (fatal, exit code 2)
    BusClosed,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::TopologyInconsistent(dpid, port) => {
                warn!(%dpid, %port, "{}", self);
            }
            Error::HostNotFound(name) => {
                warn!(%name, "{}", self);
            }
            Error::PathNotFound(src, dst) => {
                warn!(%src, %dst, "{}", self);
            }
            Error::SwitchUnresponsive(dpid) => {
                warn!(%dpid, "{}", self);
            }
            Error::BarrierTimeout(dpid, xid) => {
                warn!(%dpid, %xid, "{}", self);
            }
            Error::EpochRegression(sender, old, new) => {
                error!(?sender, %old, %new, "{}", self);
            }
            Error::SequenceRegression(sender, old, new) => {
                error!(?sender, %old, %new, "{}", self);
            }
            Error::GroupRefDangling(dpid, gid) => {
                error!(%dpid, %gid, "{}", self);
            }
            Error::BusClosed => {
                error!("{}", self);
            }
        }
    }

    /// Fatal errors terminate the process after a state dump.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::EpochRegression(..)
                | Error::SequenceRegression(..)
                | Error::GroupRefDangling(..)
                | Error::BusClosed
        )
    }

    /// Process exit code mandated for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BusClosed => 2,
            Error::EpochRegression(..)
            | Error::SequenceRegression(..)
            | Error::GroupRefDangling(..) => 3,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::TopologyInconsistent(..) => {
                write!(f, "port back-reference mismatch")
            }
            Error::HostNotFound(..) => {
                write!(f, "host not present in topology")
            }
            Error::PathNotFound(..) => {
                write!(f, "no path between hosts")
            }
            Error::SwitchUnresponsive(..) => {
                write!(f, "switch marked unresponsive")
            }
            Error::BarrierTimeout(..) => {
                write!(f, "barrier reply timed out")
            }
            Error::EpochRegression(..) => {
                write!(f, "non-monotone election epoch from sender")
            }
            Error::SequenceRegression(..) => {
                write!(f, "non-monotone bus sequence from sender")
            }
            Error::GroupRefDangling(..) => {
                write!(f, "flow references a group that is not installed")
            }
            Error::BusClosed => {
                write!(f, "inter-controller bus connection lost")
            }
        }
    }
}

impl std::error::Error for Error {}
