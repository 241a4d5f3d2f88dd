//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use helix_utils::bus::BusMsg;
use helix_utils::{AreaId, Epoch, InstanceId};
use tracing::{debug, debug_span};

// Root-controller debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    RootStart,
    StitchStart(&'a str, &'a str, usize),
    StitchComplete(&'a str, &'a str),
    StitchFailed(&'a str, &'a str),
    DemoteStaleMaster(AreaId, InstanceId, Epoch),
    BusRx(&'a BusMsg),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::RootStart => {
                debug!("{}", self);
            }
            Debug::StitchStart(src, dst, legs) => {
                debug!(%src, %dst, %legs, "{}", self);
            }
            Debug::StitchComplete(src, dst)
            | Debug::StitchFailed(src, dst) => {
                debug!(%src, %dst, "{}", self);
            }
            Debug::DemoteStaleMaster(area, instance, epoch) => {
                debug!(%area, %instance, %epoch, "{}", self);
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
            Debug::RootStart => {
                write!(f, "starting root controller")
            }
            Debug::StitchStart(..) => {
                write!(f, "stitching inter-area path")
            }
            Debug::StitchComplete(..) => {
                write!(f, "stitched path returned")
            }
            Debug::StitchFailed(..) => {
                write!(f, "no stitched path available")
            }
            Debug::DemoteStaleMaster(..) => {
                write!(f, "demoting stale master")
            }
            Debug::BusRx(..) => {
                write!(f, "message")
            }
        }
    }
}
