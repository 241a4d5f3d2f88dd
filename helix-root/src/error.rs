//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use helix_utils::AreaId;
use helix_utils::bus::BusAddr;
use tracing::{error, warn};

// Root-controller errors.
#[derive(Debug)]
pub enum Error {
    // Stitching
    HostAreaUnknown(String),
    NoInterAreaLink(AreaId, AreaId),
    // Invariant violations (fatal, exit code 3)
    SequenceRegression(BusAddr, u64, u64),
    // Bus (fatal, exit code 2)
    BusClosed,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::HostAreaUnknown(host) => {
                warn!(%host, "{}", self);
            }
            Error::NoInterAreaLink(src, dst) => {
                warn!(%src, %dst, "{}", self);
            }
            Error::SequenceRegression(sender, old, new) => {
                error!(?sender, %old, %new, "{}", self);
            }
            Error::BusClosed => {
                error!("{}", self);
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SequenceRegression(..) | Error::BusClosed
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BusClosed => 2,
            Error::SequenceRegression(..) => 3,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::HostAreaUnknown(..) => {
                write!(f, "destination host not in any known area")
            }
            Error::NoInterAreaLink(..) => {
                write!(f, "no live inter-area link between areas")
            }
            Error::SequenceRegression(..) => {
                write!(f, "non-monotone bus sequence from sender")
            }
            Error::BusClosed => {
                write!(f, "inter-controller bus connection lost")
            }
        }
    }
}

impl std::error::Error for Error {}
