//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::Utc;
use tracing::error;

use crate::{AreaId, InstanceId};

// Timeline event categories.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Action,
    EventLocal,
    EventOfp,
}

/// Writer for the event timeline consumed by the black-box harnesses.
///
/// Lines have the format `<stage>,<cid>[.<inst>],<ts>,<rts>,<kind>,<info>`
/// where `rts` is the delta to the previous event of the same instance
/// (0 for the first).
#[derive(Debug)]
pub struct Timeline {
    stage: String,
    area: AreaId,
    instance: Option<InstanceId>,
    last_ts: Option<f64>,
}

// ===== impl EventKind =====

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Action => write!(f, "action"),
            EventKind::EventLocal => write!(f, "event_local"),
            EventKind::EventOfp => write!(f, "event_ofp"),
        }
    }
}

// ===== impl Timeline =====

impl Timeline {
    pub fn new(
        stage: &str,
        area: AreaId,
        instance: Option<InstanceId>,
    ) -> Timeline {
        Timeline {
            stage: stage.to_owned(),
            area,
            instance,
            last_ts: None,
        }
    }

    /// Record one timeline event.
    pub fn record(&mut self, kind: EventKind, info: &str) {
        let ts = epoch_seconds();
        let rts = match self.last_ts {
            Some(last) => ts - last,
            None => 0.0,
        };
        self.last_ts = Some(ts);

        let id = match self.instance {
            Some(inst) => format!("{}.{}", self.area, inst),
            None => self.area.to_string(),
        };
        // Emitted at error level so emulation harnesses capture the line
        // under any log filter.
        error!(
            target: "timeline",
            "{},{},{:.6},{:.6},{},{}",
            self.stage, id, ts, rts, kind, info
        );
    }
}

/// Emit one `XXXEMUL` control-plane event line.
pub fn emul_event(kind: &str, args: std::fmt::Arguments<'_>) {
    // Emitted at error level so emulation harnesses capture the line
    // under any log filter.
    error!(target: "emul", "XXXEMUL,{:.6},{},{}", epoch_seconds(), kind, args);
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}
