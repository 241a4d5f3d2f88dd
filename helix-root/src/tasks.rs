//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use helix_utils::UnboundedSender;
use helix_utils::task::IntervalTask;

// Root liveness tick, matching the heartbeat cadence of the areas.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

// Root inter-task message types.
pub mod messages {
    pub mod input {
        use serde::{Deserialize, Serialize};

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum RootMsg {
            // Area liveness tick.
            Tick,
            // SIGTERM: orderly shutdown.
            Shutdown,
        }
    }
}

// ===== root tasks =====

// Area failure-detection tick.
pub(crate) fn tick_interval(
    proto_tx: &UnboundedSender<messages::input::RootMsg>,
) -> IntervalTask {
    let proto_tx = proto_tx.clone();
    IntervalTask::new(TICK_INTERVAL, false, move || {
        let proto_tx = proto_tx.clone();
        async move {
            let _ =
                proto_tx.send(messages::input::RootMsg::Tick);
        }
    })
}
