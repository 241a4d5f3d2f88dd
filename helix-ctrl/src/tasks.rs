//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use helix_utils::UnboundedSender;
use helix_utils::task::{IntervalTask, TimeoutTask};

use crate::tasks::messages::input::ProtocolMsg;

// Heartbeat cadence on the inter-controller bus.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

// Init window before a starting instance assigns itself a role.
pub const ELECTION_INIT_WINDOW: Duration = Duration::from_secs(1);

// Switch round-trip supervision.
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(5);
pub const BARRIER_RETRIES: u8 = 3;
pub const BARRIER_BACKOFF: Duration = Duration::from_millis(200);

//
// Local-controller tasks diagram:
//
//                     +--------------+
//      discovery ->   |              |   -> southbound (switch programs)
//   switch events ->  |              |
//                     |              |
//  stats_poll (Nx) -> |   instance   |
//  te_consolidate ->  |              |
// topology_quiesce -> |              |
//  heartbeat_tick ->  |              |
//                     +--------------+
//                 bus_tx | ^ bus_rx
//                        V |
//                     +--------------+
//                     |     bus      |
//                     +--------------+
//

// Local-controller inter-task message types.
pub mod messages {
    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;

    // Input messages (child task -> control task).
    pub mod input {
        use helix_utils::southbound::SwitchEvent;
        use helix_utils::{Dpid, HostId, PortNo};
        use serde::{Deserialize, Serialize};

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum ProtocolMsg {
            // Topology discovery (LLDP collaborator).
            Discovery(DiscoveryMsg),
            // Switch-to-controller events.
            SwitchEvent(SwitchEvent),
            // Stats polling interval tick.
            StatsPollTick,
            // TE consolidation delay expired.
            TeConsolidate,
            // Topology has been quiet for one poll interval.
            TopologyQuiesce,
            // Election heartbeat / failure-detection tick.
            HeartbeatTick,
            // Election init window expired.
            ElectionInitTimeout,
            // Barrier reply overdue.
            BarrierTimeout { xid: u32 },
            // SIGUSR1: dump the candidate send-rate snapshot.
            Snapshot,
            // SIGTERM: orderly shutdown.
            Shutdown,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum DiscoveryMsg {
            LinkAdd {
                u: Dpid,
                p_u: PortNo,
                v: Dpid,
                p_v: PortNo,
                cap_bps: u64,
            },
            LinkDown {
                dpid: Dpid,
                port: PortNo,
            },
            LinkUp {
                dpid: Dpid,
                port: PortNo,
            },
            HostDiscovered {
                host: HostId,
                dpid: Dpid,
                port: PortNo,
            },
            HostLost {
                name: String,
            },
            // Host statically declared in another area; paths to it are
            // stitched by the root controller.
            RemoteHost {
                name: String,
            },
        }
    }
}

// ===== local-controller tasks =====

// Stats polling tick.
pub(crate) fn stats_poll_interval(
    interval: Duration,
    proto_tx: &UnboundedSender<ProtocolMsg>,
) -> IntervalTask {
    let proto_tx = proto_tx.clone();
    IntervalTask::new(interval, false, move || {
        let proto_tx = proto_tx.clone();
        async move {
            let _ = proto_tx.send(ProtocolMsg::StatsPollTick);
        }
    })
}

// Heartbeat and failure-detection tick.
pub(crate) fn heartbeat_interval(
    proto_tx: &UnboundedSender<ProtocolMsg>,
) -> IntervalTask {
    let proto_tx = proto_tx.clone();
    IntervalTask::new(HEARTBEAT_INTERVAL, true, move || {
        let proto_tx = proto_tx.clone();
        async move {
            let _ = proto_tx.send(ProtocolMsg::HeartbeatTick);
        }
    })
}

// TE consolidation delay.
pub(crate) fn te_consolidate_timeout(
    delay: Duration,
    proto_tx: &UnboundedSender<ProtocolMsg>,
) -> TimeoutTask {
    let proto_tx = proto_tx.clone();
    TimeoutTask::new(delay, move || async move {
        let _ = proto_tx.send(ProtocolMsg::TeConsolidate);
    })
}

// Topology quiescence window (DISCOVERING -> STABLE transition).
pub(crate) fn topology_quiesce_timeout(
    interval: Duration,
    proto_tx: &UnboundedSender<ProtocolMsg>,
) -> TimeoutTask {
    let proto_tx = proto_tx.clone();
    TimeoutTask::new(interval, move || async move {
        let _ = proto_tx.send(ProtocolMsg::TopologyQuiesce);
    })
}

// Election init window.
pub(crate) fn election_init_timeout(
    proto_tx: &UnboundedSender<ProtocolMsg>,
) -> TimeoutTask {
    let proto_tx = proto_tx.clone();
    TimeoutTask::new(ELECTION_INIT_WINDOW, move || async move {
        let _ = proto_tx.send(ProtocolMsg::ElectionInitTimeout);
    })
}

// Barrier reply supervision. Retries extend the window by the backoff.
pub(crate) fn barrier_timeout(
    xid: u32,
    timeout: Duration,
    proto_tx: &UnboundedSender<ProtocolMsg>,
) -> TimeoutTask {
    let proto_tx = proto_tx.clone();
    TimeoutTask::new(timeout, move || async move {
        let _ = proto_tx.send(ProtocolMsg::BarrierTimeout { xid });
    })
}
