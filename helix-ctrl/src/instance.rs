//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use helix_utils::bus::{
    BusAddr, BusDest, BusHandle, BusMsg, BusReceiver,
};
use helix_utils::southbound::SwitchMsg;
use helix_utils::task::{IntervalTask, TimeoutTask};
use helix_utils::timeline::{EventKind, Timeline};
use helix_utils::{
    AreaId, Dpid, Gid, InstanceId, PortNo, UnboundedReceiver,
    UnboundedSender,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::CtrlCfg;
use crate::debug::Debug;
use crate::election::Election;
use crate::error::Error;
use crate::events;
use crate::protect::{CandidateRules, ComputedPaths};
use crate::stats::StatsCollector;
use crate::tasks;
use crate::tasks::messages::input::ProtocolMsg;
use crate::te::{TeCandidate, TeEngine, UsageTable};
use crate::topology::Topology;

// Controller state machine.
pub mod fsm {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    pub enum State {
        #[default]
        Init,
        // First link seen; topology still settling.
        Discovering,
        Stable,
        // A link is down; candidates are being re-pathed.
        Degraded,
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum CandidateState {
    #[default]
    Active,
    // No path currently exists; retried on every topology change.
    NoPath,
}

// A tracked source-destination host pair and the forwarding state it
// owns. Controller state is authoritative; the switches hold a
// projection of it.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub gid: Gid,
    pub src: String,
    pub dst: String,
    pub paths: ComputedPaths,
    pub rules: CandidateRules,
    pub rate_bps: u64,
    pub state: CandidateState,
}

#[derive(Debug)]
pub struct BarrierPending {
    pub dpid: Dpid,
    pub retries: u8,
    pub _timer: TimeoutTask,
}

#[derive(Debug, Default)]
pub struct Timers {
    pub stats_poll: Option<IntervalTask>,
    pub heartbeat: Option<IntervalTask>,
    pub te_consolidate: Option<TimeoutTask>,
    pub quiesce: Option<TimeoutTask>,
    pub election_init: Option<TimeoutTask>,
}

#[derive(Debug)]
pub struct InstanceState {
    pub fsm: fsm::State,
    pub up_time: Option<DateTime<Utc>>,
    pub topology: Topology,
    pub candidates: BTreeMap<Gid, Candidate>,
    pub usage: UsageTable,
    pub stats: StatsCollector,
    pub te: TeEngine,
    pub election: Election,
    // Outstanding barrier round-trips, keyed by xid.
    pub pending_barriers: BTreeMap<u32, BarrierPending>,
    pub next_xid: u32,
    // Last sequence number seen per bus sender.
    pub bus_seq: BTreeMap<BusAddr, u64>,
    // Border ports towards neighbouring areas.
    pub inter_area_links: std::collections::BTreeSet<(Dpid, PortNo)>,
    // Hosts declared in other areas, reachable via root stitching.
    pub remote_hosts: std::collections::BTreeSet<String>,
    // Outstanding inter-area path requests.
    pub pending_requests: BTreeMap<u64, (String, String)>,
    pub next_req_id: u64,
    pub timeline: Timeline,
}

/// One local-controller instance.
///
/// All authoritative state is mutated from the single control task
/// driving [`Instance::run`]; pollers, discovery and the bus submit
/// messages into it.
#[derive(Debug)]
pub struct Instance {
    pub name: String,
    pub area_id: AreaId,
    pub instance_id: InstanceId,
    pub config: CtrlCfg,
    pub state: InstanceState,
    pub proto_tx: UnboundedSender<ProtocolMsg>,
    pub southbound_tx: UnboundedSender<SwitchMsg>,
    pub bus: Option<BusHandle>,
    pub timers: Timers,
}

// ===== impl Candidate =====

impl Candidate {
    /// The view the TE engine operates on, or None while the candidate
    /// has no installed path.
    pub fn te_view(&self) -> Option<TeCandidate> {
        let first = self.paths.primary.first()?;
        let groups = self
            .rules
            .groups
            .iter()
            .map(|(dpid, buckets)| {
                (*dpid, buckets.iter().map(|b| b.egress).collect())
            })
            .collect();
        Some(TeCandidate {
            gid: self.gid,
            src: self.src.clone(),
            dst: self.dst.clone(),
            ingress: first.dpid,
            in_port: first.in_port,
            groups,
            primary: self.paths.primary.clone(),
            rate_bps: self.rate_bps,
        })
    }
}

// ===== impl Instance =====

impl Instance {
    pub fn new(
        area_id: AreaId,
        instance_id: InstanceId,
        config: CtrlCfg,
        southbound_tx: UnboundedSender<SwitchMsg>,
        bus: Option<BusHandle>,
    ) -> (Instance, UnboundedReceiver<ProtocolMsg>) {
        let (proto_tx, proto_rx) = mpsc::unbounded_channel();
        let name = format!("{}.{}", area_id, instance_id);
        let state = InstanceState {
            fsm: fsm::State::default(),
            up_time: None,
            topology: Topology::new(),
            candidates: BTreeMap::new(),
            usage: UsageTable::new(),
            stats: StatsCollector::new(Duration::from_secs_f64(
                config.stats.interval,
            )),
            te: TeEngine::new(config.te.clone()),
            election: Election::new(area_id, instance_id),
            pending_barriers: BTreeMap::new(),
            next_xid: 1,
            bus_seq: BTreeMap::new(),
            inter_area_links: std::collections::BTreeSet::new(),
            remote_hosts: std::collections::BTreeSet::new(),
            pending_requests: BTreeMap::new(),
            next_req_id: 1,
            timeline: Timeline::new("ctrl", area_id, Some(instance_id)),
        };
        let instance = Instance {
            name,
            area_id,
            instance_id,
            config,
            state,
            proto_tx,
            southbound_tx,
            bus,
            timers: Timers::default(),
        };
        (instance, proto_rx)
    }

    /// Control task main loop. Returns the process exit code.
    pub async fn run(
        mut self,
        mut proto_rx: UnboundedReceiver<ProtocolMsg>,
        mut bus_rx: Option<BusReceiver>,
    ) -> i32 {
        Debug::InstanceStart.log();
        self.startup();

        loop {
            let result = tokio::select! {
                msg = proto_rx.recv() => {
                    match msg {
                        Some(ProtocolMsg::Shutdown) => {
                            events::process_shutdown(&mut self);
                            return 0;
                        }
                        Some(msg) => {
                            events::process_protocol_msg(&mut self, msg)
                        }
                        None => return 0,
                    }
                }
                envelope = recv_bus(&mut bus_rx) => {
                    match envelope {
                        Some(envelope) => {
                            events::process_bus_msg(&mut self, envelope)
                        }
                        None => Err(Error::BusClosed),
                    }
                }
            };

            if let Err(error) = result {
                error.log();
                if error.is_fatal() {
                    self.state_dump();
                    return error.exit_code();
                }
            }
        }
    }

    fn startup(&mut self) {
        self.state.up_time = Some(Utc::now());
        if self.config.stats.collect {
            self.timers.stats_poll = Some(tasks::stats_poll_interval(
                self.state.stats.interval(),
                &self.proto_tx,
            ));
        }
        if self.bus.is_some() {
            self.timers.heartbeat =
                Some(tasks::heartbeat_interval(&self.proto_tx));
            self.timers.election_init =
                Some(tasks::election_init_timeout(&self.proto_tx));
            // Ask the live set to identify itself right away.
            self.publish_area(BusMsg::RoleQuery);
            helix_utils::timeline::emul_event(
                "send_find",
                format_args!("{}", self.name),
            );
        } else {
            // Single-instance area: this controller owns it.
            let _ = self.state.election.on_init_timeout();
        }
    }

    pub fn is_master(&self) -> bool {
        self.bus.is_none() || self.state.election.is_master()
    }

    /// Seeds static port capacities from the port-description CSV.
    pub fn set_static_port_speeds(
        &mut self,
        entries: impl IntoIterator<Item = (Dpid, PortNo, u64)>,
    ) {
        for (dpid, port, bps) in entries {
            self.state.topology.set_fixed_speed(dpid, port, bps);
        }
    }

    /// Seeds the border ports towards neighbouring areas from the
    /// controller map.
    pub fn set_inter_area_links(
        &mut self,
        links: impl IntoIterator<Item = (Dpid, PortNo)>,
    ) {
        self.state.inter_area_links = links.into_iter().collect();
    }

    /// Statically declares hosts living in other areas; paths to them
    /// are stitched by the root controller.
    pub fn declare_remote_hosts(
        &mut self,
        hosts: impl IntoIterator<Item = String>,
    ) {
        self.state.remote_hosts.extend(hosts);
    }

    pub(crate) fn publish_area(&self, msg: BusMsg) {
        if let Some(bus) = &self.bus {
            bus.publish(BusDest::Area(self.area_id), msg);
        }
    }

    pub(crate) fn publish_roots(&self, msg: BusMsg) {
        if let Some(bus) = &self.bus {
            bus.publish(BusDest::Roots, msg);
        }
    }

    /// Sends a switch rule program southbound, assigning barrier xids
    /// and supervising their round-trips. Only the master programs
    /// switches.
    pub(crate) fn send_program(&mut self, msgs: Vec<SwitchMsg>) {
        if !self.is_master() || msgs.is_empty() {
            return;
        }
        for mut msg in msgs {
            if let SwitchMsg::Barrier { dpid, xid } = &mut msg {
                *xid = self.state.next_xid;
                self.state.next_xid = self.state.next_xid.wrapping_add(1);
                self.state.pending_barriers.insert(
                    *xid,
                    BarrierPending {
                        dpid: *dpid,
                        retries: 0,
                        _timer: tasks::barrier_timeout(
                            *xid,
                            tasks::BARRIER_TIMEOUT,
                            &self.proto_tx,
                        ),
                    },
                );
            }
            let _ = self.southbound_tx.send(msg);
        }
        self.state
            .timeline
            .record(EventKind::Action, "rules_sent");
    }

    /// SIGUSR1: human-readable snapshot of candidate send-rates, plus
    /// ports when configured.
    pub(crate) fn snapshot(&self) {
        if let Some(up_time) = self.state.up_time {
            info!("up since {}", up_time.to_rfc3339());
        }
        let fstr = format!(
            "{:^16} {:>4} {:>10} {:>10} {:>12} {:>12} {:>10}",
            "path(src,dst)", "gid", "pkt", "bt", "t_pkt", "t_bt", "bps"
        );
        info!("{}", fstr);
        for cand in self.state.candidates.values() {
            let hist = self.state.stats.flow_history(cand.gid);
            let (pkt, bt, t_pkt, t_bt) = match hist {
                Some(h) => (
                    h.poll_packets,
                    h.poll_bytes,
                    h.total_packets,
                    h.total_bytes,
                ),
                None => (0, 0, 0, 0),
            };
            info!(
                "{:^16} {:>4} {:>10} {:>10} {:>12} {:>12} {:>10}",
                format!("({},{})", cand.src, cand.dst),
                cand.gid.to_string(),
                pkt,
                bt,
                t_pkt,
                t_bt,
                cand.rate_bps,
            );
        }

        if !self.config.stats.out_port {
            return;
        }
        for dpid in self.state.topology.switches().collect::<Vec<_>>() {
            info!("dpid: {}", dpid);
            for (peer, port, desc) in
                self.state.topology.neighbours(&dpid.into())
            {
                info!(
                    "  port {} -> {}: speed {}b, tx_rate {}bps",
                    port, peer, desc.capacity_bps, desc.tx_rate_bps
                );
            }
        }
    }

    // Fatal-error state dump, emitted before exiting with code 3.
    pub(crate) fn state_dump(&self) {
        let fsm = self.state.fsm;
        let candidates = self.state.candidates.len();
        let election = self.state.election.state();
        let epoch = self.state.election.epoch();
        tracing::error!(
            ?fsm, %candidates, ?election, %epoch,
            "fatal invariant violation, dumping state"
        );
    }

    // FSM transition with logging.
    pub(crate) fn transition(&mut self, new_state: fsm::State) {
        if self.state.fsm != new_state {
            Debug::InstanceStateChange(self.state.fsm, new_state).log();
            self.state.fsm = new_state;
            self.state.timeline.record(
                EventKind::EventLocal,
                &format!("fsm:{:?}", new_state),
            );
        }
    }

    // Verifies that no flow references a missing group before a program
    // is considered consistent.
    pub(crate) fn check_rule_invariant(&self) -> Result<(), Error> {
        for cand in self.state.candidates.values() {
            for (dpid, flow) in &cand.rules.flows {
                let references_group = matches!(
                    flow.action,
                    helix_utils::southbound::FlowAction::Group(_)
                        | helix_utils::southbound::FlowAction::TagAndGroup(_)
                );
                if references_group
                    && !cand.rules.groups.contains_key(dpid)
                {
                    return Err(Error::GroupRefDangling(*dpid, cand.gid));
                }
            }
        }
        Ok(())
    }
}

async fn recv_bus(
    bus_rx: &mut Option<BusReceiver>,
) -> Option<helix_utils::bus::BusEnvelope> {
    match bus_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
