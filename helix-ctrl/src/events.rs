//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::bus::{
    BusAddr, BusEnvelope, BusMsg, CandidateSync, PathSegment,
    SegmentEndpoint, StateSnapshot, StitchedPath, TopologySnapshot,
};
use helix_utils::southbound::{
    Bucket, FlowAction, FlowMatch, PathHop, PortFlags, SwitchEvent,
    SwitchMsg,
};
use helix_utils::timeline::EventKind;
use helix_utils::{Dpid, Gid, NodeId, PortNo};
use itertools::Itertools;

use crate::config::StatsCfg;
use crate::debug::Debug;
use crate::election;
use crate::error::Error;
use crate::instance::{fsm, Candidate, CandidateState, Instance};
use crate::path::{self, Weight};
use crate::protect::{self, CandidateRules, ComputedPaths, FlowRule};
use crate::stats::PendingReplies;
use crate::tasks;
use crate::tasks::messages::input::{DiscoveryMsg, ProtocolMsg};
use crate::te::{PathChange, TeCandidate};

// ===== protocol message dispatch =====

pub(crate) fn process_protocol_msg(
    instance: &mut Instance,
    msg: ProtocolMsg,
) -> Result<(), Error> {
    match msg {
        ProtocolMsg::Discovery(msg) => process_discovery(instance, msg),
        ProtocolMsg::SwitchEvent(event) => {
            process_switch_event(instance, event)
        }
        ProtocolMsg::StatsPollTick => process_stats_poll(instance),
        ProtocolMsg::TeConsolidate => process_te_consolidate(instance),
        ProtocolMsg::TopologyQuiesce => process_quiesce(instance),
        ProtocolMsg::HeartbeatTick => process_heartbeat_tick(instance),
        ProtocolMsg::ElectionInitTimeout => {
            let action = instance.state.election.on_init_timeout();
            apply_election_actions(instance, action.into_iter().collect())
        }
        ProtocolMsg::BarrierTimeout { xid } => {
            process_barrier_timeout(instance, xid)
        }
        ProtocolMsg::Snapshot => {
            instance.snapshot();
            Ok(())
        }
        // Handled by the run loop.
        ProtocolMsg::Shutdown => Ok(()),
    }
}

// ===== topology discovery =====

fn process_discovery(
    instance: &mut Instance,
    msg: DiscoveryMsg,
) -> Result<(), Error> {
    let mut changed = false;
    let mut degraded = false;

    match msg {
        DiscoveryMsg::LinkAdd {
            u,
            p_u,
            v,
            p_v,
            cap_bps,
        } => {
            changed =
                instance.state.topology.add_link(u, p_u, v, p_v, cap_bps)?;
            if instance.state.fsm == fsm::State::Init && changed {
                instance.transition(fsm::State::Discovering);
            }
        }
        DiscoveryMsg::LinkDown { dpid, port } => {
            changed = instance.state.topology.link_down(dpid, port);
            degraded = changed;
        }
        DiscoveryMsg::LinkUp { dpid, port } => {
            changed = instance.state.topology.link_up(dpid, port);
        }
        DiscoveryMsg::HostDiscovered { host, dpid, port } => {
            changed = instance.state.topology.add_host(host, dpid, port)?;
            if changed {
                ensure_candidates(instance);
            }
        }
        DiscoveryMsg::HostLost { name } => {
            changed = instance.state.topology.remove_host(&name);
            if changed {
                destroy_candidates_of(instance, &name);
            }
        }
        DiscoveryMsg::RemoteHost { name } => {
            if instance.state.remote_hosts.insert(name) {
                request_remote_paths(instance);
            }
        }
    }

    if !changed {
        return Ok(());
    }
    Debug::TopologyChanged.log();
    instance
        .state
        .timeline
        .record(EventKind::EventLocal, "topology_change");

    // A topology change supersedes any pending TE pass.
    instance.state.te.cancel_pending();
    instance.timers.te_consolidate = None;

    match instance.state.fsm {
        fsm::State::Init => Ok(()),
        fsm::State::Discovering => {
            // Restart the quiescence window.
            instance.timers.quiesce =
                Some(tasks::topology_quiesce_timeout(
                    instance.state.stats.interval(),
                    &instance.proto_tx,
                ));
            Ok(())
        }
        fsm::State::Stable | fsm::State::Degraded => {
            if degraded {
                instance.transition(fsm::State::Degraded);
            }
            recompute_all(instance)
        }
    }
}

fn process_quiesce(instance: &mut Instance) -> Result<(), Error> {
    instance.timers.quiesce = None;
    if instance.state.fsm == fsm::State::Discovering {
        instance.transition(fsm::State::Stable);
        recompute_all(instance)?;
    }
    Ok(())
}

// ===== candidate management =====

// Candidates exist for every ordered pair of known hosts; pairs with a
// remote end are resolved through the root controller.
fn ensure_candidates(instance: &mut Instance) {
    let hosts: Vec<String> = instance
        .state
        .topology
        .hosts()
        .map(|host| host.id.name.clone())
        .collect();

    for (src, dst) in hosts
        .iter()
        .cartesian_product(hosts.iter())
        .filter(|(src, dst)| src != dst)
    {
        let Some(gid) = Gid::from_pair(src, dst) else {
            continue;
        };
        instance.state.candidates.entry(gid).or_insert_with(|| {
            Debug::CandidateCreate(gid, src, dst).log();
            Candidate {
                gid,
                src: src.clone(),
                dst: dst.clone(),
                paths: ComputedPaths::default(),
                rules: CandidateRules::default(),
                rate_bps: 0,
                state: CandidateState::NoPath,
            }
        });
    }
    request_remote_paths(instance);
}

fn destroy_candidates_of(instance: &mut Instance, host: &str) {
    let doomed: Vec<Gid> = instance
        .state
        .candidates
        .values()
        .filter(|cand| cand.src == host || cand.dst == host)
        .map(|cand| cand.gid)
        .collect();
    for gid in doomed {
        let cand = instance.state.candidates.remove(&gid).unwrap();
        Debug::CandidateDelete(gid).log();
        let msgs = protect::revoke(gid, &cand.rules);
        instance.send_program(msgs);
        instance.state.usage.remove(gid);
        instance.state.stats.forget_flow(gid);
    }
}

// Asks the root for stitched paths from every local host to every
// declared remote host.
fn request_remote_paths(instance: &mut Instance) {
    if !instance.is_master() {
        return;
    }
    let locals: Vec<String> = instance
        .state
        .topology
        .hosts()
        .map(|host| host.id.name.clone())
        .collect();
    let remotes: Vec<String> =
        instance.state.remote_hosts.iter().cloned().collect();

    for src in &locals {
        for dst in &remotes {
            let req_id = instance.state.next_req_id;
            instance.state.next_req_id += 1;
            instance
                .state
                .pending_requests
                .insert(req_id, (src.clone(), dst.clone()));
            instance.publish_roots(BusMsg::InterAreaRequest {
                req_id,
                src_host: src.clone(),
                dst_host: dst.clone(),
            });
        }
    }
}

// ===== path computation and installation =====

// Recomputes every candidate against the current topology. Unaffected
// candidates produce an empty diff and their rules are left untouched.
pub(crate) fn recompute_all(instance: &mut Instance) -> Result<(), Error> {
    if !instance.is_master() {
        return Ok(());
    }

    let gids: Vec<Gid> =
        instance.state.candidates.keys().copied().collect();
    for gid in gids {
        let (src, dst) = {
            let cand = &instance.state.candidates[&gid];
            (cand.src.clone(), cand.dst.clone())
        };
        if instance.state.remote_hosts.contains(&dst) {
            continue;
        }

        let strategy = instance.config.application.recovery;
        let computed = strategy.compute_paths(
            &instance.state.topology,
            &NodeId::Host(src.clone()),
            &NodeId::Host(dst.clone()),
            Weight::Unit,
        );
        match computed {
            Ok(paths) => {
                let rules = protect::compile(
                    &instance.state.topology,
                    gid,
                    &dst,
                    &paths,
                )?;
                install_candidate(instance, gid, paths, rules);
            }
            Err(error @ Error::PathNotFound(..)) => {
                error.log();
                park_candidate(instance, gid);
            }
            Err(error) => return Err(error),
        }
    }

    if instance.state.fsm == fsm::State::Degraded
        && instance.state.pending_barriers.is_empty()
    {
        instance.transition(fsm::State::Stable);
    }
    instance.check_rule_invariant()?;
    sync_peers(instance);
    Ok(())
}

fn install_candidate(
    instance: &mut Instance,
    gid: Gid,
    paths: ComputedPaths,
    rules: CandidateRules,
) {
    let cand = instance.state.candidates.get_mut(&gid).unwrap();
    let msgs = protect::diff(gid, &cand.rules, &rules);
    let rate = cand.rate_bps;
    cand.paths = paths;
    cand.rules = rules;
    cand.state = CandidateState::Active;
    let primary = cand.paths.primary.clone();
    if !msgs.is_empty() {
        Debug::PathsInstalled(gid, msgs.len()).log();
    }
    instance.send_program(msgs);
    instance.state.usage.record(gid, &primary, rate);
}

fn park_candidate(instance: &mut Instance, gid: Gid) {
    let cand = instance.state.candidates.get_mut(&gid).unwrap();
    if cand.state == CandidateState::NoPath && cand.rules.flows.is_empty()
    {
        return;
    }
    let rules = std::mem::take(&mut cand.rules);
    cand.paths = ComputedPaths::default();
    cand.state = CandidateState::NoPath;
    Debug::CandidateNoPath(gid).log();
    let msgs = protect::revoke(gid, &rules);
    instance.send_program(msgs);
    instance.state.usage.remove(gid);
}

// Pushes the candidate snapshot to slaves and the topology advisory to
// the root controllers.
fn sync_peers(instance: &mut Instance) {
    if instance.bus.is_none() || !instance.is_master() {
        return;
    }
    let candidates = instance
        .state
        .candidates
        .values()
        .map(|cand| CandidateSync {
            gid: cand.gid,
            src: cand.src.clone(),
            dst: cand.dst.clone(),
            primary: cand.paths.primary.clone(),
            backup: cand.paths.backup.clone(),
            rate_bps: cand.rate_bps,
        })
        .collect();
    instance.publish_area(BusMsg::StateSync(StateSnapshot {
        epoch: instance.state.election.epoch(),
        candidates,
    }));

    let hosts = instance
        .state
        .topology
        .hosts()
        .map(|host| host.id.clone())
        .collect();
    instance.publish_roots(BusMsg::TopologyUpdate(TopologySnapshot {
        hosts,
        inter_area_links: Vec::new(),
    }));
}

// ===== stats collection =====

fn expected_replies(cfg: &StatsCfg) -> PendingReplies {
    let mut expect = PendingReplies::FLOW;
    if cfg.collect_port {
        expect |= PendingReplies::PORT;
    }
    expect
}

fn process_stats_poll(instance: &mut Instance) -> Result<(), Error> {
    if !instance.config.stats.collect || !instance.is_master() {
        return Ok(());
    }
    let switches: Vec<Dpid> =
        instance.state.topology.switches().collect();
    instance.state.stats.begin_cycle(
        switches.iter().copied(),
        expected_replies(&instance.config.stats),
    );
    for dpid in switches {
        if instance.config.stats.collect_port {
            let _ = instance
                .southbound_tx
                .send(SwitchMsg::PortStatsRequest { dpid });
        }
        let _ = instance
            .southbound_tx
            .send(SwitchMsg::FlowStatsRequest { dpid });
    }
    instance.state.te.backoff_tick();
    Ok(())
}

fn process_switch_event(
    instance: &mut Instance,
    event: SwitchEvent,
) -> Result<(), Error> {
    match event {
        SwitchEvent::PortStats { dpid, ports } => {
            let samples =
                instance.state.stats.process_port_stats(dpid, &ports);
            for sample in samples {
                instance.state.topology.set_port_usage(
                    sample.dpid,
                    sample.port,
                    sample.tx_rate_bps,
                );
                check_congestion(
                    instance,
                    sample.dpid,
                    sample.port,
                    sample.tx_rate_bps,
                );
            }
            if instance
                .state
                .stats
                .reply_received(dpid, PendingReplies::PORT)
            {
                stats_ready(instance);
            }
            Ok(())
        }
        SwitchEvent::FlowStats { dpid, flows } => {
            // Candidate rates come from the first-hop flow counter only.
            let first_hop: Vec<_> = flows
                .iter()
                .filter(|sample| {
                    instance
                        .state
                        .candidates
                        .get(&sample.gid)
                        .and_then(|cand| cand.paths.primary.first())
                        .map(|first| first.dpid == dpid)
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            let rates =
                instance.state.stats.process_flow_stats(dpid, &first_hop);
            for (gid, rate) in rates {
                if let Some(cand) =
                    instance.state.candidates.get_mut(&gid)
                {
                    cand.rate_bps = rate;
                    let primary = cand.paths.primary.clone();
                    instance.state.usage.record(gid, &primary, rate);
                }
            }
            if instance
                .state
                .stats
                .reply_received(dpid, PendingReplies::FLOW)
            {
                stats_ready(instance);
            }
            Ok(())
        }
        SwitchEvent::PortStatus { dpid, port, flags } => {
            instance
                .state
                .timeline
                .record(EventKind::EventOfp, "port_status");
            let msg = if flags.contains(PortFlags::LINK_UP) {
                DiscoveryMsg::LinkUp { dpid, port }
            } else {
                DiscoveryMsg::LinkDown { dpid, port }
            };
            process_discovery(instance, msg)
        }
        SwitchEvent::PortDesc {
            dpid,
            port,
            speed_bps,
        } => {
            instance
                .state
                .topology
                .set_port_capacity(dpid, port, speed_bps);
            Ok(())
        }
        SwitchEvent::BarrierReply { dpid: _, xid } => {
            instance.state.pending_barriers.remove(&xid);
            if instance.state.fsm == fsm::State::Degraded
                && instance.state.pending_barriers.is_empty()
            {
                instance.transition(fsm::State::Stable);
            }
            Ok(())
        }
        SwitchEvent::Disconnect { dpid } => {
            evacuate_switch(instance, dpid)
        }
    }
}

fn check_congestion(
    instance: &mut Instance,
    dpid: Dpid,
    port: PortNo,
    rate_bps: u64,
) {
    if !instance.config.te_enabled() || !instance.is_master() {
        return;
    }
    let Some(desc) = instance.state.topology.edge(dpid, port) else {
        return;
    };
    if desc.capacity_bps == 0
        || instance.state.topology.is_host_port(dpid, port)
    {
        return;
    }
    let ratio = rate_bps as f64 / desc.capacity_bps as f64;
    if instance.state.te.check_link_congested(dpid, port, ratio) {
        // Batch near-simultaneous triggers into one pass.
        instance.timers.te_consolidate =
            Some(tasks::te_consolidate_timeout(
                std::time::Duration::from_secs_f64(
                    instance.config.te.consolidate_time,
                ),
                &instance.proto_tx,
            ));
    }
}

fn stats_ready(instance: &mut Instance) {
    Debug::StatsReady.log();
    instance
        .state
        .timeline
        .record(EventKind::EventLocal, "stats_ready");
}

// ===== TE optimisation =====

fn process_te_consolidate(instance: &mut Instance) -> Result<(), Error> {
    instance.timers.te_consolidate = None;
    if !instance.config.te_enabled() || !instance.is_master() {
        return Ok(());
    }

    let te_cands: BTreeMap<Gid, TeCandidate> = instance
        .state
        .candidates
        .values()
        .filter_map(|cand| cand.te_view())
        .map(|view| (view.gid, view))
        .collect();
    let report = instance.state.te.run_pass(
        &instance.state.topology,
        &mut instance.state.usage,
        &te_cands,
    );

    for change in report.changes {
        apply_path_change(instance, change)?;
    }

    if !report.residual.is_empty() {
        Debug::TeResidualCongestion(report.residual.len()).log();
        for (dpid, port) in report.residual {
            if instance.state.inter_area_links.contains(&(dpid, port)) {
                let rate_bps = instance.state.usage.total(dpid, port);
                let candidates = instance
                    .state
                    .usage
                    .link(dpid, port)
                    .map(|link| {
                        link.contributions()
                            .filter_map(|(gid, _)| {
                                instance
                                    .state
                                    .candidates
                                    .get(&gid)
                                    .map(|c| (c.src.clone(), c.dst.clone()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                instance.publish_roots(BusMsg::InterAreaCongested {
                    dpid,
                    port,
                    rate_bps,
                    candidates,
                });
                instance.state.te.suppress_inter_area(dpid, port);
            }
        }
    }

    instance.check_rule_invariant()?;
    sync_peers(instance);
    Ok(())
}

// Applies one accepted TE change: the new primary is kept verbatim and
// protection is re-derived around it.
fn apply_path_change(
    instance: &mut Instance,
    change: PathChange,
) -> Result<(), Error> {
    let PathChange {
        gid, new_primary, ..
    } = change;
    let Some(cand) = instance.state.candidates.get(&gid) else {
        return Ok(());
    };
    let (src, dst) = (cand.src.clone(), cand.dst.clone());

    let mut nodes = Vec::with_capacity(new_primary.len() + 2);
    nodes.push(NodeId::Host(src.clone()));
    nodes.extend(
        new_primary.iter().map(|hop| NodeId::Switch(hop.dpid)),
    );
    nodes.push(NodeId::Host(dst.clone()));

    let strategy = if instance.config.application.optimise_protection {
        instance.config.application.recovery
    } else {
        crate::protect::RecoveryStrategy::Reactive
    };
    let paths = strategy.protect_primary(
        &instance.state.topology,
        &NodeId::Host(src),
        &NodeId::Host(dst.clone()),
        nodes,
        Weight::Unit,
    )?;
    let rules =
        protect::compile(&instance.state.topology, gid, &dst, &paths)?;
    install_candidate(instance, gid, paths, rules);

    // The candidate moved off the congested link; the egress of
    // inter-area paths may have changed with it.
    if let Some(last) = new_primary.last()
        && instance
            .state
            .inter_area_links
            .contains(&(last.dpid, last.out_port))
    {
        instance.publish_roots(BusMsg::EgressChange {
            gid,
            egress: (last.dpid, last.out_port),
        });
    }
    Ok(())
}

// ===== switch supervision =====

fn process_barrier_timeout(
    instance: &mut Instance,
    xid: u32,
) -> Result<(), Error> {
    let Some(pending) = instance.state.pending_barriers.get_mut(&xid)
    else {
        return Ok(());
    };
    let dpid = pending.dpid;

    if pending.retries < tasks::BARRIER_RETRIES {
        pending.retries += 1;
        Error::BarrierTimeout(dpid, xid).log();
        // Back off before the retransmission is supervised again.
        let proto_tx = instance.proto_tx.clone();
        pending._timer = tasks::barrier_timeout(
            xid,
            tasks::BARRIER_BACKOFF + tasks::BARRIER_TIMEOUT,
            &proto_tx,
        );
        let _ = instance
            .southbound_tx
            .send(SwitchMsg::Barrier { dpid, xid });
        return Ok(());
    }

    instance.state.pending_barriers.remove(&xid);
    Error::SwitchUnresponsive(dpid).log();
    evacuate_switch(instance, dpid)
}

// Escalates an unresponsive switch to link-down on all its ports so its
// candidates move elsewhere while the edges stay revivable.
fn evacuate_switch(
    instance: &mut Instance,
    dpid: Dpid,
) -> Result<(), Error> {
    instance.state.stats.forget_switch(dpid);
    let ports: Vec<PortNo> = instance
        .state
        .topology
        .neighbours(&NodeId::Switch(dpid))
        .into_iter()
        .map(|(_, port, _)| port)
        .collect();
    for port in ports {
        process_discovery(
            instance,
            DiscoveryMsg::LinkDown { dpid, port },
        )?;
    }
    Ok(())
}

// ===== election =====

fn process_heartbeat_tick(instance: &mut Instance) -> Result<(), Error> {
    instance.publish_area(BusMsg::Heartbeat {
        epoch: instance.state.election.epoch(),
    });
    let actions = instance.state.election.on_tick();
    apply_election_actions(instance, actions)
}

fn apply_election_actions(
    instance: &mut Instance,
    actions: Vec<election::Action>,
) -> Result<(), Error> {
    for action in actions {
        match action {
            election::Action::Announce(epoch) => {
                instance.publish_area(BusMsg::RoleAnnounce { epoch });
                send_role_change(instance, true, epoch.0);
                // The new master owns installation from here on.
                recompute_all(instance)?;
            }
            election::Action::Demoted => {
                send_role_change(instance, false, 0);
            }
            election::Action::PeerFailed(_) => (),
        }
    }
    Ok(())
}

fn send_role_change(
    instance: &mut Instance,
    master: bool,
    generation: u64,
) {
    let switches: Vec<Dpid> =
        instance.state.topology.switches().collect();
    for dpid in switches {
        let _ = instance.southbound_tx.send(SwitchMsg::RoleChange {
            dpid,
            master,
            generation,
        });
    }
}

// ===== bus input =====

pub(crate) fn process_bus_msg(
    instance: &mut Instance,
    envelope: BusEnvelope,
) -> Result<(), Error> {
    Debug::BusRx(&envelope.msg).log();

    // Per-sender sequence numbers are monotone; duplicates (at-least-once
    // delivery) are skipped.
    if let Some(last) = instance.state.bus_seq.get(&envelope.src) {
        if envelope.seq < *last {
            return Err(Error::SequenceRegression(
                envelope.src,
                *last,
                envelope.seq,
            ));
        }
        if envelope.seq == *last {
            return Ok(());
        }
    }
    instance.state.bus_seq.insert(envelope.src, envelope.seq);

    let peer_instance = match envelope.src {
        BusAddr::Instance(area, peer) if area == instance.area_id => {
            Some(peer)
        }
        _ => None,
    };

    match envelope.msg {
        BusMsg::Heartbeat { epoch } => {
            if let Some(peer) = peer_instance {
                let action =
                    instance.state.election.on_heartbeat(peer, epoch)?;
                apply_election_actions(
                    instance,
                    action.into_iter().collect(),
                )?;
            }
            Ok(())
        }
        BusMsg::RoleQuery => {
            // A joining instance wants the live set now.
            instance.publish_area(BusMsg::Heartbeat {
                epoch: instance.state.election.epoch(),
            });
            Ok(())
        }
        BusMsg::RoleAnnounce { epoch } => {
            if let Some(peer) = peer_instance {
                let action =
                    instance.state.election.on_role_announce(peer, epoch);
                apply_election_actions(
                    instance,
                    action.into_iter().collect(),
                )?;
            }
            Ok(())
        }
        BusMsg::RoleDemote { epoch } => {
            let action = instance.state.election.on_demote(epoch);
            apply_election_actions(instance, action.into_iter().collect())
        }
        BusMsg::StateSync(snapshot) => {
            if !instance.is_master() {
                adopt_snapshot(instance, snapshot);
            }
            Ok(())
        }
        BusMsg::SegmentRequest { req_id, from, to } => {
            if instance.is_master() {
                let segment = compute_segment(instance, &from, &to);
                instance.publish_roots(BusMsg::SegmentResponse {
                    req_id,
                    segment,
                });
            }
            Ok(())
        }
        BusMsg::InterAreaResponse {
            req_id,
            src_host,
            dst_host,
            path,
        } => {
            instance.state.pending_requests.remove(&req_id);
            if let Some(stitched) = path {
                install_stitched_segment(
                    instance, &src_host, &dst_host, stitched,
                )?;
            }
            Ok(())
        }
        // Root-side traffic observed on the shared bus.
        BusMsg::TopologyUpdate(_)
        | BusMsg::SegmentResponse { .. }
        | BusMsg::InterAreaRequest { .. }
        | BusMsg::InterAreaCongested { .. }
        | BusMsg::EgressChange { .. } => Ok(()),
    }
}

// Slaves shadow the master's candidate set so failover needs no state
// transfer.
fn adopt_snapshot(instance: &mut Instance, snapshot: StateSnapshot) {
    let mut candidates = BTreeMap::new();
    for sync in snapshot.candidates {
        candidates.insert(
            sync.gid,
            Candidate {
                gid: sync.gid,
                src: sync.src,
                dst: sync.dst,
                paths: ComputedPaths {
                    primary: sync.primary,
                    backup: sync.backup,
                    ..Default::default()
                },
                rules: CandidateRules::default(),
                rate_bps: sync.rate_bps,
                state: CandidateState::Active,
            },
        );
    }
    instance.state.candidates = candidates;
}

// Computes the local path segment the root asked for.
fn compute_segment(
    instance: &Instance,
    from: &SegmentEndpoint,
    to: &SegmentEndpoint,
) -> Option<PathSegment> {
    let from_node = endpoint_node(from);
    let to_node = endpoint_node(to);
    let topo = &instance.state.topology;

    let nodes =
        path::shortest_path(topo, &from_node, &to_node, Weight::Cspf)?;
    let mut hops = path::path_hops(topo, &nodes)?;
    // A segment towards a border link exits on the border port.
    if let SegmentEndpoint::Border(dpid, port) = to {
        let in_port = match nodes.len() {
            0 | 1 => PortNo(0),
            len => topo
                .find_ports(&nodes[len - 2], &to_node)
                .map(|(_, ingress)| ingress)
                .unwrap_or(PortNo(0)),
        };
        hops.push(PathHop {
            dpid: *dpid,
            in_port,
            out_port: *port,
        });
    }
    let max_utilisation = path::max_utilisation(topo, &hops);
    Some(PathSegment {
        hops,
        max_utilisation,
    })
}

fn endpoint_node(endpoint: &SegmentEndpoint) -> NodeId {
    match endpoint {
        SegmentEndpoint::Host(name) => NodeId::Host(name.clone()),
        SegmentEndpoint::Border(dpid, _) => NodeId::Switch(*dpid),
    }
}

// Installs this area's segment of a root-stitched inter-area path.
fn install_stitched_segment(
    instance: &mut Instance,
    src_host: &str,
    dst_host: &str,
    stitched: StitchedPath,
) -> Result<(), Error> {
    if !instance.is_master() {
        return Ok(());
    }
    let Some(gid) = Gid::from_pair(src_host, dst_host) else {
        return Ok(());
    };
    let local_src = instance.state.topology.host(src_host).is_some();
    let segment = if local_src {
        &stitched.src_segment
    } else {
        &stitched.dst_segment
    };

    let mut rules = CandidateRules::default();
    for hop in &segment.hops {
        rules.groups.insert(
            hop.dpid,
            vec![Bucket {
                egress: hop.out_port,
                watch: hop.out_port,
            }],
        );
        rules.flows.insert(
            hop.dpid,
            FlowRule {
                r#match: FlowMatch::Metadata(gid),
                action: FlowAction::Group(gid),
                priority: 1,
            },
        );
    }
    // The source area classifies and tags at the first hop.
    if local_src
        && let Some(first) = segment.hops.first()
    {
        rules.flows.insert(
            first.dpid,
            FlowRule {
                r#match: FlowMatch::Ingress {
                    in_port: first.in_port,
                    dst_ip: stitched.dst_ip,
                },
                action: FlowAction::TagAndGroup(gid),
                priority: 2,
            },
        );
    }

    let hops = segment.hops.clone();
    let cand = instance
        .state
        .candidates
        .entry(gid)
        .or_insert_with(|| Candidate {
            gid,
            src: src_host.to_owned(),
            dst: dst_host.to_owned(),
            paths: ComputedPaths::default(),
            rules: CandidateRules::default(),
            rate_bps: 0,
            state: CandidateState::Active,
        });
    let msgs = protect::diff(gid, &cand.rules, &rules);
    let rate = cand.rate_bps;
    cand.paths = ComputedPaths {
        primary: hops.clone(),
        ..Default::default()
    };
    cand.rules = rules;
    cand.state = CandidateState::Active;
    instance.send_program(msgs);
    instance.state.usage.record(gid, &hops, rate);
    instance.check_rule_invariant()
}

// ===== shutdown =====

// SIGTERM: flows first, then groups, then the bus, then exit.
pub(crate) fn process_shutdown(instance: &mut Instance) {
    let gids: Vec<Gid> =
        instance.state.candidates.keys().copied().collect();
    for gid in gids {
        let rules = std::mem::take(
            &mut instance.state.candidates.get_mut(&gid).unwrap().rules,
        );
        let msgs = protect::revoke(gid, &rules);
        instance.send_program(msgs);
    }
    if let Some(bus) = &instance.bus {
        bus.leave();
    }
}
