//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::southbound::{
    Bucket, FlowAction, FlowMatch, FlowMod, FlowOp, GroupMod, GroupOp,
    PathHop, SwitchMsg,
};
use helix_utils::{Dpid, Gid, NodeId, PortNo};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::path::{self, Splice, Weight};
use crate::topology::Topology;

// Flow priorities: ingress classification above transit forwarding.
const PRIO_TRANSIT: u16 = 1;
const PRIO_INGRESS: u16 = 2;

// How the controller recovers from data-plane failures.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    // Recompute paths after the failure is reported.
    Reactive,
    // Pre-installed backup plus strict splices (loop-free on known
    // links).
    #[default]
    ProtectionStrict,
    // Pre-installed backup plus loose splices (neighbours assumed to
    // reroute).
    ProtectionLooseSplice,
}

// Paths and splices computed for one candidate.
#[derive(Clone, Debug, Default)]
pub struct ComputedPaths {
    pub primary_nodes: Vec<NodeId>,
    pub backup_nodes: Vec<NodeId>,
    pub primary: Vec<PathHop>,
    pub backup: Vec<PathHop>,
    pub splices: BTreeMap<Dpid, Splice>,
    // Backup shares links with the primary; coverage is not complete.
    pub partial: bool,
}

// One flow entry owned by a candidate on one switch.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct FlowRule {
    pub r#match: FlowMatch,
    pub action: FlowAction,
    pub priority: u16,
}

// The rule program a candidate owns across its on-path switches.
// Controller state is authoritative; switch state is a projection of
// this.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct CandidateRules {
    pub groups: BTreeMap<Dpid, Vec<Bucket>>,
    pub flows: BTreeMap<Dpid, FlowRule>,
}

// ===== impl RecoveryStrategy =====

impl RecoveryStrategy {
    /// Computes primary, backup and splices for a host pair according to
    /// the configured scheme.
    pub fn compute_paths(
        &self,
        topo: &Topology,
        src: &NodeId,
        dst: &NodeId,
        weight: Weight,
    ) -> Result<ComputedPaths, Error> {
        let primary = path::shortest_path(topo, src, dst, weight)
            .ok_or_else(|| Error::PathNotFound(src.clone(), dst.clone()))?;
        self.protect_primary(topo, src, dst, primary, weight)
    }

    /// Re-derives backup and splices around an externally chosen primary
    /// (a TE path change keeps its primary verbatim).
    pub fn protect_primary(
        &self,
        topo: &Topology,
        src: &NodeId,
        dst: &NodeId,
        primary_nodes: Vec<NodeId>,
        weight: Weight,
    ) -> Result<ComputedPaths, Error> {
        let primary = path::path_hops(topo, &primary_nodes)
            .ok_or_else(|| Error::PathNotFound(src.clone(), dst.clone()))?;

        if *self == RecoveryStrategy::Reactive {
            return Ok(ComputedPaths {
                primary_nodes,
                primary,
                ..Default::default()
            });
        }

        let (backup, partial) =
            path::backup_for(topo, src, dst, &primary_nodes, weight);
        let backup_nodes = backup.unwrap_or_default();
        let backup = path::path_hops(topo, &backup_nodes)
            .unwrap_or_default();

        // Splices in both directions, so a failure on the backup can
        // rejoin the primary as well.
        let mut splices = match self {
            RecoveryStrategy::ProtectionStrict => {
                let mut spl = path::splices_strict(
                    topo,
                    &primary_nodes,
                    &backup_nodes,
                );
                spl.extend(path::splices_strict(
                    topo,
                    &backup_nodes,
                    &primary_nodes,
                ));
                spl
            }
            RecoveryStrategy::ProtectionLooseSplice => {
                let mut spl = path::splices_loose(
                    topo,
                    &primary_nodes,
                    &backup_nodes,
                );
                spl.extend(path::splices_loose(
                    topo,
                    &backup_nodes,
                    &primary_nodes,
                ));
                spl
            }
            RecoveryStrategy::Reactive => unreachable!(),
        };
        // A splice never overrides the egress of an on-path hop.
        for hop in primary.iter().chain(backup.iter()) {
            splices.remove(&hop.dpid);
        }

        Ok(ComputedPaths {
            primary_nodes,
            backup_nodes,
            primary,
            backup,
            splices,
            partial,
        })
    }
}

// ===== rule compilation =====

/// Compiles computed paths into the per-switch rule program: one
/// fast-failover group per on-path switch with buckets ordered primary,
/// backup, splices; one flow steering the candidate into its group. The
/// first-hop switch tags the GID as metadata so downstream switches match
/// on it without re-classifying the host pair.
pub fn compile(
    topo: &Topology,
    gid: Gid,
    dst_host: &str,
    paths: &ComputedPaths,
) -> Result<CandidateRules, Error> {
    let mut rules = CandidateRules::default();

    let Some(first) = paths.primary.first() else {
        // Both hosts on the same switch: a single delivery flow.
        return compile_same_switch(topo, gid, dst_host, paths);
    };

    // Group buckets: primary egress first, then backup, then splices.
    for hop in &paths.primary {
        push_bucket(&mut rules.groups, hop.dpid, hop.out_port);
    }
    for hop in &paths.backup {
        push_bucket(&mut rules.groups, hop.dpid, hop.out_port);
    }
    for (dpid, splice) in &paths.splices {
        push_bucket(&mut rules.groups, *dpid, splice.egress);
    }

    // Flows: ingress classification at the first hop, GID metadata match
    // everywhere else the candidate owns a group.
    let dst = topo
        .host(dst_host)
        .ok_or_else(|| Error::HostNotFound(dst_host.to_owned()))?;
    rules.flows.insert(
        first.dpid,
        FlowRule {
            r#match: FlowMatch::Ingress {
                in_port: first.in_port,
                dst_ip: dst.id.ip,
            },
            action: FlowAction::TagAndGroup(gid),
            priority: PRIO_INGRESS,
        },
    );
    for dpid in rules.groups.keys() {
        rules.flows.entry(*dpid).or_insert_with(|| FlowRule {
            r#match: FlowMatch::Metadata(gid),
            action: FlowAction::Group(gid),
            priority: PRIO_TRANSIT,
        });
    }

    Ok(rules)
}

fn compile_same_switch(
    topo: &Topology,
    _gid: Gid,
    dst_host: &str,
    paths: &ComputedPaths,
) -> Result<CandidateRules, Error> {
    let dst = topo
        .host(dst_host)
        .ok_or_else(|| Error::HostNotFound(dst_host.to_owned()))?;
    let (dpid, out_port) = dst.attachment;
    let in_port = paths
        .primary_nodes
        .first()
        .and_then(|src| topo.find_ports(src, &NodeId::Switch(dpid)))
        .map(|(_, sw_port)| sw_port)
        .unwrap_or(PortNo(0));

    let mut rules = CandidateRules::default();
    rules.flows.insert(
        dpid,
        FlowRule {
            r#match: FlowMatch::Ingress {
                in_port,
                dst_ip: dst.id.ip,
            },
            action: FlowAction::Deliver {
                eth_dst: dst.id.mac,
                out_port,
            },
            priority: PRIO_INGRESS,
        },
    );
    Ok(rules)
}

fn push_bucket(
    groups: &mut BTreeMap<Dpid, Vec<Bucket>>,
    dpid: Dpid,
    egress: PortNo,
) {
    let buckets = groups.entry(dpid).or_default();
    if !buckets.iter().any(|b| b.egress == egress) {
        buckets.push(Bucket {
            egress,
            watch: egress,
        });
    }
}

// ===== rule diffing =====

/// Emits the ordered switch program transitioning a candidate from `old`
/// to `new` rules. Ordering guarantees, per switch:
///
/// 1. groups are installed or updated before any flow points at them;
/// 2. flows are removed before the groups they reference;
/// 3. unchanged rules are not touched.
pub fn diff(
    gid: Gid,
    old: &CandidateRules,
    new: &CandidateRules,
) -> Vec<SwitchMsg> {
    let mut msgs = Vec::new();
    let mut touched = Vec::new();

    // Phase 1: group installs and bucket updates.
    for (dpid, buckets) in &new.groups {
        match old.groups.get(dpid) {
            Some(old_buckets) if old_buckets == buckets => (),
            Some(_) => {
                msgs.push(SwitchMsg::Group(GroupMod {
                    dpid: *dpid,
                    gid,
                    op: GroupOp::Modify,
                    buckets: buckets.clone(),
                }));
                touched.push(*dpid);
            }
            None => {
                msgs.push(SwitchMsg::Group(GroupMod {
                    dpid: *dpid,
                    gid,
                    op: GroupOp::Add,
                    buckets: buckets.clone(),
                }));
                touched.push(*dpid);
            }
        }
    }
    barrier_all(&mut msgs, &mut touched);

    // Phase 2: flow activation.
    for (dpid, flow) in &new.flows {
        if old.flows.get(dpid) != Some(flow) {
            msgs.push(SwitchMsg::Flow(FlowMod {
                dpid: *dpid,
                gid,
                op: FlowOp::Add,
                r#match: flow.r#match.clone(),
                action: flow.action.clone(),
                priority: flow.priority,
            }));
            touched.push(*dpid);
        }
    }

    // Phase 3: deactivation of flows that no longer exist.
    for (dpid, flow) in &old.flows {
        if !new.flows.contains_key(dpid) {
            msgs.push(SwitchMsg::Flow(FlowMod {
                dpid: *dpid,
                gid,
                op: FlowOp::Delete,
                r#match: flow.r#match.clone(),
                action: flow.action.clone(),
                priority: flow.priority,
            }));
            touched.push(*dpid);
        }
    }
    barrier_all(&mut msgs, &mut touched);

    // Phase 4: group teardown, after every referencing flow is gone.
    for dpid in old.groups.keys() {
        if !new.groups.contains_key(dpid) {
            msgs.push(SwitchMsg::Group(GroupMod {
                dpid: *dpid,
                gid,
                op: GroupOp::Delete,
                buckets: Vec::new(),
            }));
        }
    }

    msgs
}

/// Emits the teardown program for a candidate: flows first, then groups.
pub fn revoke(gid: Gid, rules: &CandidateRules) -> Vec<SwitchMsg> {
    diff(gid, rules, &CandidateRules::default())
}

fn barrier_all(msgs: &mut Vec<SwitchMsg>, touched: &mut Vec<Dpid>) {
    touched.sort_unstable();
    touched.dedup();
    for dpid in touched.drain(..) {
        // xid is assigned by the controller when the program is sent.
        msgs.push(SwitchMsg::Barrier { dpid, xid: 0 });
    }
}
