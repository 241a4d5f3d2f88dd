//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use helix_utils::southbound::PathHop;
use helix_utils::{Dpid, NodeId, PortNo};

use crate::topology::{PortDesc, Topology};

// CSPF usage weighting factor. Large enough that a saturated edge costs
// more than any hop-count difference, while the hop term dominates among
// unsaturated edges.
pub const CSPF_ALPHA: u64 = 1 << 20;

// Cost penalty applied to already-used edges when computing minimally
// overlapping backup paths.
const OVERLAP_PENALTY: u64 = 100_000;

// Edge weight functions for shortest-path queries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Weight {
    // Hop count.
    Unit,
    // 1 + alpha * usage/capacity.
    Cspf,
}

// Primary/backup path pair. `partial` records that the backup shares
// nodes or links with the primary, so protection coverage is incomplete.
#[derive(Clone, Debug)]
pub struct DisjointPair {
    pub primary: Vec<NodeId>,
    pub backup: Option<Vec<NodeId>>,
    pub partial: bool,
}

// A splice: an alternate egress at an on-path switch joining it onto the
// backup path without revisiting the switch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Splice {
    pub nodes: Vec<NodeId>,
    pub egress: PortNo,
}

// Per-node label during the Dijkstra run.
#[derive(Clone, Debug)]
struct Label {
    cost: u64,
    // Maximum edge utilisation along the path, in per-mille. First-order
    // tie-break when the weight function includes TE metrics.
    util_pm: u32,
    hops: u16,
    prev: Option<NodeId>,
}

impl Label {
    fn key(&self, node: &NodeId) -> (u64, u32, u16, NodeId) {
        (self.cost, self.util_pm, self.hops, node.clone())
    }
}

// ===== impl Weight =====

impl Weight {
    fn edge_cost(&self, desc: &PortDesc) -> u64 {
        match self {
            Weight::Unit => 1,
            Weight::Cspf => {
                1 + (CSPF_ALPHA as f64 * desc.utilisation()) as u64
            }
        }
    }
}

// ===== shortest-path queries =====

/// Shortest path between two nodes.
///
/// Ties are broken by smaller maximum edge utilisation (only relevant for
/// TE weights), then fewer hops, then the lexicographically smaller node
/// sequence. Equal sources and destinations yield an empty path;
/// disconnected ones yield `None`.
pub fn shortest_path(
    topo: &Topology,
    src: &NodeId,
    dst: &NodeId,
    weight: Weight,
) -> Option<Vec<NodeId>> {
    dijkstra(topo, src, dst, weight, &|_, _, _| true, &|_| true, &|_, _| 0)
}

/// Shortest path with edge and node constraints and an additive edge
/// penalty, for CSPF pruning and disjoint-path computation.
pub fn constrained_path(
    topo: &Topology,
    src: &NodeId,
    dst: &NodeId,
    weight: Weight,
    edge_ok: &dyn Fn(Dpid, PortNo, &PortDesc) -> bool,
    node_ok: &dyn Fn(&NodeId) -> bool,
    extra_cost: &dyn Fn(Dpid, PortNo) -> u64,
) -> Option<Vec<NodeId>> {
    dijkstra(topo, src, dst, weight, edge_ok, node_ok, extra_cost)
}

fn dijkstra(
    topo: &Topology,
    src: &NodeId,
    dst: &NodeId,
    weight: Weight,
    edge_ok: &dyn Fn(Dpid, PortNo, &PortDesc) -> bool,
    node_ok: &dyn Fn(&NodeId) -> bool,
    extra_cost: &dyn Fn(Dpid, PortNo) -> u64,
) -> Option<Vec<NodeId>> {
    if !topo.contains(src) || !topo.contains(dst) {
        return None;
    }
    if src == dst {
        return Some(Vec::new());
    }

    let mut labels: BTreeMap<NodeId, Label> = BTreeMap::new();
    let mut cand_list: BTreeMap<(u64, u32, u16, NodeId), ()> =
        BTreeMap::new();
    let mut settled: BTreeSet<NodeId> = BTreeSet::new();

    let root = Label {
        cost: 0,
        util_pm: 0,
        hops: 0,
        prev: None,
    };
    cand_list.insert(root.key(src), ());
    labels.insert(src.clone(), root);

    // Main loop, settling one vertex per iteration.
    while let Some(((_, _, _, vertex), ())) = cand_list.pop_first() {
        if !settled.insert(vertex.clone()) {
            continue;
        }
        if vertex == *dst {
            break;
        }
        let vertex_label = labels.get(&vertex).unwrap().clone();

        for (peer, port, desc) in topo.neighbours(&vertex) {
            if settled.contains(&peer) {
                continue;
            }
            if peer != *dst && !node_ok(&peer) {
                continue;
            }
            // Edge constraints only apply to switch egress ports; host
            // attachments carry no TE metrics.
            if let NodeId::Switch(dpid) = &vertex
                && !edge_ok(*dpid, port, desc)
            {
                continue;
            }

            let mut cost =
                vertex_label.cost.saturating_add(weight.edge_cost(desc));
            if let NodeId::Switch(dpid) = &vertex {
                cost = cost.saturating_add(extra_cost(*dpid, port));
            }
            let util_pm = match (weight, &vertex) {
                (Weight::Cspf, NodeId::Switch(_)) => vertex_label
                    .util_pm
                    .max((desc.utilisation() * 1000.0) as u32),
                _ => vertex_label.util_pm,
            };
            let hops = vertex_label.hops.saturating_add(1);
            let alt = Label {
                cost,
                util_pm,
                hops,
                prev: Some(vertex.clone()),
            };

            let old_key = match labels.get(&peer) {
                Some(cur) => {
                    let cur_key = (cur.cost, cur.util_pm, cur.hops);
                    let alt_key = (alt.cost, alt.util_pm, alt.hops);
                    let better = alt_key < cur_key
                        // Equal-cost: prefer the lexicographically
                        // smaller predecessor.
                        || (alt_key == cur_key
                            && alt.prev < cur.prev
                            && cur.prev.is_some());
                    if !better {
                        continue;
                    }
                    Some(cur.key(&peer))
                }
                None => None,
            };
            if let Some(old_key) = old_key {
                cand_list.remove(&old_key);
            }
            cand_list.insert(alt.key(&peer), ());
            labels.insert(peer, alt);
        }
    }

    // Rebuild the node sequence from the predecessor chain.
    if !settled.contains(dst) {
        return None;
    }
    let mut path = vec![dst.clone()];
    let mut cursor = dst.clone();
    while let Some(prev) = labels.get(&cursor).and_then(|l| l.prev.clone())
    {
        path.push(prev.clone());
        cursor = prev;
    }
    path.reverse();
    if path.first() != Some(src) {
        return None;
    }
    Some(path)
}

// ===== disjoint path pairs =====

/// Computes a primary path and the most disjoint backup available:
/// node-disjoint if one exists, else link-disjoint, else minimally
/// overlapping (used edges penalised), the latter two marked partial.
pub fn disjoint_pair(
    topo: &Topology,
    src: &NodeId,
    dst: &NodeId,
    weight: Weight,
) -> Option<DisjointPair> {
    let primary = shortest_path(topo, src, dst, weight)?;
    if primary.is_empty() {
        return Some(DisjointPair {
            primary,
            backup: None,
            partial: false,
        });
    }

    let (backup, partial) = backup_for(topo, src, dst, &primary, weight);
    Some(DisjointPair {
        primary,
        backup,
        partial,
    })
}

/// Most disjoint backup available for a given primary: node-disjoint if
/// one exists, else link-disjoint, else minimally overlapping (used
/// edges penalised), the latter two marked partial.
pub fn backup_for(
    topo: &Topology,
    src: &NodeId,
    dst: &NodeId,
    primary: &[NodeId],
    weight: Weight,
) -> (Option<Vec<NodeId>>, bool) {
    // Interior switches of the primary (endpoints and their attachment
    // switches stay shared; hosts have a single uplink).
    let interior: BTreeSet<NodeId> = primary
        .iter()
        .skip(2)
        .take(primary.len().saturating_sub(4))
        .cloned()
        .collect();
    let node_disjoint = constrained_path(
        topo,
        src,
        dst,
        weight,
        &|_, _, _| true,
        &|node| !interior.contains(node),
        &|_, _| 0,
    );
    if let Some(backup) = node_disjoint
        && backup != primary
    {
        return (Some(backup), false);
    }

    // Host attachment edges are unavoidably shared and exempt from the
    // disjointness requirement.
    let primary_links = path_links(topo, primary);
    let link_disjoint = constrained_path(
        topo,
        src,
        dst,
        weight,
        &|dpid, port, _| {
            !primary_links.contains(&(dpid, port))
                || topo.is_host_port(dpid, port)
        },
        &|_| true,
        &|_, _| 0,
    );
    if let Some(backup) = link_disjoint
        && backup != primary
    {
        return (Some(backup), true);
    }

    // Last resort: minimally overlapping backup via edge penalties.
    let overlapping = constrained_path(
        topo,
        src,
        dst,
        weight,
        &|_, _, _| true,
        &|_| true,
        &|dpid, port| {
            if primary_links.contains(&(dpid, port)) {
                OVERLAP_PENALTY
            } else {
                0
            }
        },
    );
    let backup = overlapping.filter(|backup| backup != primary);
    let partial = backup.is_some();
    (backup, partial)
}

// Directed switch egress links of a node path, both directions.
fn path_links(
    topo: &Topology,
    path: &[NodeId],
) -> BTreeSet<(Dpid, PortNo)> {
    let mut links = BTreeSet::new();
    for pair in path.windows(2) {
        if let Some((out_port, in_port)) = topo.find_ports(&pair[0], &pair[1])
        {
            if let NodeId::Switch(dpid) = &pair[0] {
                links.insert((*dpid, out_port));
            }
            if let NodeId::Switch(dpid) = &pair[1] {
                links.insert((*dpid, in_port));
            }
        }
    }
    links
}

// Whether the undirected link (a, b) is used by `path`.
fn link_in_path(a: &NodeId, b: &NodeId, path: &[NodeId]) -> bool {
    path.windows(2).any(|pair| {
        (pair[0] == *a && pair[1] == *b) || (pair[0] == *b && pair[1] == *a)
    })
}

// ===== path splices =====

/// Strict splices: for every switch unique to the primary path, the
/// shortest path onto a node unique to the backup, valid on
/// currently-known links only. Among equal-length splices the one whose
/// exit sits closest to the destination wins.
pub fn splices_strict(
    topo: &Topology,
    primary: &[NodeId],
    backup: &[NodeId],
) -> BTreeMap<Dpid, Splice> {
    let mut splices = BTreeMap::new();

    for node in primary {
        let NodeId::Switch(dpid) = node else { continue };
        if backup.contains(node) {
            continue;
        }

        let mut best: Option<(Vec<NodeId>, usize)> = None;
        for exit in backup {
            if exit == node || exit.is_host() || primary.contains(exit) {
                continue;
            }
            let Some(path) =
                shortest_path(topo, node, exit, Weight::Unit)
            else {
                continue;
            };
            if path.is_empty() {
                continue;
            }
            let proximity = exit_proximity(backup, exit);
            let replace = match &best {
                None => true,
                Some((cur, cur_prox)) => {
                    path.len() < cur.len()
                        || (path.len() == cur.len()
                            && proximity < *cur_prox)
                }
            };
            if replace {
                best = Some((path, proximity));
            }
        }

        if let Some((nodes, _)) = best
            && let Some(splice) = into_splice(topo, nodes)
        {
            splices.insert(*dpid, splice);
        }
    }
    splices
}

/// Loose splices: the search additionally starts from nodes adjacent to
/// unique primary segments and may exit on such nodes, assuming the
/// neighbour switches reroute. Splices reusing primary or backup links
/// and splices backtracking along the backup are rejected.
pub fn splices_loose(
    topo: &Topology,
    primary: &[NodeId],
    backup: &[NodeId],
) -> BTreeMap<Dpid, Splice> {
    // Unique primary nodes plus the nodes bounding each unique segment.
    let mut search: BTreeSet<NodeId> = BTreeSet::new();
    let mut adjacent: BTreeSet<NodeId> = BTreeSet::new();
    let mut in_segment = false;
    for (idx, node) in primary.iter().enumerate() {
        if !backup.contains(node) {
            search.insert(node.clone());
            if !in_segment {
                in_segment = true;
                if idx > 0 {
                    adjacent.insert(primary[idx - 1].clone());
                }
            }
        } else if in_segment {
            in_segment = false;
            adjacent.insert(node.clone());
        }
    }
    search.extend(adjacent.iter().cloned());

    let mut splices = BTreeMap::new();
    for node in &search {
        let NodeId::Switch(dpid) = node else { continue };

        let mut best: Option<(Vec<NodeId>, usize)> = None;
        for exit in backup {
            if exit == node || exit.is_host() {
                continue;
            }
            if primary.contains(exit) && !adjacent.contains(exit) {
                continue;
            }
            let Some(path) =
                shortest_path(topo, node, exit, Weight::Unit)
            else {
                continue;
            };
            if path.is_empty() {
                continue;
            }

            // A splice reusing a primary or backup link would defeat the
            // group-table forwarding at the reused hop.
            let reuses_link = path.windows(2).any(|pair| {
                link_in_path(&pair[0], &pair[1], primary)
                    || link_in_path(&pair[0], &pair[1], backup)
            });
            if reuses_link {
                continue;
            }

            let proximity = exit_proximity(backup, exit);
            // Splices starting on the backup must not backtrack towards
            // the source.
            if let Some(start_idx) =
                backup.iter().position(|n| n == node)
                && backup.len() - proximity - 1 < start_idx
            {
                continue;
            }

            let replace = match &best {
                None => true,
                Some((cur, cur_prox)) => {
                    path.len() < cur.len()
                        || (path.len() == cur.len()
                            && proximity < *cur_prox)
                }
            };
            if replace {
                best = Some((path, proximity));
            }
        }

        if let Some((nodes, _)) = best
            && let Some(splice) = into_splice(topo, nodes)
        {
            splices.insert(*dpid, splice);
        }
    }
    splices
}

// Distance from the splice exit to the destination along the backup.
fn exit_proximity(backup: &[NodeId], exit: &NodeId) -> usize {
    backup
        .iter()
        .position(|n| n == exit)
        .map(|idx| backup.len() - idx - 1)
        .unwrap_or(usize::MAX)
}

fn into_splice(topo: &Topology, nodes: Vec<NodeId>) -> Option<Splice> {
    let (egress, _) = topo.find_ports(&nodes[0], &nodes[1])?;
    Some(Splice { nodes, egress })
}

// ===== path materialisation =====

/// Translates a node sequence into the per-switch hop program. The
/// destination host is not part of the program; the final switch egresses
/// on its host-facing port.
pub fn path_hops(
    topo: &Topology,
    nodes: &[NodeId],
) -> Option<Vec<PathHop>> {
    let mut hops = Vec::new();
    for (idx, node) in nodes.iter().enumerate() {
        let NodeId::Switch(dpid) = node else { continue };
        let in_port = if idx == 0 {
            PortNo(0)
        } else {
            topo.find_ports(&nodes[idx - 1], node)?.1
        };
        let out_port = match nodes.get(idx + 1) {
            Some(next) => topo.find_ports(node, next)?.0,
            None => continue,
        };
        hops.push(PathHop {
            dpid: *dpid,
            in_port,
            out_port,
        });
    }
    Some(hops)
}

/// Reconstructs the effective forwarding path from installed group
/// buckets, optionally with one bucket swap applied (TE what-if). Returns
/// `None` on loops, dead ends, or an inapplicable swap.
pub fn buckets_to_path(
    topo: &Topology,
    groups: &BTreeMap<Dpid, Vec<PortNo>>,
    ingress: Dpid,
    in_port: PortNo,
    swap: Option<(Dpid, PortNo, PortNo)>,
) -> Option<Vec<PathHop>> {
    let mut hops = Vec::new();
    let mut visited = BTreeSet::new();
    let mut sw = ingress;
    let mut ingress_port = in_port;

    loop {
        if !visited.insert(sw) {
            // Loop.
            return None;
        }
        let buckets = groups.get(&sw)?;
        let first = *buckets.first()?;
        let out_port = match swap {
            Some((swap_sw, cur, alt)) if swap_sw == sw => {
                if first != cur || !buckets.contains(&alt) {
                    return None;
                }
                alt
            }
            _ => first,
        };

        hops.push(PathHop {
            dpid: sw,
            in_port: ingress_port,
            out_port,
        });

        match topo.edge(sw, out_port).and_then(|desc| desc.peer.as_ref()) {
            Some(crate::topology::Peer::Host(_)) => return Some(hops),
            Some(crate::topology::Peer::Switch { dpid, port }) => {
                sw = *dpid;
                ingress_port = *port;
            }
            None => return None,
        }
    }
}

/// Highest usage/capacity ratio along a hop program.
pub fn max_utilisation(topo: &Topology, hops: &[PathHop]) -> f64 {
    hops.iter()
        .filter_map(|hop| topo.edge(hop.dpid, hop.out_port))
        .map(|desc| desc.utilisation())
        .fold(0.0, f64::max)
}
