//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::southbound::PathHop;
use helix_utils::{Dpid, Gid, NodeId, PortNo};
use serde::{Deserialize, Serialize};

use crate::config::TeCfg;
use crate::debug::Debug;
use crate::path::{self, Weight};
use crate::topology::Topology;

// Polling cycles an unresolved inter-area congestion report stays
// suppressed from local re-optimisation.
const INTER_AREA_BACKOFF: u8 = 2;

// TE optimisation methods. The configuration resolves to one of these at
// startup.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum OptiMethod {
    #[default]
    FirstSol,
    BestSolUsage,
    BestSolPLen,
    #[serde(rename = "CSPFRecomp")]
    CspfRecomp,
}

// Per-candidate view the TE engine operates on.
#[derive(Clone, Debug)]
pub struct TeCandidate {
    pub gid: Gid,
    pub src: String,
    pub dst: String,
    pub ingress: Dpid,
    pub in_port: PortNo,
    // Installed group bucket egress ports, per switch, primary first.
    pub groups: BTreeMap<Dpid, Vec<PortNo>>,
    pub primary: Vec<PathHop>,
    pub rate_bps: u64,
}

// One accepted path change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathChange {
    pub gid: Gid,
    pub new_primary: Vec<PathHop>,
    pub kind: ChangeKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    // Reorder the group buckets at one switch.
    SwapBucket { dpid: Dpid, egress: PortNo },
    // Reinstall the recomputed path.
    Reinstall,
}

// Outcome of selecting a potential path for one candidate.
#[derive(Debug)]
enum Selection {
    Selected(PathChange),
    NoCandidate,
    InfeasibleNeedsPartial,
}

// Result of a full optimisation pass.
#[derive(Clone, Debug, Default)]
pub struct TePassReport {
    pub changes: Vec<PathChange>,
    // Links still over threshold with no further change possible.
    pub residual: Vec<(Dpid, PortNo)>,
}

// A candidate path under evaluation, with its projection metrics.
#[derive(Clone, Debug)]
struct Potential {
    change: PathChange,
    // Highest projected usage/capacity along the new path.
    max_util: f64,
    hops: usize,
}

// ===== link-usage table =====

// Per-edge usage contributions. The invariant `total == sum of
// contributions` is maintained by construction and debug-asserted.
#[derive(Clone, Debug, Default)]
pub struct LinkUsage {
    contributions: BTreeMap<Gid, u64>,
    total: u64,
}

/// Tracks which candidate contributes how much to every directed edge.
/// Updated incrementally as the TE engine accepts path changes, so each
/// decision sees the effect of the previous ones.
#[derive(Clone, Debug, Default)]
pub struct UsageTable {
    links: BTreeMap<(Dpid, PortNo), LinkUsage>,
    paths: BTreeMap<Gid, Vec<PathHop>>,
}

impl LinkUsage {
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn contributions(&self) -> impl Iterator<Item = (Gid, u64)> + '_ {
        self.contributions.iter().map(|(gid, bps)| (*gid, *bps))
    }
}

impl UsageTable {
    pub fn new() -> UsageTable {
        UsageTable::default()
    }

    /// Replaces a candidate's contribution sites with the given path.
    pub fn record(&mut self, gid: Gid, hops: &[PathHop], rate_bps: u64) {
        self.remove(gid);
        for hop in hops {
            let link = self
                .links
                .entry((hop.dpid, hop.out_port))
                .or_default();
            link.contributions.insert(gid, rate_bps);
            link.total += rate_bps;
        }
        self.paths.insert(gid, hops.to_vec());
        self.check_invariant();
    }

    /// Drops all contributions of a candidate.
    pub fn remove(&mut self, gid: Gid) {
        if let Some(hops) = self.paths.remove(&gid) {
            for hop in hops {
                if let Some(link) =
                    self.links.get_mut(&(hop.dpid, hop.out_port))
                    && let Some(bps) = link.contributions.remove(&gid)
                {
                    link.total -= bps;
                }
            }
        }
        self.check_invariant();
    }

    pub fn link(&self, dpid: Dpid, port: PortNo) -> Option<&LinkUsage> {
        self.links.get(&(dpid, port))
    }

    pub fn total(&self, dpid: Dpid, port: PortNo) -> u64 {
        self.links
            .get(&(dpid, port))
            .map(|link| link.total)
            .unwrap_or(0)
    }

    pub fn contribution(&self, dpid: Dpid, port: PortNo, gid: Gid) -> u64 {
        self.links
            .get(&(dpid, port))
            .and_then(|link| link.contributions.get(&gid))
            .copied()
            .unwrap_or(0)
    }

    pub fn path(&self, gid: Gid) -> Option<&Vec<PathHop>> {
        self.paths.get(&gid)
    }

    /// Network-wide maximum edge usage ratio.
    pub fn max_utilisation(&self, topo: &Topology) -> f64 {
        self.links
            .iter()
            .filter_map(|((dpid, port), link)| {
                let desc = topo.edge(*dpid, *port)?;
                if desc.capacity_bps == 0 {
                    return None;
                }
                Some(link.total as f64 / desc.capacity_bps as f64)
            })
            .fold(0.0, f64::max)
    }

    fn check_invariant(&self) {
        debug_assert!(self.links.values().all(|link| {
            link.total == link.contributions.values().sum::<u64>()
        }));
    }
}

// ===== TE engine =====

/// Congestion detection and resolution.
///
/// Detected congestion is batched through the consolidation delay; a pass
/// then walks the congested links, moving candidate traffic onto paths
/// selected by the configured optimisation method.
#[derive(Debug)]
pub struct TeEngine {
    cfg: TeCfg,
    over_utilised: BTreeMap<(Dpid, PortNo), f64>,
    // Inter-area links handed to the root, with remaining suppression
    // cycles.
    inter_area_backoff: BTreeMap<(Dpid, PortNo), u8>,
}

// ===== impl TeEngine =====

impl TeEngine {
    pub fn new(mut cfg: TeCfg) -> TeEngine {
        // FirstSol has no partial-accept behaviour.
        if cfg.opti_method == OptiMethod::FirstSol && cfg.partial_accept {
            tracing::warn!(
                "FirstSol optimisation does not support partial accepts"
            );
            cfg.partial_accept = false;
        }
        TeEngine {
            cfg,
            over_utilised: BTreeMap::new(),
            inter_area_backoff: BTreeMap::new(),
        }
    }

    /// Records a link whose usage ratio breached the threshold. Returns
    /// true when the consolidation timer should be (re)started.
    pub fn check_link_congested(
        &mut self,
        dpid: Dpid,
        port: PortNo,
        ratio: f64,
    ) -> bool {
        if ratio <= self.cfg.utilisation_threshold {
            return false;
        }
        if self.inter_area_backoff.contains_key(&(dpid, port)) {
            return false;
        }
        if self.over_utilised.contains_key(&(dpid, port)) {
            return false;
        }
        Debug::TeCongestionDetected(dpid, port, ratio).log();
        self.over_utilised.insert((dpid, port), ratio);
        true
    }

    /// Drops pending congestion triggers (topology change supersedes the
    /// scheduled pass).
    pub fn cancel_pending(&mut self) {
        self.over_utilised.clear();
    }

    /// Decrements the inter-area suppression counters, one per stats
    /// cycle.
    pub fn backoff_tick(&mut self) {
        self.inter_area_backoff.retain(|_, count| {
            *count = count.saturating_sub(1);
            *count > 0
        });
    }

    /// Marks an inter-area link as handed over to the root controller.
    pub fn suppress_inter_area(&mut self, dpid: Dpid, port: PortNo) {
        self.inter_area_backoff
            .insert((dpid, port), INTER_AREA_BACKOFF);
    }

    /// Runs one optimisation pass over the detected congested links.
    /// Accepted changes update `usage` immediately so subsequent
    /// decisions see their effect.
    pub fn run_pass(
        &mut self,
        topo: &Topology,
        usage: &mut UsageTable,
        candidates: &BTreeMap<Gid, TeCandidate>,
    ) -> TePassReport {
        let mut report = TePassReport::default();
        let over = std::mem::take(&mut self.over_utilised);

        for (link, _ratio) in over {
            let (dpid, port) = link;
            // Egress links to a destination host cannot be optimised:
            // the attachment is fixed.
            if topo.is_host_port(dpid, port) {
                continue;
            }
            let Some(desc) = topo.edge(dpid, port) else { continue };
            let max_traffic = (desc.capacity_bps as f64
                * self.cfg.utilisation_threshold)
                as u64;

            // Candidate set: contributors to the congested edge, heavy
            // hitters first by default. Earlier accepted changes already
            // moved their contributions, so the set is current.
            let mut cands: Vec<(Gid, u64)> = usage
                .link(dpid, port)
                .map(|l| l.contributions().collect())
                .unwrap_or_default();
            cands.sort_by_key(|(gid, bps)| (*bps, *gid));
            if self.cfg.candidate_sort_rev {
                cands.reverse();
            }
            if cands.is_empty() {
                continue;
            }

            for (gid, c_rate) in cands {
                if usage.total(dpid, port) <= max_traffic {
                    break;
                }
                let Some(cand) = candidates.get(&gid) else { continue };
                let cur_path = usage
                    .path(gid)
                    .cloned()
                    .unwrap_or_else(|| cand.primary.clone());

                let selection = match self.cfg.opti_method {
                    OptiMethod::CspfRecomp => self.select_cspf(
                        topo, usage, cand, &cur_path, link, c_rate,
                    ),
                    _ => self.select_swap(
                        topo, usage, cand, &cur_path, link, c_rate,
                    ),
                };

                match selection {
                    Selection::Selected(change) => {
                        usage.record(gid, &change.new_primary, c_rate);
                        Debug::TePathChange(gid, change.kind).log();
                        report.changes.push(change);
                    }
                    Selection::NoCandidate => {
                        Debug::TeCandidateUnusable(gid, dpid, port).log();
                    }
                    Selection::InfeasibleNeedsPartial => {
                        Debug::TePartialRejected(gid, dpid, port).log();
                    }
                }
            }

            if usage.total(dpid, port) > max_traffic {
                report.residual.push(link);
            }
        }
        report
    }

    // Potential paths by group bucket swaps (FirstSol, BestSolUsage,
    // BestSolPLen).
    fn select_swap(
        &self,
        topo: &Topology,
        usage: &UsageTable,
        cand: &TeCandidate,
        cur_path: &[PathHop],
        con_link: (Dpid, PortNo),
        c_rate: u64,
    ) -> Selection {
        let mut strict_set: Vec<Potential> = Vec::new();
        let mut partial_set: Vec<Potential> = Vec::new();

        for (idx, hop) in cur_path.iter().enumerate() {
            // A swap beyond the congested hop cannot move traffic off
            // the congested link.
            if idx > 0 {
                let prev = &cur_path[idx - 1];
                if (prev.dpid, prev.out_port) == con_link {
                    break;
                }
            }

            let Some(buckets) = cand.groups.get(&hop.dpid) else {
                continue;
            };
            // Buckets pointing at removed or inactive ports are not
            // usable swap targets.
            let live: Vec<PortNo> = buckets
                .iter()
                .copied()
                .filter(|pn| {
                    topo.edge(hop.dpid, *pn)
                        .map(|desc| desc.is_active())
                        .unwrap_or(false)
                })
                .collect();
            if live.len() < 2 {
                continue;
            }

            for alt in live.iter().skip(1) {
                let Some(pot) = path::buckets_to_path(
                    topo,
                    &cand.groups,
                    cand.ingress,
                    cand.in_port,
                    Some((hop.dpid, live[0], *alt)),
                ) else {
                    continue;
                };
                if !path_avoids_link(&pot, con_link) {
                    continue;
                }

                let Some((max_util, valid, strict)) = self.project(
                    topo, usage, cand.gid, c_rate, &pot,
                ) else {
                    continue;
                };
                let potential = Potential {
                    change: PathChange {
                        gid: cand.gid,
                        new_primary: pot.clone(),
                        kind: ChangeKind::SwapBucket {
                            dpid: hop.dpid,
                            egress: *alt,
                        },
                    },
                    max_util,
                    hops: pot.len(),
                };

                if strict {
                    if self.cfg.opti_method == OptiMethod::FirstSol {
                        // First strictly-valid path in iteration order.
                        return Selection::Selected(potential.change);
                    }
                    strict_set.push(potential);
                } else if valid && self.cfg.partial_accept {
                    partial_set.push(potential);
                }
            }
        }

        if !strict_set.is_empty() {
            let best = self.pick_best(strict_set);
            return Selection::Selected(best.change);
        }
        if !partial_set.is_empty() {
            let best = self.pick_best(partial_set);
            return self.admit_partial(topo, usage, best, c_rate);
        }
        Selection::NoCandidate
    }

    // Potential path by constrained re-computation (CSPFRecomp).
    fn select_cspf(
        &self,
        topo: &Topology,
        usage: &UsageTable,
        cand: &TeCandidate,
        cur_path: &[PathHop],
        con_link: (Dpid, PortNo),
        c_rate: u64,
    ) -> Selection {
        let thresh = self.cfg.utilisation_threshold;
        let paccept = self.cfg.partial_accept;
        let on_path: std::collections::BTreeSet<(Dpid, PortNo)> = cur_path
            .iter()
            .map(|hop| (hop.dpid, hop.out_port))
            .collect();

        // Prune the congested link plus every link without headroom for
        // the candidate's traffic. With partial accept, a link survives
        // as long as moving the candidate causes no loss.
        let edge_ok = |dpid: Dpid, port: PortNo, desc: &crate::topology::PortDesc| {
            if (dpid, port) == con_link {
                return false;
            }
            if topo.is_host_port(dpid, port) {
                return true;
            }
            let mut limit = (desc.capacity_bps as f64 * thresh) as u64;
            if paccept {
                limit = desc.capacity_bps;
            }
            let mut projected = usage.total(dpid, port);
            if !on_path.contains(&(dpid, port)) {
                projected += c_rate;
            }
            projected <= limit
        };

        let src = NodeId::Host(cand.src.clone());
        let dst = NodeId::Host(cand.dst.clone());
        let Some(nodes) = path::constrained_path(
            topo,
            &src,
            &dst,
            Weight::Cspf,
            &edge_ok,
            &|_| true,
            &|_, _| 0,
        ) else {
            return Selection::NoCandidate;
        };
        let Some(hops) = path::path_hops(topo, &nodes) else {
            return Selection::NoCandidate;
        };
        if hops == cur_path || !path_avoids_link(&hops, con_link) {
            return Selection::NoCandidate;
        }

        let Some((max_util, valid, strict)) =
            self.project(topo, usage, cand.gid, c_rate, &hops)
        else {
            return Selection::NoCandidate;
        };
        let potential = Potential {
            change: PathChange {
                gid: cand.gid,
                new_primary: hops,
                kind: ChangeKind::Reinstall,
            },
            max_util,
            hops: 0,
        };

        if strict {
            return Selection::Selected(potential.change);
        }
        if valid && paccept {
            return self.admit_partial(topo, usage, potential, c_rate);
        }
        Selection::NoCandidate
    }

    // Projects the candidate's traffic onto a potential path. Returns
    // (max projected utilisation, valid, strictly valid), or None when a
    // capacity is unknown.
    fn project(
        &self,
        topo: &Topology,
        usage: &UsageTable,
        gid: Gid,
        c_rate: u64,
        pot: &[PathHop],
    ) -> Option<(f64, bool, bool)> {
        let mut max_util = 0.0f64;
        let mut valid = true;
        let mut strict = true;
        for hop in pot {
            let desc = topo.edge(hop.dpid, hop.out_port)?;
            if desc.capacity_bps == 0 {
                continue;
            }
            let projected = usage.total(hop.dpid, hop.out_port)
                - usage.contribution(hop.dpid, hop.out_port, gid)
                + c_rate;
            let util = projected as f64 / desc.capacity_bps as f64;
            max_util = max_util.max(util);
            if projected > desc.capacity_bps {
                valid = false;
            }
            if util > self.cfg.utilisation_threshold {
                strict = false;
            }
        }
        Some((max_util, valid, strict))
    }

    // Best potential path per the configured method. `pot_path_sort_rev`
    // false selects the tightest fit (maximum projected usage), true the
    // most headroom.
    fn pick_best(&self, mut set: Vec<Potential>) -> Potential {
        let rev = self.cfg.pot_path_sort_rev;
        match self.cfg.opti_method {
            OptiMethod::BestSolPLen => {
                set.sort_by(|a, b| {
                    let usage_ord = if rev {
                        a.max_util.total_cmp(&b.max_util)
                    } else {
                        b.max_util.total_cmp(&a.max_util)
                    };
                    usage_ord.then(a.hops.cmp(&b.hops))
                });
            }
            _ => {
                set.sort_by(|a, b| {
                    if rev {
                        a.max_util.total_cmp(&b.max_util)
                    } else {
                        b.max_util.total_cmp(&a.max_util)
                    }
                });
            }
        }
        set.into_iter().next().unwrap()
    }

    // A partial path is admitted only when it strictly reduces the
    // network-wide maximum edge usage (oscillation guard).
    fn admit_partial(
        &self,
        topo: &Topology,
        usage: &UsageTable,
        potential: Potential,
        c_rate: u64,
    ) -> Selection {
        let before = usage.max_utilisation(topo);
        let mut scratch = usage.clone();
        scratch.record(
            potential.change.gid,
            &potential.change.new_primary,
            c_rate,
        );
        let after = scratch.max_utilisation(topo);
        if after < before {
            Selection::Selected(potential.change)
        } else {
            Selection::InfeasibleNeedsPartial
        }
    }
}

fn path_avoids_link(path: &[PathHop], link: (Dpid, PortNo)) -> bool {
    !path
        .iter()
        .any(|hop| (hop.dpid, hop.out_port) == link)
}
