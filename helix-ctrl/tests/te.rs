//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_ctrl::config::TeCfg;
use helix_ctrl::te::{
    ChangeKind, OptiMethod, TeCandidate, TeEngine, UsageTable,
};
use helix_ctrl::topology::Topology;
use helix_utils::southbound::PathHop;
use helix_utils::{Dpid, Gid, HostId, MacAddr, PortNo};
use maplit::btreemap;

const MBPS: u64 = 1_000_000;
const GBPS: u64 = 1_000_000_000;

fn host(name: &str) -> HostId {
    HostId {
        name: name.to_owned(),
        mac: MacAddr::default(),
        ip: std::net::Ipv4Addr::new(10, 0, 0, 1),
    }
}

fn hop(dpid: u64, in_port: u32, out_port: u32) -> PathHop {
    PathHop {
        dpid: Dpid(dpid),
        in_port: PortNo(in_port),
        out_port: PortNo(out_port),
    }
}

fn cfg(method: OptiMethod, thresh: f64, partial: bool) -> TeCfg {
    TeCfg {
        utilisation_threshold: thresh,
        opti_method: method,
        partial_accept: partial,
        ..Default::default()
    }
}

// ===== S2: swap efficiency over two constrained links =====

// Lower ring s1-s2-s3 with 200 Mbps links A = s1->s2 and B = s2->s3;
// upper ring s1-s4-s3 at 1 Gbps. Hosts h1..h3 on s1, h4 on s3.
struct SwapFixture {
    topo: Topology,
    usage: UsageTable,
    candidates: BTreeMap<Gid, TeCandidate>,
}

fn swap_fixture() -> SwapFixture {
    let mut topo = Topology::new();
    topo.add_link(Dpid(1), PortNo(1), Dpid(2), PortNo(1), 200 * MBPS)
        .unwrap();
    topo.add_link(Dpid(2), PortNo(2), Dpid(3), PortNo(1), 200 * MBPS)
        .unwrap();
    topo.add_link(Dpid(1), PortNo(2), Dpid(4), PortNo(1), GBPS)
        .unwrap();
    topo.add_link(Dpid(4), PortNo(2), Dpid(3), PortNo(2), GBPS)
        .unwrap();
    for (name, port) in [("h1", 11), ("h2", 12), ("h3", 13)] {
        topo.add_host(host(name), Dpid(1), PortNo(port)).unwrap();
    }
    topo.add_host(host("h4"), Dpid(3), PortNo(14)).unwrap();

    let mut usage = UsageTable::new();
    let mut candidates = BTreeMap::new();
    for (src, in_port, rate) in
        [("h1", 11, 70), ("h2", 12, 80), ("h3", 13, 90)]
    {
        let gid = Gid::from_pair(src, "h4").unwrap();
        let primary =
            vec![hop(1, in_port, 1), hop(2, 1, 2), hop(3, 1, 14)];
        usage.record(gid, &primary, rate * MBPS);
        candidates.insert(
            gid,
            TeCandidate {
                gid,
                src: src.to_owned(),
                dst: "h4".to_owned(),
                ingress: Dpid(1),
                in_port: PortNo(in_port),
                groups: btreemap! {
                    Dpid(1) => vec![PortNo(1), PortNo(2)],
                    Dpid(2) => vec![PortNo(2)],
                    Dpid(3) => vec![PortNo(14)],
                    Dpid(4) => vec![PortNo(2)],
                },
                primary,
                rate_bps: rate * MBPS,
            },
        );
    }
    SwapFixture {
        topo,
        usage,
        candidates,
    }
}

#[test]
fn s2_heaviest_candidate_moves_to_upper_ring() {
    let mut fixture = swap_fixture();
    let mut engine =
        TeEngine::new(cfg(OptiMethod::FirstSol, 0.90, false));

    // Both constrained links are over threshold: 240 of 180 Mbps.
    assert!(engine.check_link_congested(Dpid(1), PortNo(1), 1.2));
    assert!(engine.check_link_congested(Dpid(2), PortNo(2), 1.2));

    let report = engine.run_pass(
        &fixture.topo,
        &mut fixture.usage,
        &fixture.candidates,
    );

    // Heavy hitter first: exactly (h3, h4) moves, via the s1 bucket
    // swap onto the upper ring.
    assert_eq!(report.changes.len(), 1);
    let change = &report.changes[0];
    assert_eq!(change.gid, Gid::from_pair("h3", "h4").unwrap());
    assert_eq!(
        change.kind,
        ChangeKind::SwapBucket {
            dpid: Dpid(1),
            egress: PortNo(2)
        }
    );
    assert!(report.residual.is_empty());

    // Both constrained links dropped to 150 Mbps; the upper ring took
    // the 90 Mbps.
    assert_eq!(fixture.usage.total(Dpid(1), PortNo(1)), 150 * MBPS);
    assert_eq!(fixture.usage.total(Dpid(2), PortNo(2)), 150 * MBPS);
    assert_eq!(fixture.usage.total(Dpid(1), PortNo(2)), 90 * MBPS);

    // Capacity respected after the pass (no partial accept: threshold
    // bound as well).
    for (dpid, port, _) in fixture.topo.links() {
        let desc = fixture.topo.edge(dpid, port).unwrap();
        let total = fixture.usage.total(dpid, port);
        assert!(total <= desc.capacity_bps);
        if !fixture.topo.is_host_port(dpid, port) {
            assert!(
                total as f64 <= desc.capacity_bps as f64 * 0.90 + 1e-9
            );
        }
    }
}

#[test]
fn s2_candidate_ordering_changes_move_count() {
    // Bound of 150 Mbps: the 90 Mbps heavy hitter alone resolves it,
    // while light-first needs two moves (70, then 80).
    let mut fixture = swap_fixture();
    let mut engine =
        TeEngine::new(cfg(OptiMethod::FirstSol, 0.75, false));
    engine.check_link_congested(Dpid(1), PortNo(1), 1.2);
    let report = engine.run_pass(
        &fixture.topo,
        &mut fixture.usage,
        &fixture.candidates,
    );
    assert_eq!(report.changes.len(), 1);
    assert_eq!(fixture.usage.total(Dpid(1), PortNo(1)), 150 * MBPS);

    let mut fixture = swap_fixture();
    let mut te_cfg = cfg(OptiMethod::FirstSol, 0.75, false);
    te_cfg.candidate_sort_rev = false;
    let mut engine = TeEngine::new(te_cfg);
    engine.check_link_congested(Dpid(1), PortNo(1), 1.2);
    let report = engine.run_pass(
        &fixture.topo,
        &mut fixture.usage,
        &fixture.candidates,
    );
    assert_eq!(report.changes.len(), 2);
    assert_eq!(fixture.usage.total(Dpid(1), PortNo(1)), 90 * MBPS);
}

#[test]
fn consecutive_passes_are_idempotent() {
    let mut fixture = swap_fixture();
    let mut engine =
        TeEngine::new(cfg(OptiMethod::FirstSol, 0.90, false));

    engine.check_link_congested(Dpid(1), PortNo(1), 1.2);
    engine.check_link_congested(Dpid(2), PortNo(2), 1.2);
    let first = engine.run_pass(
        &fixture.topo,
        &mut fixture.usage,
        &fixture.candidates,
    );
    assert!(!first.changes.is_empty());

    // Re-detect over the updated usage: nothing is over threshold, so
    // the second pass decides nothing.
    for (dpid, port, desc) in fixture.topo.links() {
        let ratio = fixture.usage.total(dpid, port) as f64
            / desc.capacity_bps as f64;
        engine.check_link_congested(dpid, port, ratio);
    }
    let second = engine.run_pass(
        &fixture.topo,
        &mut fixture.usage,
        &fixture.candidates,
    );
    assert!(second.changes.is_empty());
    assert!(second.residual.is_empty());
}

// ===== S3: partial accept over three parallel legs =====

// src on s1, dst on s5. Legs s1->s2->s5, s1->s3->s5, s1->s4->s5. The
// current path runs over the 80 Mbps s1->s2 link at full rate; the s3
// and s4 legs are capped by their second link.
struct LegsFixture {
    topo: Topology,
    usage: UsageTable,
    candidates: BTreeMap<Gid, TeCandidate>,
}

fn legs_fixture(cap_a: u64, cap_b: u64) -> LegsFixture {
    let mut topo = Topology::new();
    topo.add_link(Dpid(1), PortNo(2), Dpid(2), PortNo(1), 80 * MBPS)
        .unwrap();
    topo.add_link(Dpid(1), PortNo(3), Dpid(3), PortNo(1), GBPS)
        .unwrap();
    topo.add_link(Dpid(1), PortNo(4), Dpid(4), PortNo(1), GBPS)
        .unwrap();
    topo.add_link(Dpid(2), PortNo(2), Dpid(5), PortNo(1), GBPS)
        .unwrap();
    topo.add_link(Dpid(3), PortNo(2), Dpid(5), PortNo(2), cap_a)
        .unwrap();
    topo.add_link(Dpid(4), PortNo(2), Dpid(5), PortNo(3), cap_b)
        .unwrap();
    topo.add_host(host("h1"), Dpid(1), PortNo(11)).unwrap();
    topo.add_host(host("h9"), Dpid(5), PortNo(12)).unwrap();

    let gid = Gid::from_pair("h1", "h9").unwrap();
    let primary = vec![hop(1, 11, 2), hop(2, 1, 2), hop(5, 1, 12)];
    let mut usage = UsageTable::new();
    usage.record(gid, &primary, 80 * MBPS);

    let mut candidates = BTreeMap::new();
    candidates.insert(
        gid,
        TeCandidate {
            gid,
            src: "h1".to_owned(),
            dst: "h9".to_owned(),
            ingress: Dpid(1),
            in_port: PortNo(11),
            groups: btreemap! {
                Dpid(1) => vec![PortNo(2), PortNo(3), PortNo(4)],
                Dpid(2) => vec![PortNo(2)],
                Dpid(3) => vec![PortNo(2)],
                Dpid(4) => vec![PortNo(2)],
                Dpid(5) => vec![PortNo(12)],
            },
            primary,
            rate_bps: 80 * MBPS,
        },
    );
    LegsFixture {
        topo,
        usage,
        candidates,
    }
}

fn run_legs(
    fixture: &mut LegsFixture,
    method: OptiMethod,
    pot_path_sort_rev: bool,
    partial_accept: bool,
) -> Vec<helix_ctrl::te::PathChange> {
    let mut te_cfg = cfg(method, 0.50, partial_accept);
    te_cfg.pot_path_sort_rev = pot_path_sort_rev;
    let mut engine = TeEngine::new(te_cfg);
    engine.check_link_congested(Dpid(1), PortNo(2), 1.0);
    engine
        .run_pass(&fixture.topo, &mut fixture.usage, &fixture.candidates)
        .changes
}

fn leg_switch(change: &helix_ctrl::te::PathChange) -> Dpid {
    change.new_primary[1].dpid
}

#[test]
fn s3_no_method_finds_a_path_without_partial_accept() {
    for method in [
        OptiMethod::FirstSol,
        OptiMethod::BestSolUsage,
        OptiMethod::BestSolPLen,
        OptiMethod::CspfRecomp,
    ] {
        let mut fixture = legs_fixture(100 * MBPS, 140 * MBPS);
        let changes = run_legs(&mut fixture, method, false, false);
        assert!(changes.is_empty(), "{method:?} must not find a path");
    }
}

#[test]
fn s3_first_sol_never_accepts_partials() {
    let mut fixture = legs_fixture(100 * MBPS, 140 * MBPS);
    let changes =
        run_legs(&mut fixture, OptiMethod::FirstSol, false, true);
    assert!(changes.is_empty());
}

#[test]
fn s3_best_sol_picks_leg_by_sort_order() {
    for method in [OptiMethod::BestSolUsage, OptiMethod::BestSolPLen] {
        // Tightest fit: the s3 leg at 80 of 100 Mbps.
        let mut fixture = legs_fixture(100 * MBPS, 140 * MBPS);
        let changes = run_legs(&mut fixture, method, false, true);
        assert_eq!(changes.len(), 1, "{method:?}");
        assert_eq!(leg_switch(&changes[0]), Dpid(3), "{method:?}");

        // Most headroom: the s4 leg at 80 of 140 Mbps.
        let mut fixture = legs_fixture(100 * MBPS, 140 * MBPS);
        let changes = run_legs(&mut fixture, method, true, true);
        assert_eq!(changes.len(), 1, "{method:?}");
        assert_eq!(leg_switch(&changes[0]), Dpid(4), "{method:?}");
    }
}

#[test]
fn s3_cspf_recomp_picks_s3_leg_regardless() {
    for pot_path_sort_rev in [false, true] {
        let mut fixture = legs_fixture(100 * MBPS, 140 * MBPS);
        let changes = run_legs(
            &mut fixture,
            OptiMethod::CspfRecomp,
            pot_path_sort_rev,
            true,
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Reinstall);
        assert_eq!(leg_switch(&changes[0]), Dpid(3));
    }
}

#[test]
fn partial_accept_strictly_improves_max_usage() {
    let mut fixture = legs_fixture(100 * MBPS, 140 * MBPS);
    let before = fixture.usage.max_utilisation(&fixture.topo);
    let changes =
        run_legs(&mut fixture, OptiMethod::BestSolUsage, false, true);
    assert_eq!(changes.len(), 1);
    let after = fixture.usage.max_utilisation(&fixture.topo);
    assert!(after < before);
}

#[test]
fn partial_not_improving_max_usage_is_rejected() {
    // Both alternative legs are as tight as the congested link itself:
    // moving would not improve the network-wide maximum.
    for method in [
        OptiMethod::BestSolUsage,
        OptiMethod::BestSolPLen,
        OptiMethod::CspfRecomp,
    ] {
        let mut fixture = legs_fixture(80 * MBPS, 80 * MBPS);
        let changes = run_legs(&mut fixture, method, false, true);
        assert!(changes.is_empty(), "{method:?} must reject");
        // Unresolvable: the pass reports residual congestion.
        let mut te_cfg = cfg(method, 0.50, true);
        te_cfg.pot_path_sort_rev = false;
        let mut engine = TeEngine::new(te_cfg);
        engine.check_link_congested(Dpid(1), PortNo(2), 1.0);
        let report = engine.run_pass(
            &fixture.topo,
            &mut fixture.usage,
            &fixture.candidates,
        );
        assert_eq!(report.residual, vec![(Dpid(1), PortNo(2))]);
    }
}

#[test]
fn overloaded_legs_are_invalid_even_with_partial_accept() {
    // Moving 80 Mbps onto a 79.999999 Mbps link would lose traffic.
    for method in [
        OptiMethod::FirstSol,
        OptiMethod::BestSolUsage,
        OptiMethod::BestSolPLen,
        OptiMethod::CspfRecomp,
    ] {
        for partial in [false, true] {
            let mut fixture = legs_fixture(79_999_999, 79_999_999);
            let changes = run_legs(&mut fixture, method, false, partial);
            assert!(changes.is_empty(), "{method:?}/{partial}");
        }
    }
}

// ===== usage table invariants =====

#[test]
fn usage_table_moves_contributions() {
    let mut usage = UsageTable::new();
    let gid = Gid::from_pair("h1", "h2").unwrap();

    let old = vec![hop(1, 1, 2), hop(2, 1, 2)];
    usage.record(gid, &old, 100);
    assert_eq!(usage.total(Dpid(1), PortNo(2)), 100);

    let new = vec![hop(1, 1, 3), hop(3, 1, 2)];
    usage.record(gid, &new, 100);
    assert_eq!(usage.total(Dpid(1), PortNo(2)), 0);
    assert_eq!(usage.total(Dpid(1), PortNo(3)), 100);
    assert_eq!(usage.total(Dpid(2), PortNo(2)), 0);

    usage.remove(gid);
    assert_eq!(usage.total(Dpid(1), PortNo(3)), 0);
}
