//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_ctrl::path::Weight;
use helix_ctrl::protect::{
    self, CandidateRules, RecoveryStrategy,
};
use helix_ctrl::topology::Topology;
use helix_utils::southbound::{
    FlowAction, FlowMatch, FlowOp, GroupOp, SwitchMsg,
};
use helix_utils::{Dpid, Gid, HostId, MacAddr, NodeId, PortNo};

const GBPS: u64 = 1_000_000_000;

fn host(name: &str, ip: u8) -> HostId {
    HostId {
        name: name.to_owned(),
        mac: MacAddr([0, 0, 0, 0, 0, ip]),
        ip: std::net::Ipv4Addr::new(10, 0, 0, ip),
    }
}

fn h(name: &str) -> NodeId {
    NodeId::Host(name.to_owned())
}

// S1 topology: linear h1-s1-s2-s3-s4-s5-h2 plus the s1-s4 chord, all
// links 1 Gbps.
fn s1_topology() -> Topology {
    let mut topo = Topology::new();
    for (a, b) in [(1, 2), (2, 3), (3, 4), (4, 5)] {
        topo.add_link(Dpid(a), PortNo(2), Dpid(b), PortNo(1), GBPS)
            .unwrap();
    }
    topo.add_link(Dpid(1), PortNo(3), Dpid(4), PortNo(3), GBPS)
        .unwrap();
    topo.add_host(host("h1", 1), Dpid(1), PortNo(9)).unwrap();
    topo.add_host(host("h2", 2), Dpid(5), PortNo(9)).unwrap();
    topo
}

fn compute(topo: &Topology) -> (Gid, CandidateRules) {
    let gid = Gid::from_pair("h1", "h2").unwrap();
    let paths = RecoveryStrategy::ProtectionStrict
        .compute_paths(topo, &h("h1"), &h("h2"), Weight::Unit)
        .unwrap();
    let rules = protect::compile(topo, gid, "h2", &paths).unwrap();
    (gid, rules)
}

// Asserts the install-then-activate / deactivate-then-uninstall order
// per switch: no flow points at a group the switch does not have yet,
// and no group is removed while a flow still references it.
fn assert_program_order(msgs: &[SwitchMsg], initial: &CandidateRules) {
    let mut groups: BTreeMap<Dpid, bool> = initial
        .groups
        .keys()
        .map(|dpid| (*dpid, true))
        .collect();
    let mut flows: BTreeMap<Dpid, bool> = initial
        .flows
        .keys()
        .map(|dpid| (*dpid, true))
        .collect();

    for msg in msgs {
        match msg {
            SwitchMsg::Group(group) => match group.op {
                GroupOp::Add | GroupOp::Modify => {
                    groups.insert(group.dpid, true);
                }
                GroupOp::Delete => {
                    assert!(
                        !flows.get(&group.dpid).copied().unwrap_or(false),
                        "group removed while flow references it on {}",
                        group.dpid
                    );
                    groups.insert(group.dpid, false);
                }
            },
            SwitchMsg::Flow(flow) => match flow.op {
                FlowOp::Add => {
                    let targets_group = matches!(
                        flow.action,
                        FlowAction::Group(_) | FlowAction::TagAndGroup(_)
                    );
                    if targets_group {
                        assert!(
                            groups
                                .get(&flow.dpid)
                                .copied()
                                .unwrap_or(false),
                            "flow activated before group on {}",
                            flow.dpid
                        );
                    }
                    flows.insert(flow.dpid, true);
                }
                FlowOp::Delete => {
                    flows.insert(flow.dpid, false);
                }
            },
            _ => (),
        }
    }
}

#[test]
fn fresh_install_orders_groups_before_flows() {
    let topo = s1_topology();
    let (gid, rules) = compute(&topo);

    let msgs = protect::diff(gid, &CandidateRules::default(), &rules);
    assert_program_order(&msgs, &CandidateRules::default());

    // Every on-path switch got a group and a flow.
    assert!(!rules.groups.is_empty());
    assert_eq!(rules.groups.len(), rules.flows.len());
}

#[test]
fn revocation_orders_flows_before_groups() {
    let topo = s1_topology();
    let (gid, rules) = compute(&topo);

    let msgs = protect::revoke(gid, &rules);
    assert_program_order(&msgs, &rules);

    // All flow deletes precede all group deletes.
    let first_group_delete = msgs.iter().position(|msg| {
        matches!(msg, SwitchMsg::Group(g) if g.op == GroupOp::Delete)
    });
    let last_flow_delete = msgs
        .iter()
        .rposition(|msg| matches!(msg, SwitchMsg::Flow(_)));
    if let (Some(group), Some(flow)) = (first_group_delete, last_flow_delete)
    {
        assert!(flow < group);
    }
}

#[test]
fn unaffected_switches_are_untouched() {
    let topo = s1_topology();
    let (gid, rules) = compute(&topo);

    // Same rules: an empty program.
    let msgs = protect::diff(gid, &rules, &rules);
    assert!(msgs.is_empty());
}

#[test]
fn first_hop_fails_over_without_the_controller() {
    let topo = s1_topology();
    let (_gid, rules) = compute(&topo);

    // The primary runs over the chord; the first-hop group carries the
    // backup egress in a later bucket, so the switch swings over on
    // watch-port failure with no control-plane round-trip.
    let s1 = &rules.groups[&Dpid(1)];
    assert!(s1.len() >= 2);
    assert_eq!(s1[0].egress, PortNo(3));
    assert_eq!(s1[0].watch, PortNo(3));
    assert_eq!(s1[1].egress, PortNo(2));

    // First hop classifies on the host pair and tags the GID.
    let rule = &rules.flows[&Dpid(1)];
    assert!(matches!(rule.r#match, FlowMatch::Ingress { .. }));
    assert!(matches!(rule.action, FlowAction::TagAndGroup(_)));
}

#[test]
fn failed_link_rederives_backup() {
    let mut topo = s1_topology();
    let (gid, rules) = compute(&topo);

    // Primary chord fails.
    topo.link_down(Dpid(1), PortNo(3));
    let paths = RecoveryStrategy::ProtectionStrict
        .compute_paths(&topo, &h("h1"), &h("h2"), Weight::Unit)
        .unwrap();
    let new_rules =
        protect::compile(&topo, gid, "h2", &paths).unwrap();

    // New primary runs the linear path.
    let hops: Vec<Dpid> =
        paths.primary.iter().map(|hop| hop.dpid).collect();
    assert_eq!(
        hops,
        [Dpid(1), Dpid(2), Dpid(3), Dpid(4), Dpid(5)]
    );
    // Path validity: connected active edges, no repeated switches.
    let mut seen = std::collections::BTreeSet::new();
    for hop in &paths.primary {
        assert!(seen.insert(hop.dpid));
        assert!(topo.edge(hop.dpid, hop.out_port).unwrap().is_active());
    }

    let msgs = protect::diff(gid, &rules, &new_rules);
    assert_program_order(&msgs, &rules);
}

#[test]
fn reactive_strategy_installs_primary_only() {
    let topo = s1_topology();
    let paths = RecoveryStrategy::Reactive
        .compute_paths(&topo, &h("h1"), &h("h2"), Weight::Unit)
        .unwrap();
    assert!(paths.backup.is_empty());
    assert!(paths.splices.is_empty());

    let gid = Gid::from_pair("h1", "h2").unwrap();
    let rules = protect::compile(&topo, gid, "h2", &paths).unwrap();
    for buckets in rules.groups.values() {
        assert_eq!(buckets.len(), 1);
    }
}

#[test]
fn loose_splices_extend_coverage() {
    let topo = s1_topology();
    let strict = RecoveryStrategy::ProtectionStrict
        .compute_paths(&topo, &h("h1"), &h("h2"), Weight::Unit)
        .unwrap();
    let loose = RecoveryStrategy::ProtectionLooseSplice
        .compute_paths(&topo, &h("h1"), &h("h2"), Weight::Unit)
        .unwrap();

    // Both protect the same primary; the loose variant may add splices
    // at nodes adjacent to unique segments but never fewer.
    assert_eq!(strict.primary, loose.primary);
    assert!(loose.splices.len() >= strict.splices.len());
}
