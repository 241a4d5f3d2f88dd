//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use helix_root::instance::Root;
use helix_utils::bus::{
    Bus, BusAddr, BusDest, BusMsg, BusReceiver, InterAreaLink,
    PathSegment, SegmentEndpoint, TopologySnapshot,
};
use helix_utils::southbound::PathHop;
use helix_utils::{AreaId, Dpid, Epoch, HostId, MacAddr, PortNo};
use tokio::time::sleep;

fn link(sw_a: u64, sw_b: u64) -> InterAreaLink {
    InterAreaLink {
        area_a: AreaId(1),
        sw_a: Dpid(sw_a),
        port_a: PortNo(10),
        area_b: AreaId(2),
        sw_b: Dpid(sw_b),
        port_b: PortNo(10),
    }
}

fn segment(hops: usize) -> PathSegment {
    PathSegment {
        hops: (0..hops)
            .map(|i| PathHop {
                dpid: Dpid(i as u64 + 1),
                in_port: PortNo(1),
                out_port: PortNo(2),
            })
            .collect(),
        max_utilisation: 0.1,
    }
}

fn host(name: &str, ip: u8) -> HostId {
    HostId {
        name: name.to_owned(),
        mac: MacAddr([0, 0, 0, 0, 0, ip]),
        ip: std::net::Ipv4Addr::new(10, 0, 0, ip),
    }
}

async fn recv(rx: &mut BusReceiver) -> BusMsg {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for bus message")
        .expect("bus closed")
        .msg
}

#[tokio::test(start_paused = true)]
async fn stitches_shortest_inter_area_path() {
    let bus = Bus::new();

    // Fake area masters.
    let (c1, mut c1_rx) =
        bus.join(BusAddr::Instance(AreaId(1), helix_utils::InstanceId(0)));
    let (c2, mut c2_rx) =
        bus.join(BusAddr::Instance(AreaId(2), helix_utils::InstanceId(0)));

    let (root_handle, root_rx) = bus.join(BusAddr::Root(0));
    let (root, root_proto_rx) =
        Root::new(0, root_handle, vec![link(11, 21), link(12, 22)]);
    tokio::spawn(root.run(root_proto_rx, root_rx));

    // Keep both areas live and teach the root where dst lives.
    c1.publish(
        BusDest::Area(AreaId(1)),
        BusMsg::Heartbeat { epoch: Epoch(1) },
    );
    c2.publish(
        BusDest::Area(AreaId(2)),
        BusMsg::Heartbeat { epoch: Epoch(1) },
    );
    c2.publish(
        BusDest::Roots,
        BusMsg::TopologyUpdate(TopologySnapshot {
            hosts: vec![host("h9", 9)],
            inter_area_links: Vec::new(),
        }),
    );
    sleep(Duration::from_millis(10)).await;

    c1.publish(
        BusDest::Roots,
        BusMsg::InterAreaRequest {
            req_id: 42,
            src_host: "h1".to_owned(),
            dst_host: "h9".to_owned(),
        },
    );

    // The root asks each area master for one segment per eligible link.
    let mut c1_queries = Vec::new();
    let mut c2_queries = Vec::new();
    for _ in 0..2 {
        match recv(&mut c1_rx).await {
            BusMsg::SegmentRequest { req_id, from, to } => {
                assert_eq!(from, SegmentEndpoint::Host("h1".to_owned()));
                c1_queries.push((req_id, to));
            }
            msg => panic!("unexpected message to c1: {msg:?}"),
        }
        match recv(&mut c2_rx).await {
            BusMsg::SegmentRequest { req_id, from, to } => {
                assert_eq!(to, SegmentEndpoint::Host("h9".to_owned()));
                c2_queries.push((req_id, from));
            }
            msg => panic!("unexpected message to c2: {msg:?}"),
        }
    }

    // Answer: the first link needs 3+2 hops, the second 2+2.
    for (idx, (req_id, _)) in c1_queries.iter().enumerate() {
        c1.publish(
            BusDest::Roots,
            BusMsg::SegmentResponse {
                req_id: *req_id,
                segment: Some(segment(if idx == 0 { 3 } else { 2 })),
            },
        );
    }
    for (req_id, _) in &c2_queries {
        c2.publish(
            BusDest::Roots,
            BusMsg::SegmentResponse {
                req_id: *req_id,
                segment: Some(segment(2)),
            },
        );
    }

    // Both masters receive the stitched descriptor over the second
    // (shorter) link, with the destination address resolved.
    for rx in [&mut c1_rx, &mut c2_rx] {
        match recv(rx).await {
            BusMsg::InterAreaResponse {
                req_id,
                src_host,
                dst_host,
                path,
            } => {
                assert_eq!(req_id, 42);
                assert_eq!(src_host, "h1");
                assert_eq!(dst_host, "h9");
                let path = path.expect("a stitched path");
                assert_eq!(path.link.sw_a, Dpid(12));
                assert_eq!(
                    path.dst_ip,
                    std::net::Ipv4Addr::new(10, 0, 0, 9)
                );
            }
            msg => panic!("unexpected message: {msg:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_destination_is_answered_negatively() {
    let bus = Bus::new();
    let (c1, mut c1_rx) =
        bus.join(BusAddr::Instance(AreaId(1), helix_utils::InstanceId(0)));

    let (root_handle, root_rx) = bus.join(BusAddr::Root(0));
    let (root, root_proto_rx) =
        Root::new(0, root_handle, vec![link(11, 21)]);
    tokio::spawn(root.run(root_proto_rx, root_rx));

    c1.publish(
        BusDest::Roots,
        BusMsg::InterAreaRequest {
            req_id: 7,
            src_host: "h1".to_owned(),
            dst_host: "nowhere".to_owned(),
        },
    );

    match recv(&mut c1_rx).await {
        BusMsg::InterAreaResponse { req_id, path, .. } => {
            assert_eq!(req_id, 7);
            assert!(path.is_none());
        }
        msg => panic!("unexpected message: {msg:?}"),
    }
}
