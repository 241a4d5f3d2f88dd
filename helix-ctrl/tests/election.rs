//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::time::Duration;

use helix_ctrl::config::CtrlCfg;
use helix_ctrl::instance::Instance;
use helix_utils::bus::{
    Bus, BusAddr, BusEnvelope, BusMsg, BusReceiver,
};
use helix_utils::{AreaId, Epoch, InstanceId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

fn spawn_instance(
    bus: &Bus,
    area: u32,
    instance_id: u32,
) -> JoinHandle<i32> {
    let mut cfg = CtrlCfg::default();
    // No switches in these tests; the stats poller would only add
    // noise.
    cfg.stats.collect = false;

    let (handle, bus_rx) = bus.join(BusAddr::Instance(
        AreaId(area),
        InstanceId(instance_id),
    ));
    let (sb_tx, mut sb_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while sb_rx.recv().await.is_some() {} });

    let (instance, proto_rx) = Instance::new(
        AreaId(area),
        InstanceId(instance_id),
        cfg,
        sb_tx,
        Some(handle),
    );
    tokio::spawn(instance.run(proto_rx, Some(bus_rx)))
}

fn drain(probe: &mut BusReceiver) -> Vec<BusEnvelope> {
    let mut envelopes = Vec::new();
    while let Ok(envelope) = probe.try_recv() {
        envelopes.push(envelope);
    }
    envelopes
}

fn announces(
    envelopes: &[BusEnvelope],
) -> Vec<(BusAddr, Epoch)> {
    envelopes
        .iter()
        .filter_map(|env| match &env.msg {
            BusMsg::RoleAnnounce { epoch } => Some((env.src, *epoch)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn s4_lowest_survivor_announces_next_epoch() {
    let bus = Bus::new();
    let (_probe_handle, mut probe) = bus.join(BusAddr::Root(99));

    let inst0 = spawn_instance(&bus, 1, 0);
    let _inst1 = spawn_instance(&bus, 1, 1);
    let _inst2 = spawn_instance(&bus, 1, 2);

    // Init: the lowest instance ID claims the area with epoch 1.
    sleep(Duration::from_secs(3)).await;
    let startup = announces(&drain(&mut probe));
    assert_eq!(
        startup,
        [(BusAddr::Instance(AreaId(1), InstanceId(0)), Epoch(1))]
    );

    // Fail instance 0.
    inst0.abort();
    sleep(Duration::from_secs(8)).await;

    // Instances 1 and 2 miss three heartbeats; exactly one
    // ROLE_ANNOUNCE carries the new epoch, from the lowest survivor.
    let failover = announces(&drain(&mut probe));
    assert_eq!(
        failover,
        [(BusAddr::Instance(AreaId(1), InstanceId(1)), Epoch(2))]
    );
}

#[tokio::test(start_paused = true)]
async fn s5_concurrent_area_failures_elect_independently() {
    let bus = Bus::new();
    let (_probe_handle, mut probe) = bus.join(BusAddr::Root(99));

    // A real root controller observing both areas.
    let (root_handle, root_rx) = bus.join(BusAddr::Root(0));
    let (root, root_proto_rx) =
        helix_root::instance::Root::new(0, root_handle, Vec::new());
    tokio::spawn(root.run(root_proto_rx, root_rx));

    let c1_primary = spawn_instance(&bus, 1, 0);
    let _c1_standby = spawn_instance(&bus, 1, 1);
    let c2_primary = spawn_instance(&bus, 2, 0);
    let _c2_standby = spawn_instance(&bus, 2, 1);

    sleep(Duration::from_secs(3)).await;
    let startup = announces(&drain(&mut probe));
    assert_eq!(startup.len(), 2);

    // Both areas lose their primary at the same moment.
    c1_primary.abort();
    c2_primary.abort();
    sleep(Duration::from_secs(8)).await;

    let envelopes = drain(&mut probe);
    let failover = announces(&envelopes);

    // Each area elects independently: one announce per area, both at
    // epoch 2, from the respective instance 1.
    assert_eq!(failover.len(), 2);
    for area in [1, 2] {
        assert!(failover.contains(&(
            BusAddr::Instance(AreaId(area), InstanceId(1)),
            Epoch(2)
        )));
    }

    // The root observes both announcements but issues no inter-area
    // path modification and no demotion.
    for envelope in &envelopes {
        assert!(
            !matches!(
                envelope.msg,
                BusMsg::SegmentRequest { .. }
                    | BusMsg::InterAreaResponse { .. }
                    | BusMsg::RoleDemote { .. }
            ),
            "unexpected root action: {:?}",
            envelope.msg
        );
    }
}

#[tokio::test(start_paused = true)]
async fn epochs_are_monotone_per_sender() {
    let bus = Bus::new();
    let (_probe_handle, mut probe) = bus.join(BusAddr::Root(99));

    let inst0 = spawn_instance(&bus, 1, 0);
    let _inst1 = spawn_instance(&bus, 1, 1);
    sleep(Duration::from_secs(4)).await;
    inst0.abort();
    sleep(Duration::from_secs(8)).await;

    let mut last_epoch: BTreeMap<BusAddr, Epoch> = BTreeMap::new();
    let mut last_seq: BTreeMap<BusAddr, u64> = BTreeMap::new();
    for envelope in drain(&mut probe) {
        // Bus sequence numbers are strictly increasing per sender.
        if let Some(last) = last_seq.insert(envelope.src, envelope.seq) {
            assert!(envelope.seq > last);
        }
        let epoch = match envelope.msg {
            BusMsg::Heartbeat { epoch } => epoch,
            BusMsg::RoleAnnounce { epoch } => epoch,
            _ => continue,
        };
        if let Some(last) = last_epoch.insert(envelope.src, epoch) {
            assert!(epoch >= last);
        }
    }
    assert!(!last_epoch.is_empty());
}
