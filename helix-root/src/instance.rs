//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::bus::{
    BusAddr, BusDest, BusEnvelope, BusHandle, BusMsg, BusReceiver,
    InterAreaLink,
};
use helix_utils::task::IntervalTask;
use helix_utils::{AreaId, Dpid, PortNo, UnboundedReceiver,
    UnboundedSender};
use tokio::sync::mpsc;

use crate::catalogue::Catalogue;
use crate::debug::Debug;
use crate::error::Error;
use crate::stitch::{PendingStitch, SegmentQuery};
use crate::tasks;
use crate::tasks::messages::input::RootMsg;

#[derive(Debug, Default)]
pub struct RootState {
    pub catalogue: Catalogue,
    // In-flight stitching operations and the query -> operation index.
    pub pending: BTreeMap<u64, PendingStitch>,
    pub queries: BTreeMap<u64, u64>,
    pub next_stitch_id: u64,
    pub next_query_id: u64,
    // Last sequence number seen per bus sender.
    pub bus_seq: BTreeMap<BusAddr, u64>,
}

/// One root controller. Advisory only: it owns the inter-area link and
/// host catalogues and stitches paths from area-master segments, but
/// never talks to a switch.
pub struct Root {
    pub rid: u32,
    pub state: RootState,
    pub bus: BusHandle,
    pub proto_tx: UnboundedSender<RootMsg>,
    _tick: Option<IntervalTask>,
}

// ===== impl Root =====

impl Root {
    pub fn new(
        rid: u32,
        bus: BusHandle,
        links: Vec<InterAreaLink>,
    ) -> (Root, UnboundedReceiver<RootMsg>) {
        let (proto_tx, proto_rx) = mpsc::unbounded_channel();
        let mut state = RootState {
            next_stitch_id: 1,
            next_query_id: 1,
            ..Default::default()
        };
        for link in links {
            state.catalogue.add_link(link);
        }
        let root = Root {
            rid,
            state,
            bus,
            proto_tx,
            _tick: None,
        };
        (root, proto_rx)
    }

    /// Root main loop. Returns the process exit code.
    pub async fn run(
        mut self,
        mut proto_rx: UnboundedReceiver<RootMsg>,
        mut bus_rx: BusReceiver,
    ) -> i32 {
        Debug::RootStart.log();
        self._tick = Some(tasks::tick_interval(&self.proto_tx));

        loop {
            let result = tokio::select! {
                msg = proto_rx.recv() => {
                    match msg {
                        Some(RootMsg::Tick) => {
                            self.state.catalogue.tick();
                            Ok(())
                        }
                        Some(RootMsg::Shutdown) | None => {
                            self.bus.leave();
                            return 0;
                        }
                    }
                }
                envelope = bus_rx.recv() => {
                    match envelope {
                        Some(envelope) => self.process_bus_msg(envelope),
                        None => Err(Error::BusClosed),
                    }
                }
            };

            if let Err(error) = result {
                error.log();
                if error.is_fatal() {
                    return error.exit_code();
                }
            }
        }
    }

    fn process_bus_msg(
        &mut self,
        envelope: BusEnvelope,
    ) -> Result<(), Error> {
        Debug::BusRx(&envelope.msg).log();

        if let Some(last) = self.state.bus_seq.get(&envelope.src) {
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
        self.state.bus_seq.insert(envelope.src, envelope.seq);

        let src_area = match envelope.src {
            BusAddr::Instance(area, _) => Some(area),
            BusAddr::Root(_) => None,
        };

        match envelope.msg {
            BusMsg::Heartbeat { epoch } => {
                if let Some(area) = src_area {
                    self.state.catalogue.heartbeat(area, epoch);
                }
                Ok(())
            }
            BusMsg::RoleAnnounce { epoch } => {
                // Accept only the highest epoch per area; a stale master
                // rejoining after a partition is told to demote.
                if let (
                    Some(area),
                    BusAddr::Instance(_, instance),
                ) = (src_area, envelope.src)
                    && let Some(current) = self
                        .state
                        .catalogue
                        .role_announce(area, instance, epoch)
                {
                    Debug::DemoteStaleMaster(area, instance, current)
                        .log();
                    self.bus.publish(
                        BusDest::Area(area),
                        BusMsg::RoleDemote { epoch: current },
                    );
                }
                Ok(())
            }
            BusMsg::TopologyUpdate(snapshot) => {
                if let Some(area) = src_area {
                    for host in snapshot.hosts {
                        self.state.catalogue.learn_host(area, host);
                    }
                    for link in snapshot.inter_area_links {
                        self.state.catalogue.add_link(link);
                    }
                }
                Ok(())
            }
            BusMsg::InterAreaRequest {
                req_id,
                src_host,
                dst_host,
            } => {
                let Some(src_area) = src_area else { return Ok(()) };
                self.start_stitch(
                    req_id, src_area, &src_host, &dst_host, None,
                )
            }
            BusMsg::SegmentResponse { req_id, segment } => {
                self.process_segment_response(req_id, segment)
            }
            BusMsg::InterAreaCongested {
                dpid,
                port,
                candidates,
                ..
            } => {
                // Re-stitch the affected pairs over links avoiding the
                // congested border port.
                let Some(src_area) = src_area else { return Ok(()) };
                for (src_host, dst_host) in candidates {
                    let req_id = self.state.next_stitch_id;
                    self.state.next_stitch_id += 1;
                    if let Err(error) = self.start_stitch(
                        req_id,
                        src_area,
                        &src_host,
                        &dst_host,
                        Some((dpid, port)),
                    ) {
                        error.log();
                    }
                }
                Ok(())
            }
            // Advisories with no root-side processing.
            BusMsg::RoleQuery
            | BusMsg::RoleDemote { .. }
            | BusMsg::StateSync(_)
            | BusMsg::SegmentRequest { .. }
            | BusMsg::InterAreaResponse { .. }
            | BusMsg::EgressChange { .. } => Ok(()),
        }
    }

    // Fans one stitching request out into segment queries.
    fn start_stitch(
        &mut self,
        req_id: u64,
        src_area: AreaId,
        src_host: &str,
        dst_host: &str,
        avoid: Option<(Dpid, PortNo)>,
    ) -> Result<(), Error> {
        let Some(dst_area) = self.state.catalogue.host_area(dst_host)
        else {
            self.respond_unreachable(src_area, req_id, src_host, dst_host);
            return Err(Error::HostAreaUnknown(dst_host.to_owned()));
        };
        let mut links =
            self.state.catalogue.links_between(src_area, dst_area);
        if let Some((dpid, port)) = avoid {
            links.retain(|link| {
                (link.sw_a, link.port_a) != (dpid, port)
                    && (link.sw_b, link.port_b) != (dpid, port)
            });
        }
        if links.is_empty() {
            self.respond_unreachable(src_area, req_id, src_host, dst_host);
            return Err(Error::NoInterAreaLink(src_area, dst_area));
        }

        let dst_ip = self
            .state
            .catalogue
            .host(dst_host)
            .map(|host| host.ip)
            .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        Debug::StitchStart(src_host, dst_host, links.len()).log();

        let stitch_id = self.state.next_stitch_id;
        self.state.next_stitch_id += 1;
        let (stitch, queries) = PendingStitch::new(
            req_id,
            src_area,
            dst_area,
            src_host,
            dst_host,
            dst_ip,
            links,
            &mut self.state.next_query_id,
        );
        for SegmentQuery {
            query_id,
            area,
            from,
            to,
        } in queries
        {
            self.state.queries.insert(query_id, stitch_id);
            self.bus.publish(
                BusDest::Area(area),
                BusMsg::SegmentRequest {
                    req_id: query_id,
                    from,
                    to,
                },
            );
        }
        self.state.pending.insert(stitch_id, stitch);
        Ok(())
    }

    fn process_segment_response(
        &mut self,
        query_id: u64,
        segment: Option<helix_utils::bus::PathSegment>,
    ) -> Result<(), Error> {
        let Some(stitch_id) = self.state.queries.remove(&query_id)
        else {
            return Ok(());
        };
        let Some(stitch) = self.state.pending.get_mut(&stitch_id)
        else {
            return Ok(());
        };
        if !stitch.answer(query_id, segment) {
            return Ok(());
        }

        // All segments are in: pick the best triple and return it to
        // both area masters.
        let stitch = self.state.pending.remove(&stitch_id).unwrap();
        let path = stitch.select();
        match &path {
            Some(_) => {
                Debug::StitchComplete(&stitch.src_host, &stitch.dst_host)
                    .log()
            }
            None => {
                Debug::StitchFailed(&stitch.src_host, &stitch.dst_host)
                    .log()
            }
        }
        for area in [stitch.src_area, stitch.dst_area] {
            self.bus.publish(
                BusDest::Area(area),
                BusMsg::InterAreaResponse {
                    req_id: stitch.req_id,
                    src_host: stitch.src_host.clone(),
                    dst_host: stitch.dst_host.clone(),
                    path: path.clone(),
                },
            );
        }
        Ok(())
    }

    fn respond_unreachable(
        &self,
        src_area: AreaId,
        req_id: u64,
        src_host: &str,
        dst_host: &str,
    ) {
        self.bus.publish(
            BusDest::Area(src_area),
            BusMsg::InterAreaResponse {
                req_id,
                src_host: src_host.to_owned(),
                dst_host: dst_host.to_owned(),
                path: None,
            },
        );
    }
}
