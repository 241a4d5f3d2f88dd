//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_utils::AreaId;
use helix_utils::bus::{
    InterAreaLink, PathSegment, SegmentEndpoint, StitchedPath,
};

// One inter-area link under evaluation, waiting for its two segments.
#[derive(Clone, Debug)]
pub struct Leg {
    pub link: InterAreaLink,
    pub src_segment: Option<Option<PathSegment>>,
    pub dst_segment: Option<Option<PathSegment>>,
}

// An in-flight stitching operation: one INTER_AREA_REQ fanned out into
// segment queries over every eligible inter-area link.
#[derive(Debug)]
pub struct PendingStitch {
    pub req_id: u64,
    pub src_area: AreaId,
    pub dst_area: AreaId,
    pub src_host: String,
    pub dst_host: String,
    pub dst_ip: std::net::Ipv4Addr,
    // Segment-query id -> (leg index, true for the source-side segment).
    pub outstanding: BTreeMap<u64, (usize, bool)>,
    pub legs: Vec<Leg>,
}

// A segment query to send to an area master.
#[derive(Clone, Debug)]
pub struct SegmentQuery {
    pub query_id: u64,
    pub area: AreaId,
    pub from: SegmentEndpoint,
    pub to: SegmentEndpoint,
}

// ===== impl PendingStitch =====

impl PendingStitch {
    /// Prepares the stitching operation and the segment queries to fan
    /// out, one pair per eligible inter-area link.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        req_id: u64,
        src_area: AreaId,
        dst_area: AreaId,
        src_host: &str,
        dst_host: &str,
        dst_ip: std::net::Ipv4Addr,
        links: Vec<InterAreaLink>,
        next_query_id: &mut u64,
    ) -> (PendingStitch, Vec<SegmentQuery>) {
        let mut stitch = PendingStitch {
            req_id,
            src_area,
            dst_area,
            src_host: src_host.to_owned(),
            dst_host: dst_host.to_owned(),
            dst_ip,
            outstanding: BTreeMap::new(),
            legs: Vec::new(),
        };
        let mut queries = Vec::new();

        for link in links {
            let idx = stitch.legs.len();
            stitch.legs.push(Leg {
                link,
                src_segment: None,
                dst_segment: None,
            });

            let src_query = *next_query_id;
            *next_query_id += 1;
            stitch.outstanding.insert(src_query, (idx, true));
            queries.push(SegmentQuery {
                query_id: src_query,
                area: src_area,
                from: SegmentEndpoint::Host(src_host.to_owned()),
                to: SegmentEndpoint::Border(link.sw_a, link.port_a),
            });

            let dst_query = *next_query_id;
            *next_query_id += 1;
            stitch.outstanding.insert(dst_query, (idx, false));
            queries.push(SegmentQuery {
                query_id: dst_query,
                area: dst_area,
                from: SegmentEndpoint::Border(link.sw_b, link.port_b),
                to: SegmentEndpoint::Host(dst_host.to_owned()),
            });
        }
        (stitch, queries)
    }

    /// Folds one segment response in. Returns true once every query has
    /// been answered.
    pub fn answer(
        &mut self,
        query_id: u64,
        segment: Option<PathSegment>,
    ) -> bool {
        if let Some((idx, src_side)) = self.outstanding.remove(&query_id) {
            let leg = &mut self.legs[idx];
            if src_side {
                leg.src_segment = Some(segment);
            } else {
                leg.dst_segment = Some(segment);
            }
        }
        self.outstanding.is_empty()
    }

    /// Selects the best (link, segments) triple: minimal total hop
    /// count, tie-break by the lower aggregated maximum utilisation of
    /// the two segments.
    pub fn select(&self) -> Option<StitchedPath> {
        let mut best: Option<(usize, f64, StitchedPath)> = None;
        for leg in &self.legs {
            let (Some(Some(src)), Some(Some(dst))) =
                (&leg.src_segment, &leg.dst_segment)
            else {
                continue;
            };
            let hops = src.hops.len() + dst.hops.len();
            let util = src.max_utilisation.max(dst.max_utilisation);
            let better = match &best {
                None => true,
                Some((best_hops, best_util, _)) => {
                    hops < *best_hops
                        || (hops == *best_hops && util < *best_util)
                }
            };
            if better {
                best = Some((
                    hops,
                    util,
                    StitchedPath {
                        link: leg.link,
                        src_segment: src.clone(),
                        dst_segment: dst.clone(),
                        dst_ip: self.dst_ip,
                    },
                ));
            }
        }
        best.map(|(_, _, path)| path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_utils::southbound::PathHop;
    use helix_utils::{Dpid, PortNo};

    fn link(n: u64) -> InterAreaLink {
        InterAreaLink {
            area_a: AreaId(1),
            sw_a: Dpid(n),
            port_a: PortNo(1),
            area_b: AreaId(2),
            sw_b: Dpid(n + 100),
            port_b: PortNo(1),
        }
    }

    fn segment(hops: usize, max_utilisation: f64) -> PathSegment {
        let hops = (0..hops)
            .map(|i| PathHop {
                dpid: Dpid(i as u64),
                in_port: PortNo(1),
                out_port: PortNo(2),
            })
            .collect();
        PathSegment {
            hops,
            max_utilisation,
        }
    }

    fn pending(links: Vec<InterAreaLink>) -> (PendingStitch, Vec<SegmentQuery>) {
        let mut next_query_id = 1;
        PendingStitch::new(
            7,
            AreaId(1),
            AreaId(2),
            "h1",
            "h9",
            std::net::Ipv4Addr::new(10, 0, 0, 9),
            links,
            &mut next_query_id,
        )
    }

    #[test]
    fn shortest_total_wins() {
        let (mut stitch, queries) = pending(vec![link(1), link(2)]);
        assert_eq!(queries.len(), 4);

        // Leg 0: 2+2 hops. Leg 1: 1+2 hops.
        stitch.answer(queries[0].query_id, Some(segment(2, 0.1)));
        stitch.answer(queries[1].query_id, Some(segment(2, 0.1)));
        stitch.answer(queries[2].query_id, Some(segment(1, 0.9)));
        assert!(stitch.answer(queries[3].query_id, Some(segment(2, 0.9))));

        let path = stitch.select().unwrap();
        assert_eq!(path.link.sw_a, Dpid(2));
    }

    #[test]
    fn utilisation_breaks_hop_ties() {
        let (mut stitch, queries) = pending(vec![link(1), link(2)]);

        stitch.answer(queries[0].query_id, Some(segment(2, 0.8)));
        stitch.answer(queries[1].query_id, Some(segment(2, 0.2)));
        stitch.answer(queries[2].query_id, Some(segment(2, 0.3)));
        stitch.answer(queries[3].query_id, Some(segment(2, 0.3)));

        let path = stitch.select().unwrap();
        // Equal hop counts; the second leg's aggregated max is lower.
        assert_eq!(path.link.sw_a, Dpid(2));
    }

    #[test]
    fn unanswerable_legs_are_skipped() {
        let (mut stitch, queries) = pending(vec![link(1)]);
        stitch.answer(queries[0].query_id, None);
        assert!(stitch.answer(queries[1].query_id, Some(segment(2, 0.1))));
        assert!(stitch.select().is_none());
    }
}
