//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::time::Duration;

use bitflags::bitflags;
use helix_utils::southbound::{FlowCounters, PortCounters};
use helix_utils::{Dpid, Gid, PortNo};

use crate::debug::Debug;

// Exponential smoothing factor for send-rate estimates.
const EWMA_FACTOR: f64 = 0.5;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PendingReplies: u8 {
        const PORT = 0x01;
        const FLOW = 0x02;
    }
}

// Smoothed per-port transmit rate derived from one stats cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortSample {
    pub dpid: Dpid,
    pub port: PortNo,
    pub tx_rate_bps: u64,
}

#[derive(Clone, Debug, Default)]
struct PortHistory {
    last: Option<PortCounters>,
    tx_rate_bps: Option<f64>,
}

// Per-candidate counters, fed from the first-hop flow entry.
#[derive(Clone, Debug, Default)]
pub struct FlowHistory {
    last: Option<FlowCounters>,
    rate_bps: Option<f64>,
    pub poll_packets: u64,
    pub poll_bytes: u64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub polls: u64,
}

/// Derives send-rate estimates from periodic switch counters.
///
/// Counter resets (non-monotone deltas) drop the affected sample; the
/// stale baseline is replaced so the next cycle recovers.
#[derive(Debug)]
pub struct StatsCollector {
    interval: Duration,
    ports: BTreeMap<(Dpid, PortNo), PortHistory>,
    flows: BTreeMap<Gid, FlowHistory>,
    pending: BTreeMap<Dpid, PendingReplies>,
}

// ===== impl FlowHistory =====

impl FlowHistory {
    pub fn rate_bps(&self) -> u64 {
        self.rate_bps.unwrap_or(0.0) as u64
    }
}

// ===== impl StatsCollector =====

impl StatsCollector {
    pub fn new(interval: Duration) -> StatsCollector {
        StatsCollector {
            interval,
            ports: BTreeMap::new(),
            flows: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts a polling cycle covering the given switches.
    pub fn begin_cycle(
        &mut self,
        switches: impl Iterator<Item = Dpid>,
        expect: PendingReplies,
    ) {
        self.pending = switches.map(|dpid| (dpid, expect)).collect();
    }

    /// Marks one reply kind received; returns true when the cycle is
    /// complete and a stats-ready event is due.
    pub fn reply_received(
        &mut self,
        dpid: Dpid,
        kind: PendingReplies,
    ) -> bool {
        if let Some(outstanding) = self.pending.get_mut(&dpid) {
            outstanding.remove(kind);
            if outstanding.is_empty() {
                self.pending.remove(&dpid);
            }
        }
        self.pending.is_empty()
    }

    /// A switch that stopped responding no longer blocks the cycle.
    pub fn forget_switch(&mut self, dpid: Dpid) -> bool {
        self.pending.remove(&dpid);
        self.ports.retain(|(sw, _), _| *sw != dpid);
        self.pending.is_empty()
    }

    /// Folds one port-stats reply into the rate estimates. Samples with
    /// non-monotone counters are dropped.
    pub fn process_port_stats(
        &mut self,
        dpid: Dpid,
        counters: &[PortCounters],
    ) -> Vec<PortSample> {
        let mut samples = Vec::new();
        for sample in counters {
            if !sample.port.is_physical() {
                continue;
            }
            let hist =
                self.ports.entry((dpid, sample.port)).or_default();
            let Some(last) = hist.last.replace(*sample) else {
                continue;
            };

            if sample.tx_bytes < last.tx_bytes
                || sample.rx_bytes < last.rx_bytes
            {
                Debug::StatsCounterReset(dpid, sample.port).log();
                hist.tx_rate_bps = None;
                continue;
            }

            let delta = (sample.tx_bytes - last.tx_bytes) as f64;
            let inst = delta * 8.0 / self.interval.as_secs_f64();
            let rate = match hist.tx_rate_bps {
                Some(prev) => {
                    EWMA_FACTOR * inst + (1.0 - EWMA_FACTOR) * prev
                }
                None => inst,
            };
            hist.tx_rate_bps = Some(rate);
            samples.push(PortSample {
                dpid,
                port: sample.port,
                tx_rate_bps: rate as u64,
            });
        }
        samples
    }

    /// Folds first-hop flow counters into the per-candidate rates. The
    /// caller passes only samples read from each candidate's first-hop
    /// switch.
    pub fn process_flow_stats(
        &mut self,
        dpid: Dpid,
        counters: &[FlowCounters],
    ) -> Vec<(Gid, u64)> {
        let mut rates = Vec::new();
        for sample in counters {
            let hist = self.flows.entry(sample.gid).or_default();
            hist.total_packets = sample.packets;
            hist.total_bytes = sample.bytes;
            let Some(last) = hist.last.replace(*sample) else {
                continue;
            };

            if sample.bytes < last.bytes {
                Debug::StatsCounterReset(dpid, PortNo(0)).log();
                hist.rate_bps = None;
                continue;
            }

            hist.poll_packets = sample.packets - last.packets;
            hist.poll_bytes = sample.bytes - last.bytes;
            hist.polls += 1;
            let inst = hist.poll_bytes as f64 * 8.0
                / self.interval.as_secs_f64();
            let rate = match hist.rate_bps {
                Some(prev) => {
                    EWMA_FACTOR * inst + (1.0 - EWMA_FACTOR) * prev
                }
                None => inst,
            };
            hist.rate_bps = Some(rate);
            rates.push((sample.gid, rate as u64));
        }
        rates
    }

    pub fn flow_history(&self, gid: Gid) -> Option<&FlowHistory> {
        self.flows.get(&gid)
    }

    pub fn forget_flow(&mut self, gid: Gid) {
        self.flows.remove(&gid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(port: u32, tx_bytes: u64) -> PortCounters {
        PortCounters {
            port: PortNo(port),
            tx_bytes,
            ..Default::default()
        }
    }

    #[test]
    fn rates_are_smoothed() {
        let mut stats = StatsCollector::new(Duration::from_secs(10));
        let dpid = Dpid(1);

        // First sample only establishes the baseline.
        assert!(stats.process_port_stats(dpid, &[counters(1, 0)]).is_empty());

        // 1000 bytes over 10s = 800 bps.
        let samples = stats.process_port_stats(dpid, &[counters(1, 1000)]);
        assert_eq!(samples[0].tx_rate_bps, 800);

        // Next delta of 3000 bytes = 2400 bps inst, smoothed with 800.
        let samples = stats.process_port_stats(dpid, &[counters(1, 4000)]);
        assert_eq!(samples[0].tx_rate_bps, 1600);
    }

    #[test]
    fn counter_reset_drops_sample() {
        let mut stats = StatsCollector::new(Duration::from_secs(10));
        let dpid = Dpid(1);

        stats.process_port_stats(dpid, &[counters(1, 5000)]);
        stats.process_port_stats(dpid, &[counters(1, 6000)]);
        // Switch rebooted; counters went backwards.
        assert!(stats
            .process_port_stats(dpid, &[counters(1, 100)])
            .is_empty());
        // Next cycle recovers from the new baseline.
        let samples = stats.process_port_stats(dpid, &[counters(1, 1100)]);
        assert_eq!(samples[0].tx_rate_bps, 800);
    }

    #[test]
    fn cycle_completion() {
        let mut stats = StatsCollector::new(Duration::from_secs(1));
        stats.begin_cycle(
            [Dpid(1), Dpid(2)].into_iter(),
            PendingReplies::PORT | PendingReplies::FLOW,
        );
        assert!(!stats.reply_received(Dpid(1), PendingReplies::PORT));
        assert!(!stats.reply_received(Dpid(1), PendingReplies::FLOW));
        assert!(!stats.reply_received(Dpid(2), PendingReplies::PORT));
        assert!(stats.reply_received(Dpid(2), PendingReplies::FLOW));
    }
}
