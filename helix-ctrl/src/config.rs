//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

use crate::protect::RecoveryStrategy;
use crate::te::OptiMethod;

// Bounds from the configuration contract.
const STATS_INTERVAL_MIN: f64 = 0.5;
const STATS_INTERVAL_MAX: f64 = 600.0;

/// Local-controller configuration, loaded from the `[application]`,
/// `[stats]`, `[multi_ctrl]` and `[te]` blocks of the controller
/// configuration file. Out-of-range values are fatal at startup.
// No deny_unknown_fields: the daemon flattens these blocks into its own
// configuration file.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct CtrlCfg {
    pub application: ApplicationCfg,
    pub stats: StatsCfg,
    pub multi_ctrl: MultiCtrlCfg,
    pub te: TeCfg,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplicationCfg {
    pub optimise_protection: bool,
    pub static_port_desc: Option<String>,
    pub recovery: RecoveryStrategy,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsCfg {
    pub collect: bool,
    pub collect_port: bool,
    pub interval: f64,
    pub out_port: bool,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultiCtrlCfg {
    pub start_com: bool,
    pub domain_id: u32,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeCfg {
    pub utilisation_threshold: f64,
    pub consolidate_time: f64,
    pub opti_method: OptiMethod,
    pub candidate_sort_rev: bool,
    pub pot_path_sort_rev: bool,
    pub partial_accept: bool,
}

// Configuration errors are fatal at startup (exit code 1).
#[derive(Debug)]
pub enum ConfigError {
    StatsIntervalOutOfRange(f64),
    ThresholdOutOfRange(f64),
    ConsolidateNotBelowInterval(f64, f64),
}

// ===== impl CtrlCfg =====

impl CtrlCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(STATS_INTERVAL_MIN..=STATS_INTERVAL_MAX)
            .contains(&self.stats.interval)
        {
            return Err(ConfigError::StatsIntervalOutOfRange(
                self.stats.interval,
            ));
        }
        if !(0.0..=1.0).contains(&self.te.utilisation_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(
                self.te.utilisation_threshold,
            ));
        }
        // The consolidation delay must fit inside a polling interval or
        // every pass would race the next stats cycle.
        if self.te.consolidate_time >= self.stats.interval {
            return Err(ConfigError::ConsolidateNotBelowInterval(
                self.te.consolidate_time,
                self.stats.interval,
            ));
        }
        Ok(())
    }

    /// Whether TE optimisation can run at all: without port collection
    /// there is no utilisation signal.
    pub fn te_enabled(&self) -> bool {
        self.stats.collect && self.stats.collect_port
    }
}

// ===== impl ApplicationCfg =====

impl Default for ApplicationCfg {
    fn default() -> ApplicationCfg {
        ApplicationCfg {
            optimise_protection: true,
            static_port_desc: None,
            recovery: RecoveryStrategy::default(),
        }
    }
}

// ===== impl StatsCfg =====

impl Default for StatsCfg {
    fn default() -> StatsCfg {
        StatsCfg {
            collect: true,
            collect_port: true,
            interval: 10.0,
            out_port: false,
        }
    }
}

// ===== impl MultiCtrlCfg =====

impl Default for MultiCtrlCfg {
    fn default() -> MultiCtrlCfg {
        MultiCtrlCfg {
            start_com: true,
            domain_id: 0,
        }
    }
}

// ===== impl TeCfg =====

impl Default for TeCfg {
    fn default() -> TeCfg {
        TeCfg {
            utilisation_threshold: 0.90,
            consolidate_time: 1.0,
            opti_method: OptiMethod::FirstSol,
            candidate_sort_rev: true,
            pot_path_sort_rev: false,
            partial_accept: false,
        }
    }
}

// ===== impl ConfigError =====

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::StatsIntervalOutOfRange(value) => {
                write!(
                    f,
                    "stats interval {} outside [{}, {}]",
                    value, STATS_INTERVAL_MIN, STATS_INTERVAL_MAX
                )
            }
            ConfigError::ThresholdOutOfRange(value) => {
                write!(f, "utilisation threshold {} outside [0, 1]", value)
            }
            ConfigError::ConsolidateNotBelowInterval(delay, interval) => {
                write!(
                    f,
                    "consolidation delay {} not below stats interval {}",
                    delay, interval
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CtrlCfg::default().validate().unwrap();
    }

    #[test]
    fn bounds_are_enforced() {
        let mut cfg = CtrlCfg::default();
        cfg.stats.interval = 0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = CtrlCfg::default();
        cfg.te.utilisation_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = CtrlCfg::default();
        cfg.te.consolidate_time = 10.0;
        assert!(cfg.validate().is_err());
    }
}
