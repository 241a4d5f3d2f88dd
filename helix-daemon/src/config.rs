//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use helix_ctrl::config::CtrlCfg;
use helix_utils::bus::InterAreaLink;
use helix_utils::{AreaId, Dpid, PortNo};
use serde::Deserialize;

// Daemon configuration file: logging plus the local-controller blocks.
// No deny_unknown_fields here: the controller blocks are flattened in.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    #[serde(flatten)]
    pub ctrl: CtrlCfg,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub file: LoggingFile,
    pub stdout: LoggingStdout,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFile {
    pub enabled: bool,
    pub dir: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingStdout {
    pub enabled: bool,
    pub colors: bool,
}

// Switch-to-controller map: which switches, hosts and instances each
// area runs, plus the inter-area link descriptors.
#[derive(Debug, Default)]
pub struct CtrlMap {
    pub roots: Vec<u32>,
    pub areas: BTreeMap<u32, AreaDesc>,
}

#[derive(Debug, Default)]
pub struct AreaDesc {
    pub switches: Vec<Dpid>,
    pub hosts: Vec<String>,
    // Instance 0 is implicit.
    pub extra_instances: Vec<u32>,
    pub neighbours: BTreeMap<u32, Vec<DomLink>>,
}

#[derive(Debug, Deserialize)]
pub struct DomLink {
    pub sw: Dpid,
    pub port: PortNo,
    pub sw_to: Dpid,
    pub port_to: PortNo,
}

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Json(serde_json::Error),
    Csv(csv::Error),
    MapFormat(String),
}

// ===== impl Config =====

impl Config {
    pub const DFLT_FILEPATH: &'static str = "/etc/helixd.toml";

    pub fn load(config_file: &str) -> Result<Config, LoadError> {
        let config_str =
            std::fs::read_to_string(config_file).map_err(LoadError::Io)?;
        toml::from_str(&config_str).map_err(LoadError::Toml)
    }
}

// ===== impl CtrlMap =====

impl CtrlMap {
    /// Loads the JSON controller map. Top-level keys are `root.<rid>`
    /// and `ctrl.<cid>`; area entries carry `sw`, `host`,
    /// `extra_instances` and `dom.<neighbour>` link lists.
    pub fn load(map_file: &str) -> Result<CtrlMap, LoadError> {
        let map_str =
            std::fs::read_to_string(map_file).map_err(LoadError::Io)?;
        let value: serde_json::Value =
            serde_json::from_str(&map_str).map_err(LoadError::Json)?;
        let object = value.as_object().ok_or_else(|| {
            LoadError::MapFormat("top level is not an object".to_owned())
        })?;

        let mut map = CtrlMap::default();
        for (key, entry) in object {
            if let Some(rid) = key.strip_prefix("root.") {
                map.roots.push(parse_id(rid, key)?);
            } else if let Some(cid) = key.strip_prefix("ctrl.") {
                let cid = parse_id(cid, key)?;
                map.areas.insert(cid, parse_area(key, entry)?);
            } else {
                return Err(LoadError::MapFormat(format!(
                    "unknown top-level key {key:?}"
                )));
            }
        }
        Ok(map)
    }

    /// All instance IDs of an area, the implicit primary first.
    pub fn instances(&self, cid: u32) -> Vec<u32> {
        let mut instances = vec![0];
        if let Some(area) = self.areas.get(&cid) {
            instances.extend(area.extra_instances.iter().copied());
        }
        instances.sort_unstable();
        instances.dedup();
        instances
    }

    /// Inter-area links of the whole map, for the root catalogue.
    pub fn inter_area_links(&self) -> Vec<InterAreaLink> {
        let mut links = Vec::new();
        for (cid, area) in &self.areas {
            for (neighbour, dom_links) in &area.neighbours {
                for link in dom_links {
                    links.push(InterAreaLink {
                        area_a: AreaId(*cid),
                        sw_a: link.sw,
                        port_a: link.port,
                        area_b: AreaId(*neighbour),
                        sw_b: link.sw_to,
                        port_b: link.port_to,
                    });
                }
            }
        }
        links
    }

    /// Border ports of one area.
    pub fn border_ports(&self, cid: u32) -> Vec<(Dpid, PortNo)> {
        self.areas
            .get(&cid)
            .map(|area| {
                area.neighbours
                    .values()
                    .flatten()
                    .map(|link| (link.sw, link.port))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hosts of every area other than `cid`.
    pub fn remote_hosts(&self, cid: u32) -> Vec<String> {
        self.areas
            .iter()
            .filter(|(other, _)| **other != cid)
            .flat_map(|(_, area)| area.hosts.iter().cloned())
            .collect()
    }
}

fn parse_id(id: &str, key: &str) -> Result<u32, LoadError> {
    let digits: String =
        id.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().map_err(|_| {
        LoadError::MapFormat(format!("cannot parse id from key {key:?}"))
    })
}

fn parse_area(
    key: &str,
    entry: &serde_json::Value,
) -> Result<AreaDesc, LoadError> {
    let object = entry.as_object().ok_or_else(|| {
        LoadError::MapFormat(format!("entry {key:?} is not an object"))
    })?;

    let mut area = AreaDesc::default();
    for (field, value) in object {
        match field.as_str() {
            "sw" => {
                area.switches = serde_json::from_value(value.clone())
                    .map_err(LoadError::Json)?;
            }
            "host" => {
                area.hosts = serde_json::from_value(value.clone())
                    .map_err(LoadError::Json)?;
            }
            "extra_instances" => {
                area.extra_instances =
                    serde_json::from_value(value.clone())
                        .map_err(LoadError::Json)?;
            }
            _ => {
                let Some(neighbour) = field.strip_prefix("dom.") else {
                    return Err(LoadError::MapFormat(format!(
                        "unknown field {field:?} in {key:?}"
                    )));
                };
                let neighbour = parse_id(neighbour, field)?;
                let links: Vec<DomLink> =
                    serde_json::from_value(value.clone())
                        .map_err(LoadError::Json)?;
                area.neighbours.insert(neighbour, links);
            }
        }
    }
    Ok(area)
}

/// Loads the static port-description table. Header `dpid,port,speed`,
/// speed in bits per second.
pub fn load_port_desc(
    path: &str,
) -> Result<Vec<(Dpid, PortNo, u64)>, LoadError> {
    #[derive(Debug, Deserialize)]
    struct Row {
        dpid: u64,
        port: u32,
        speed: u64,
    }

    let mut reader =
        csv::Reader::from_path(path).map_err(LoadError::Csv)?;
    let mut entries = Vec::new();
    for row in reader.deserialize() {
        let row: Row = row.map_err(LoadError::Csv)?;
        entries.push((Dpid(row.dpid), PortNo(row.port), row.speed));
    }
    Ok(entries)
}

// ===== impl Logging* =====

impl Default for LoggingFile {
    fn default() -> LoggingFile {
        LoggingFile {
            enabled: false,
            dir: "/var/log".to_owned(),
            name: "helixd.log".to_owned(),
        }
    }
}

impl Default for LoggingStdout {
    fn default() -> LoggingStdout {
        LoggingStdout {
            enabled: true,
            colors: false,
        }
    }
}

// ===== impl LoadError =====

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(error) => {
                write!(f, "cannot read file: {error}")
            }
            LoadError::Toml(error) => {
                write!(f, "configuration parse error: {error}")
            }
            LoadError::Json(error) => {
                write!(f, "controller map parse error: {error}")
            }
            LoadError::Csv(error) => {
                write!(f, "port description parse error: {error}")
            }
            LoadError::MapFormat(message) => {
                write!(f, "controller map format error: {message}")
            }
        }
    }
}

impl std::error::Error for LoadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_map_parses() {
        let json = r#"{
            "root.r0": {},
            "ctrl.c1": {
                "sw": [1, 2, 3],
                "host": ["h1", "h2"],
                "extra_instances": [1, 2],
                "dom.c2": [
                    {"sw": 3, "port": 4, "sw_to": 10, "port_to": 1}
                ]
            },
            "ctrl.c2": {
                "sw": [10],
                "host": ["h9"]
            }
        }"#;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        let object = value.as_object().unwrap();

        let mut map = CtrlMap::default();
        for (key, entry) in object {
            if let Some(rid) = key.strip_prefix("root.") {
                map.roots.push(parse_id(rid, key).unwrap());
            } else if let Some(cid) = key.strip_prefix("ctrl.") {
                let cid = parse_id(cid, key).unwrap();
                map.areas.insert(cid, parse_area(key, entry).unwrap());
            }
        }

        assert_eq!(map.roots, [0]);
        assert_eq!(map.instances(1), [0, 1, 2]);
        assert_eq!(map.instances(2), [0]);
        assert_eq!(map.border_ports(1), [(Dpid(3), PortNo(4))]);
        assert_eq!(map.remote_hosts(1), ["h9"]);

        let links = map.inter_area_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].area_b, AreaId(2));
        assert_eq!(links[0].sw_b, Dpid(10));
    }

    #[test]
    fn controller_config_blocks_parse() {
        let toml_str = r#"
            [stats]
            interval = 2.0
            [te]
            utilisation_threshold = 0.85
            opti_method = "BestSolUsage"
            partial_accept = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.ctrl.validate().unwrap();
        assert_eq!(config.ctrl.stats.interval, 2.0);
        assert!(config.ctrl.te.partial_accept);
    }
}
