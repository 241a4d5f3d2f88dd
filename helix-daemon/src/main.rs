//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod config;
mod southbound;

use clap::{Arg, Command};
use config::{Config, CtrlMap};
use helix_ctrl::instance::Instance;
use helix_ctrl::tasks::messages::input::ProtocolMsg;
use helix_root::instance::Root;
use helix_root::tasks::messages::input::RootMsg;
use helix_utils::bus::{Bus, BusAddr};
use helix_utils::task::Task;
use helix_utils::{AreaId, InstanceId, UnboundedSender};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

// Exit codes: 0 clean, 1 configuration error, 2 bus failure, 3 invariant
// violation.
const EXIT_CONFIG: i32 = 1;

fn init_tracing(config: &config::Logging) {
    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let appender = tracing_appender::rolling::never(
            &config.file.dir,
            &config.file.name,
        );
        tracing_subscriber::fmt::layer()
            .with_writer(appender)
            .with_target(false)
            .with_ansi(false)
    });

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(config.stdout.colors)
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("helix=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file)
        .with(stdout)
        .init();
}

fn fatal_config(error: impl std::fmt::Display) -> ! {
    eprintln!("helixd: configuration error: {error}");
    std::process::exit(EXIT_CONFIG);
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = Command::new("Helix SDN controller daemon")
        .version(clap::crate_version!())
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .arg(
            Arg::new("map")
                .short('m')
                .long("map")
                .value_name("file")
                .required(true)
                .help("Switch-to-controller map (JSON)."),
        )
        .arg(
            Arg::new("ctrl")
                .long("ctrl")
                .value_name("cid")
                .help("Run only the given area's instances."),
        )
        .arg(
            Arg::new("instance")
                .long("instance")
                .value_name("id")
                .help("Run only the given instance of --ctrl."),
        )
        .get_matches();

    // Read configuration files. Any error here is fatal (exit code 1).
    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(Config::DFLT_FILEPATH);
    let config = match Config::load(config_file) {
        Ok(config) => config,
        Err(error) => fatal_config(error),
    };
    if let Err(error) = config.ctrl.validate() {
        fatal_config(error);
    }
    let map_file = matches.get_one::<String>("map").unwrap();
    let map = match CtrlMap::load(map_file) {
        Ok(map) => map,
        Err(error) => fatal_config(error),
    };
    let port_desc = match &config.ctrl.application.static_port_desc {
        Some(path) => match config::load_port_desc(path) {
            Ok(entries) => entries,
            Err(error) => fatal_config(error),
        },
        None => Vec::new(),
    };

    let only_ctrl: Option<u32> = matches
        .get_one::<String>("ctrl")
        .map(|cid| match cid.trim_start_matches('c').parse() {
            Ok(cid) => cid,
            Err(_) => fatal_config(format!("invalid --ctrl {cid:?}")),
        });
    let only_instance: Option<u32> = matches
        .get_one::<String>("instance")
        .map(|id| match id.parse() {
            Ok(id) => id,
            Err(_) => fatal_config(format!("invalid --instance {id:?}")),
        });

    // Initialize tracing.
    init_tracing(&config.logging);

    // Abort the process if any child task panics.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    info!("starting up");

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(run(config, map, port_desc, only_ctrl, only_instance));
    std::process::exit(exit_code);
}

async fn run(
    config: Config,
    map: CtrlMap,
    port_desc: Vec<(helix_utils::Dpid, helix_utils::PortNo, u64)>,
    only_ctrl: Option<u32>,
    only_instance: Option<u32>,
) -> i32 {
    let bus = Bus::new();
    let mut ctrl_txs: Vec<UnboundedSender<ProtocolMsg>> = Vec::new();
    let mut root_txs: Vec<UnboundedSender<RootMsg>> = Vec::new();
    let mut tasks: Vec<Task<i32>> = Vec::new();
    let mut sinks = Vec::new();

    // Root controllers.
    for rid in &map.roots {
        if only_ctrl.is_some() {
            continue;
        }
        let (handle, bus_rx) = bus.join(BusAddr::Root(*rid));
        let (root, proto_rx) =
            Root::new(*rid, handle, map.inter_area_links());
        root_txs.push(root.proto_tx.clone());
        tasks.push(Task::spawn(root.run(proto_rx, bus_rx)));
    }

    // Local-controller instances.
    for (cid, _area) in &map.areas {
        if only_ctrl.is_some_and(|only| only != *cid) {
            continue;
        }
        for inst in map.instances(*cid) {
            if only_instance.is_some_and(|only| only != inst) {
                continue;
            }
            let mut ctrl_cfg = config.ctrl.clone();
            ctrl_cfg.multi_ctrl.domain_id = *cid;

            let (bus_handle, bus_rx) = if ctrl_cfg.multi_ctrl.start_com {
                let (handle, rx) = bus.join(BusAddr::Instance(
                    AreaId(*cid),
                    InstanceId(inst),
                ));
                (Some(handle), Some(rx))
            } else {
                (None, None)
            };

            let (sb_tx, sb_rx) = mpsc::unbounded_channel();
            let (mut instance, proto_rx) = Instance::new(
                AreaId(*cid),
                InstanceId(inst),
                ctrl_cfg,
                sb_tx,
                bus_handle,
            );
            sinks.push(southbound::spawn_sink(
                instance.name.clone(),
                sb_rx,
            ));
            instance.set_static_port_speeds(port_desc.iter().copied());
            instance.set_inter_area_links(map.border_ports(*cid));
            instance.declare_remote_hosts(map.remote_hosts(*cid));

            ctrl_txs.push(instance.proto_tx.clone());
            tasks.push(Task::spawn(instance.run(proto_rx, bus_rx)));
        }
    }

    if tasks.is_empty() {
        error!("nothing to run for the given --ctrl/--instance");
        return EXIT_CONFIG;
    }

    // SIGUSR1 dumps snapshots; SIGTERM shuts everything down orderly.
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).expect("signal handler");
    let mut sigterm =
        signal(SignalKind::terminate()).expect("signal handler");
    loop {
        tokio::select! {
            _ = sigusr1.recv() => {
                for tx in &ctrl_txs {
                    let _ = tx.send(ProtocolMsg::Snapshot);
                }
            }
            _ = sigterm.recv() => {
                info!("shutting down");
                for tx in &ctrl_txs {
                    let _ = tx.send(ProtocolMsg::Shutdown);
                }
                for tx in &root_txs {
                    let _ = tx.send(RootMsg::Shutdown);
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                for tx in &ctrl_txs {
                    let _ = tx.send(ProtocolMsg::Shutdown);
                }
                for tx in &root_txs {
                    let _ = tx.send(RootMsg::Shutdown);
                }
                break;
            }
        }
    }

    // The worst child exit code becomes the process exit code.
    let mut exit_code = 0;
    for task in tasks {
        if let Ok(code) = task.await {
            exit_code = exit_code.max(code);
        }
    }
    exit_code
}
