use std::process::ExitCode;

use telescope_multiplexer::config::{self, Config};
use telescope_multiplexer::control::{signals, ControlFlags};
use telescope_multiplexer::orchestrator::{Orchestrator, StreamParams};
use telescope_multiplexer::stats::{spawn_dumper, NamedStats};

const STREAM_COUNT: u16 = 4;
const RING_CAPACITY: usize = 1 << 20;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match config::parse_cli(args) {
        Ok(cli) => cli,
        Err(reason) => {
            eprintln!("telescope-multiplexer: {}", reason);
            eprintln!("{}", config::USAGE);
            return ExitCode::from(1);
        }
    };

    if cli.help {
        println!("{}", config::USAGE);
        return ExitCode::SUCCESS;
    }

    let mut cfg = match &cli.configfile {
        Some(path) => match Config::load_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("telescope-multiplexer: {}", e);
                return ExitCode::from(1);
            }
        },
        None => Config::default(),
    };
    cfg.apply_cli(&cli);

    log::info!(
        "starting: device={} monitorid={} group={}:{} mtu={}",
        cfg.dagdev,
        cfg.monitorid,
        cfg.mcastaddr,
        cfg.mcastport,
        cfg.mtu
    );

    let flags = ControlFlags::new();
    signals::install(flags.clone());

    let streams: Vec<StreamParams> = (0..STREAM_COUNT)
        .map(|i| StreamParams {
            stream_index: i * 2,
            color: 1u8 << (i % 8),
            ring_capacity: RING_CAPACITY,
        })
        .collect();

    let (orchestrator, stream_stats) = Orchestrator::spawn(cfg.clone(), streams, flags.clone());

    let dumper = cfg.statdir.clone().map(|dir| {
        let named = stream_stats
            .iter()
            .map(|(label, stats)| NamedStats {
                label: label.clone(),
                stats: stats.clone(),
            })
            .collect();
        spawn_dumper(named, dir, cfg.statinterval, flags.clone())
    });

    orchestrator.join();
    if let Some(Some(handle)) = dumper {
        let _ = handle.join();
    }

    log::info!("shut down cleanly");
    ExitCode::SUCCESS
}
