use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use sluice::Runtime;
use sluice_ctl::{config::Config, server::ControlServer};
use sluice_utils::install_wakeup_handler;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sluice-ctl", about = "VLBI data-movement engine control daemon")]
struct Args {
    /// JSON configuration file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control socket port.
    #[arg(long)]
    port: Option<u16>,

    /// Directory whose disk<N> entries are the storage mountpoints.
    #[arg(long)]
    rootdir: Option<PathBuf>,

    /// Explicit mountpoint (repeatable), used instead of --rootdir.
    #[arg(long = "mount")]
    mounts: Vec<PathBuf>,

    /// 0 = warnings only, 1 = info, 2 = debug, 3 = trace.
    #[arg(long)]
    debug: Option<u8>,

    /// Upper bound on each transfer's blockpool, in MiB.
    #[arg(long)]
    pool_cap_mib: Option<usize>,
}

const DEFAULT_PORT: u16 = 2620;
const DEFAULT_POOL_CAP_MIB: usize = 512;

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match args.config.as_deref().map(Config::load).transpose() {
        Ok(c) => c.unwrap_or_default(),
        Err(e) => {
            eprintln!("configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let debug = args.debug.or(config.debug).unwrap_or(0);
    init_logging(debug);

    // anything escaping a thread unhandled must not look like a clean exit
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(2);
    }));

    match run(&args, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("initialisation failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

fn run(args: &Args, config: &Config) -> Result<(), String> {
    // without this, cancelling a stage blocked in a syscall would hang
    // forever; refusing to start beats deadlocking later
    install_wakeup_handler().map_err(|e| format!("wakeup signal handler: {e}"))?;

    let pool_cap_mib =
        args.pool_cap_mib.or(config.pool_cap_mib).unwrap_or(DEFAULT_POOL_CAP_MIB);
    let rte = Arc::new(Runtime::new(pool_cap_mib * 1024 * 1024));

    let mounts =
        if args.mounts.is_empty() { config.mounts.clone() } else { args.mounts.clone() };
    if !mounts.is_empty() {
        rte.vbs
            .init_explicit(mounts)
            .map_err(|e| format!("mountpoints: {e}"))?;
    } else if let Some(root) = args.rootdir.as_ref().or(config.rootdir.as_ref()) {
        rte.vbs.init(root).map_err(|e| format!("mountpoints: {e}"))?;
    } else {
        info!("no mountpoints configured; disk transfers will refuse to start");
    }

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register(sig, Arc::clone(&stop))
            .map_err(|e| format!("signal handler: {e}"))?;
    }

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let server = ControlServer::bind(port).map_err(|e| format!("port {port}: {e}"))?;
    server.serve(&rte, &stop);

    // a transfer still running at shutdown is cancelled, not drained
    if let Some(mut active) = rte.take_active() {
        info!(mode = %active.mode, "cancelling transfer for shutdown");
        let _ = active.chain.cancel();
    }
    info!("clean shutdown");
    Ok(())
}
