//! shardkvd — sharded in-memory KV server
//!
//! One network thread accepts framed TCP requests and fans them out to
//! store workers over in-process channels; each worker answers from the
//! seeded, frozen KV map.
//!
//! Usage:
//!     shardkvd --port 12345 --cmd-file seed.cmds -w 4 -c KEY
//!
//! Test with:
//!     printf 'PUT foo bar\n' > seed.cmds
//!     ./target/release/shardkvd --cmd-file seed.cmds &
//!     # then speak the frame format on 127.0.0.1:12345

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use shardkv_server::{
    launch, register_peers, KvStore, NetWorker, Policy, ServerConfig, StoreWorker, Topology,
    Worker,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChoiceArg {
    #[value(name = "RR")]
    Rr,
    #[value(name = "KEY")]
    Key,
}

impl From<ChoiceArg> for Policy {
    fn from(choice: ChoiceArg) -> Self {
        match choice {
            ChoiceArg::Rr => Policy::RoundRobin,
            ChoiceArg::Key => Policy::FirstKeyDigit,
        }
    }
}

/// KV server options
#[derive(Debug, Parser)]
#[command(name = "shardkvd", version, about = "Sharded in-memory KV server")]
struct Args {
    /// Server IP
    #[arg(long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    /// Server port
    #[arg(long, default_value_t = 12345)]
    port: u16,

    /// Initial commands
    #[arg(long = "cmd-file")]
    cmd_file: Option<PathBuf>,

    /// Experiment log directory
    #[arg(long = "log-dir", short = 'L', default_value = "./")]
    log_dir: PathBuf,

    /// Number of store workers
    #[arg(long, short = 'w', default_value_t = 1)]
    workers: usize,

    /// Turn on latency recording
    #[arg(long = "record-lat", short = 'r')]
    record_lat: bool,

    /// Worker choice function (RR or KEY)
    #[arg(long, short = 'c', value_enum, default_value = "RR")]
    choice: ChoiceArg,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version exit clean; bad arguments exit 1.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::new()
        .ip(args.ip)
        .port(args.port)
        .cmd_file(args.cmd_file)
        .log_dir(args.log_dir)
        .workers(args.workers)
        .record_latencies(args.record_lat)
        .policy(args.choice.into());
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::from(1);
    }

    match run(config) {
        Ok(()) => {
            info!("execution complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server failed: {e}");
            // The unsigned rendering of -1.
            ExitCode::from(255)
        }
    }
}

fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "launching kv store on {} ({} workers, {} policy)",
        config.bind_addr(),
        config.workers,
        config.policy
    );

    let store = Arc::new(KvStore::load(config.cmd_file.as_deref()));
    info!("store seeded with {} entries", store.len());

    let mut net = NetWorker::new(config.bind_addr(), config.policy, config.latency_log_path());
    let mut store_workers = Vec::with_capacity(config.workers);
    for id in 1..=config.workers {
        let mut worker = StoreWorker::new(id as u32, Arc::clone(&store));
        register_peers(net.core_mut(), worker.core_mut());
        store_workers.push(worker);
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let mut topology = Topology::new();
    topology.add(launch(net)?);
    for worker in store_workers {
        match launch(worker) {
            Ok(handle) => topology.add(handle),
            Err(e) => {
                topology.stop_all();
                let _ = topology.join_all();
                return Err(e.into());
            }
        }
    }

    while !SHUTDOWN.load(Ordering::Relaxed) && !topology.any_exited() {
        thread::sleep(Duration::from_millis(50));
    }

    topology.stop_all();
    topology.join_all()?;
    Ok(())
}
