//! Server configuration

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use crate::dispatch::Policy;

/// Hard cap on store workers; ids above this make no sense on any
/// machine this runs on.
pub const MAX_STORE_WORKERS: usize = 64;

/// Configuration for one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the network worker binds to.
    pub ip: Ipv4Addr,
    pub port: u16,

    /// Seed command file replayed into the store before launch.
    pub cmd_file: Option<PathBuf>,

    /// Directory latency traces are dumped into.
    pub log_dir: PathBuf,

    /// Number of store workers (ids 1..=workers).
    pub workers: usize,

    /// Record per-request entry/exit timestamps.
    pub record_latencies: bool,

    /// Request-to-worker dispatch policy.
    pub policy: Policy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::LOCALHOST,
            port: 12345,
            cmd_file: None,
            log_dir: PathBuf::from("./"),
            workers: 1,
            record_latencies: false,
            policy: Policy::RoundRobin,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = ip;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn cmd_file(mut self, path: Option<PathBuf>) -> Self {
        self.cmd_file = path;
        self
    }

    pub fn log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = dir;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn record_latencies(mut self, enable: bool) -> Self {
        self.record_latencies = enable;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Where the network worker dumps its trace, when recording is on.
    pub fn latency_log_path(&self) -> Option<PathBuf> {
        self.record_latencies.then(|| self.log_dir.join("net_traces"))
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.workers == 0 {
            return Err("workers must be at least 1");
        }
        if self.workers > MAX_STORE_WORKERS {
            return Err("workers exceeds maximum");
        }
        Ok(())
    }
}
