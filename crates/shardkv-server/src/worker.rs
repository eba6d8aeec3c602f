//! Worker runtime
//!
//! A worker is one OS thread driving a setup/dequeue/work loop over its
//! private service unit:
//!
//! ```text
//! launch -> setup() -> loop { dequeue() -> work() } while !terminate -> exit
//! ```
//!
//! Workers are wired together before launch: `register_peers` allocates
//! one inbound channel per side and gives each worker a shared queue
//! whose outbound endpoint is the peer's inbound. The only cross-thread
//! state after launch is those channels plus the lifecycle flags.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use shardkv_core::{QToken, QueueError, QueueResult, Sga, SharedChannel};
use shardkv_queue::service::{QResult, Qd, ServiceUnit};
use tracing::{debug, error, info, warn};

use crate::pin;

pub type WorkerId = u32;

/// The network worker always has id 0; store workers count up from 1.
pub const NET_WORKER_ID: WorkerId = 0;

/// One thread of the topology.
pub trait Worker: Send + 'static {
    fn core(&self) -> &WorkerCore;

    fn core_mut(&mut self) -> &mut WorkerCore;

    fn id(&self) -> WorkerId {
        self.core().id()
    }

    /// Runs once on the worker thread before the loop.
    fn setup(&mut self) -> QueueResult<()>;

    /// Wait for one completion; `None` when nothing is ready yet.
    fn dequeue(&mut self) -> Option<QResult>;

    /// Process one completion.
    fn work(&mut self, result: QResult) -> QueueResult<()>;

    /// Runs once on the worker thread after the loop exits.
    fn teardown(&mut self) {}
}

/// State every worker carries: its service unit and the peer wiring.
#[derive(Debug)]
pub struct WorkerCore {
    id: WorkerId,
    pub unit: ServiceUnit,
    peer_ids: Vec<WorkerId>,
    id_to_qd: HashMap<WorkerId, Qd>,
    qd_to_id: HashMap<Qd, WorkerId>,
    /// Inbound endpoints this worker allocated; kept so the channels
    /// outlive both endpoint queues.
    channels: Vec<Arc<SharedChannel>>,
    /// Set by the lifecycle handle; also observed inside synchronous
    /// peer pushes so a worker cannot outlive `stop_all` spinning on a
    /// full channel whose consumer is gone.
    terminate: Arc<AtomicBool>,
}

impl WorkerCore {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            unit: ServiceUnit::new(),
            peer_ids: Vec::new(),
            id_to_qd: HashMap::new(),
            qd_to_id: HashMap::new(),
            channels: Vec::new(),
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    #[inline]
    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    pub fn peer_ids(&self) -> &[WorkerId] {
        &self.peer_ids
    }

    pub fn peer_qd(&self, peer_id: WorkerId) -> Option<Qd> {
        self.id_to_qd.get(&peer_id).copied()
    }

    pub fn peer_id(&self, qd: Qd) -> Option<WorkerId> {
        self.qd_to_id.get(&qd).copied()
    }

    fn generate_channel(&mut self) -> Arc<SharedChannel> {
        let channel = Arc::new(SharedChannel::new());
        self.channels.push(Arc::clone(&channel));
        channel
    }

    fn register_peer(
        &mut self,
        peer_id: WorkerId,
        outbound: Arc<SharedChannel>,
        inbound: Arc<SharedChannel>,
    ) {
        let qd = self.unit.shared_queue(outbound, inbound);
        debug!("worker {}: peer {peer_id} is at {qd}", self.id);
        self.id_to_qd.insert(peer_id, qd);
        self.qd_to_id.insert(qd, peer_id);
        self.peer_ids.push(peer_id);
    }

    /// Push to a peer and wait for the hand-off to land. Gives up with
    /// `Aborted` if termination is requested while the slot stays full.
    pub fn push_to_peer(&mut self, peer_id: WorkerId, sga: Sga) -> QueueResult<()> {
        let qd = self.peer_qd(peer_id).ok_or(QueueError::NoPeer)?;
        let qt = self.unit.push(qd, sga)?;
        loop {
            if let Some(result) = self.unit.try_wait(qt) {
                return result.value.map(|_| ());
            }
            if self.should_terminate() {
                return Err(QueueError::Aborted);
            }
            std::hint::spin_loop();
        }
    }

    /// Arm a pop on the channel from a peer.
    pub fn pop_from_peer(&mut self, peer_id: WorkerId) -> QueueResult<QToken> {
        let qd = self.peer_qd(peer_id).ok_or(QueueError::NoPeer)?;
        self.unit.pop(qd)
    }
}

/// Wire two workers together with a pair of directed channels: each
/// side pops its own inbound and pushes the peer's.
pub fn register_peers(a: &mut WorkerCore, b: &mut WorkerCore) {
    let a_inbound = a.generate_channel();
    let b_inbound = b.generate_channel();
    a.register_peer(b.id(), Arc::clone(&b_inbound), Arc::clone(&a_inbound));
    b.register_peer(a.id(), a_inbound, b_inbound);
}

/// Main-thread handle to a launched worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    thread: Option<JoinHandle<QueueResult<()>>>,
    terminate: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl WorkerHandle {
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Ask the worker to leave its loop. Idempotent.
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn join(&mut self) -> QueueResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result,
            Err(_) => {
                error!("worker {} panicked", self.id);
                Err(QueueError::Io(libc::EIO))
            }
        }
    }
}

fn run<W: Worker>(worker: &mut W, started: &AtomicBool) -> QueueResult<()> {
    worker.setup()?;
    started.store(true, Ordering::Release);
    info!("worker {} started", worker.id());
    while !worker.core().should_terminate() {
        match worker.dequeue() {
            Some(result) => {
                if let Err(e) = worker.work(result) {
                    // Failures caused by the shutdown itself are not
                    // worth a worker obituary.
                    if worker.core().should_terminate() {
                        break;
                    }
                    return Err(e);
                }
            }
            None => thread::yield_now(),
        }
    }
    Ok(())
}

/// Spawn the worker thread and block until it either enters its loop or
/// fails setup.
pub fn launch<W: Worker>(mut worker: W) -> io::Result<WorkerHandle> {
    let id = worker.id();
    let terminate = worker.core().terminate_flag();
    let started = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));

    let thread = {
        let started = Arc::clone(&started);
        let exited = Arc::clone(&exited);
        thread::Builder::new()
            .name(format!("shardkv-worker-{id}"))
            .spawn(move || {
                if let Err(e) = pin::pin_current_thread(id as usize) {
                    warn!("worker {id}: could not pin thread: {e}");
                }
                let result = run(&mut worker, &started);
                worker.teardown();
                if let Err(e) = &result {
                    error!("worker {id} failed: {e}");
                }
                exited.store(true, Ordering::Release);
                info!("worker {id} terminating");
                result
            })?
    };

    while !started.load(Ordering::Acquire) && !exited.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(1));
    }
    if exited.load(Ordering::Acquire) && !started.load(Ordering::Acquire) {
        let _ = thread.join();
        return Err(io::Error::other(format!("worker {id} failed to initialize")));
    }

    Ok(WorkerHandle {
        id,
        thread: Some(thread),
        terminate,
        started,
        exited,
    })
}

/// Owns every launched worker of one server instance.
#[derive(Debug, Default)]
pub struct Topology {
    handles: Vec<WorkerHandle>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: WorkerHandle) {
        self.handles.push(handle);
    }

    pub fn stop_all(&self) {
        debug!("stopping all workers");
        for handle in &self.handles {
            handle.stop();
        }
    }

    pub fn any_exited(&self) -> bool {
        self.handles.iter().any(WorkerHandle::has_exited)
    }

    /// Join every worker; the first failure is reported after all
    /// threads are down.
    pub fn join_all(&mut self) -> QueueResult<()> {
        let mut first_err = Ok(());
        for handle in &mut self.handles {
            let result = handle.join();
            if result.is_err() && first_err.is_ok() {
                first_err = result;
            }
        }
        first_err
    }
}
