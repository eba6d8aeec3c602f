//! Store worker
//!
//! Shared-category worker (id >= 1). Keeps one pop outstanding on its
//! channel from the network worker; for every request envelope it runs
//! the KV engine and pushes a response envelope back.

use std::sync::Arc;

use bytes::Bytes;
use shardkv_core::{QToken, QueueError, QueueResult};
use shardkv_queue::service::{QResult, QValue, Qd};
use tracing::{debug, warn};

use crate::envelope::{KvRequest, KvResponse};
use crate::store::KvStore;
use crate::worker::{Worker, WorkerCore, WorkerId, NET_WORKER_ID};

pub struct StoreWorker {
    core: WorkerCore,
    store: Arc<KvStore>,
    net_qd: Option<Qd>,
    pop_token: Option<QToken>,
}

impl StoreWorker {
    pub fn new(id: WorkerId, store: Arc<KvStore>) -> Self {
        debug_assert_ne!(id, NET_WORKER_ID, "id 0 belongs to the network worker");
        Self {
            core: WorkerCore::new(id),
            store,
            net_qd: None,
            pop_token: None,
        }
    }

    fn serve(&mut self, request: KvRequest) -> QueueResult<()> {
        let mut text = Vec::with_capacity(request.sga.total_len());
        for seg in request.sga.segments() {
            text.extend_from_slice(seg);
        }
        let text = String::from_utf8_lossy(&text);
        debug!("worker {}: request {text:?}", self.core.id());

        let reply = self.store.process(&text);
        let response = KvResponse {
            client_qd: request.client_qd,
            body: Bytes::from(reply.into_bytes()),
        };
        self.core.push_to_peer(NET_WORKER_ID, response.into_sga()?)
    }
}

impl Worker for StoreWorker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WorkerCore {
        &mut self.core
    }

    fn setup(&mut self) -> QueueResult<()> {
        // The network worker must be registered before launch.
        let net_qd = self.core.peer_qd(NET_WORKER_ID).ok_or(QueueError::NoPeer)?;
        self.net_qd = Some(net_qd);
        self.pop_token = Some(self.core.unit.pop(net_qd)?);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<QResult> {
        let qt = self.pop_token?;
        let result = self.core.unit.try_wait(qt)?;
        // Re-arm before serving so the channel never sits idle.
        let net_qd = self.net_qd.expect("setup recorded the channel");
        match self.core.unit.pop(net_qd) {
            Ok(next) => self.pop_token = Some(next),
            Err(e) => {
                warn!("worker {}: could not re-arm pop: {e}", self.core.id());
                self.pop_token = None;
            }
        }
        Some(result)
    }

    fn work(&mut self, result: QResult) -> QueueResult<()> {
        match result.value {
            Ok(QValue::Sga(sga)) => {
                let request = KvRequest::from_sga(sga)?;
                self.serve(request)
            }
            Ok(other) => {
                warn!("worker {}: unexpected completion {other:?}", self.core.id());
                Ok(())
            }
            Err(e) => {
                warn!("worker {}: dequeue failed: {e}", self.core.id());
                Ok(())
            }
        }
    }
}
