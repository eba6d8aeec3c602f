//! Shared-channel IO queue
//!
//! The in-process counterpart of [`crate::netq::NetworkQueue`]: the
//! same push/pop contract, but the transport is a pair of one-slot SPSC
//! channels instead of a socket. A push retries `try_push` until the
//! slot frees; a pop retries `try_pop` until an element arrives. No
//! framing is involved; the sga moves through whole, ownership and all.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use shardkv_core::{OpCode, QToken, Sga, SharedChannel};

use crate::completion::{RawCompletion, RawValue};

#[derive(Debug)]
pub(crate) struct SharedQueue {
    /// Channel this side pushes into (the peer's inbound).
    outbound: Arc<SharedChannel>,
    /// Channel this side pops from (its own inbound).
    inbound: Arc<SharedChannel>,
    push_q: VecDeque<QToken>,
    pop_q: VecDeque<QToken>,
    /// Payloads waiting for the outbound slot to free.
    pending_push: HashMap<QToken, Sga>,
    done: HashMap<QToken, RawCompletion>,
}

impl SharedQueue {
    pub fn new(outbound: Arc<SharedChannel>, inbound: Arc<SharedChannel>) -> Self {
        Self {
            outbound,
            inbound,
            push_q: VecDeque::new(),
            pop_q: VecDeque::new(),
            pending_push: HashMap::new(),
            done: HashMap::new(),
        }
    }

    pub fn enqueue_push(&mut self, qt: QToken, sga: Sga) {
        self.pending_push.insert(qt, sga);
        self.push_q.push_back(qt);
        if self.push_q.len() == 1 {
            self.process_push_side(1);
        }
    }

    pub fn enqueue_pop(&mut self, qt: QToken) {
        self.pop_q.push_back(qt);
        if self.pop_q.len() == 1 {
            self.process_pop_side(1);
        }
    }

    pub fn process(&mut self, max_requests: usize) {
        self.process_pop_side(max_requests);
        self.process_push_side(max_requests);
    }

    fn process_pop_side(&mut self, max_requests: usize) {
        for _ in 0..max_requests {
            let Some(&qt) = self.pop_q.front() else { break };
            match self.inbound.try_pop() {
                Some(sga) => {
                    self.done
                        .insert(qt, RawCompletion::ok(OpCode::Pop, RawValue::Sga(sga)));
                    self.pop_q.pop_front();
                }
                None => break,
            }
        }
    }

    fn process_push_side(&mut self, max_requests: usize) {
        for _ in 0..max_requests {
            let Some(&qt) = self.push_q.front() else { break };
            let sga = self.pending_push.remove(&qt).expect("push token has payload");
            match self.outbound.try_push(sga) {
                Ok(()) => {
                    self.done
                        .insert(qt, RawCompletion::ok(OpCode::Push, RawValue::Pushed));
                    self.push_q.pop_front();
                }
                Err(back) => {
                    // Slot still occupied; the payload stays ours.
                    self.pending_push.insert(qt, back);
                    break;
                }
            }
        }
    }

    pub fn take_completion(&mut self, qt: QToken) -> Option<RawCompletion> {
        self.done.remove(&qt)
    }

    pub fn drain_tokens(&mut self) -> Vec<(QToken, OpCode)> {
        let mut tokens: Vec<(QToken, OpCode)> = self
            .push_q
            .iter()
            .map(|qt| (*qt, OpCode::Push))
            .chain(self.pop_q.iter().map(|qt| (*qt, OpCode::Pop)))
            .collect();
        for (qt, completion) in self.done.drain() {
            tokens.push((qt, completion.opcode));
        }
        self.push_q.clear();
        self.pop_q.clear();
        self.pending_push.clear();
        tokens
    }
}
