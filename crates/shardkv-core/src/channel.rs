//! One-slot SPSC hand-off between two worker threads
//!
//! A [`SharedChannel`] carries at most one [`Sga`] at a time from its
//! single producer to its single consumer. The slot is a
//! `crossbeam_queue::ArrayQueue` of capacity one, whose release/acquire
//! transitions publish the buffer contents along with the slot state.
//! Ownership of the payload and all of its segment buffers moves to the
//! consumer at push-success.
//!
//! Channels are created at topology-construction time and shared via
//! `Arc` between the two shared queues that wire a worker pair.

use crossbeam_queue::ArrayQueue;

use crate::sga::Sga;

/// A single-slot SPSC channel.
pub struct SharedChannel {
    slot: ArrayQueue<Sga>,
}

impl SharedChannel {
    pub fn new() -> Self {
        Self {
            slot: ArrayQueue::new(1),
        }
    }

    /// Hand `sga` to the consumer. Returns it unchanged when an element
    /// is already in flight.
    pub fn try_push(&self, sga: Sga) -> Result<(), Sga> {
        self.slot.push(sga)
    }

    /// Take the in-flight element, if any.
    pub fn try_pop(&self) -> Option<Sga> {
        self.slot.pop()
    }

    /// True when no element is in flight.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }
}

impl Default for SharedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("occupied", &!self.slot.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    fn msg(text: &'static str) -> Sga {
        Sga::from_segment(Bytes::from_static(text.as_bytes()))
    }

    #[test]
    fn test_push_pop() {
        let ch = SharedChannel::new();
        assert!(ch.is_empty());
        ch.try_push(msg("hello")).unwrap();
        assert!(!ch.is_empty());
        let got = ch.try_pop().unwrap();
        assert_eq!(got.segment(0).unwrap().as_ref(), b"hello");
        assert!(ch.try_pop().is_none());
    }

    #[test]
    fn test_full_returns_value() {
        let ch = SharedChannel::new();
        ch.try_push(msg("first")).unwrap();
        let rejected = ch.try_push(msg("second")).unwrap_err();
        assert_eq!(rejected.segment(0).unwrap().as_ref(), b"second");
        // The slot still holds the first element.
        assert_eq!(ch.try_pop().unwrap().segment(0).unwrap().as_ref(), b"first");
    }

    #[test]
    fn test_cross_thread_handoff_exactly_once() {
        const N: usize = 10_000;
        let ch = Arc::new(SharedChannel::new());

        let producer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                for i in 0..N {
                    let mut sga = msg("payload");
                    let _ = sga.push_segment(Bytes::from(i.to_le_bytes().to_vec()));
                    let mut item = sga;
                    loop {
                        match ch.try_push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        let consumer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(N);
                while seen.len() < N {
                    match ch.try_pop() {
                        Some(sga) => {
                            let mut b = [0u8; 8];
                            b.copy_from_slice(sga.segment(1).unwrap());
                            seen.push(usize::from_le_bytes(b));
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        };

        producer.join().unwrap();
        let seen = consumer.join().unwrap();
        // Every element delivered exactly once, in order.
        assert_eq!(seen, (0..N).collect::<Vec<_>>());
        assert!(ch.is_empty());
    }
}
