//! Wire framing engine
//!
//! Frames carry a three-word little-endian header (magic, payload
//! bytes, segment count) followed by the payload: an 8-byte length
//! prefix and the data bytes for each segment.
//!
//! ```text
//! offset  size  field
//! 0       8     FRAME_MAGIC
//! 8       8     payload_bytes  (= sum(seg_len) + 8 * num_segments)
//! 16      8     num_segments
//! 24      ...   per segment: 8-byte seg_len, then seg_len bytes
//! ```
//!
//! The encoder and decoder are resumable state machines over a single
//! byte cursor: a would-block returns control with cursors intact and
//! the next `poll` picks up exactly where the last one stopped. Any
//! other socket error completes the operation with that error.

use std::os::fd::RawFd;

use bytes::BytesMut;
use shardkv_core::{QueueError, QueueResult, Sga, MAX_SGA_SEGMENTS};

use crate::socket;

/// First header word of every frame.
pub const FRAME_MAGIC: u64 = u64::from_le_bytes(*b"SKVFRM01");

/// Serialized header size.
pub const FRAME_HEADER_LEN: usize = 24;

/// Length prefix in front of each segment's bytes.
pub const SEG_LEN_PREFIX: usize = 8;

/// Decoder refuses frames whose payload claims more than this.
pub const MAX_FRAME_PAYLOAD: usize = 16 << 20;

/// One nonblocking read. `Ok(None)` is would-block; a zero-byte read
/// (peer EOF) aborts the operation.
fn recv_step(fd: RawFd, buf: &mut [u8]) -> QueueResult<Option<usize>> {
    match socket::recv(fd, buf) {
        Ok(0) => Err(QueueError::ConnAborted),
        Ok(n) => Ok(Some(n)),
        Err(e) => match QueueError::from(e) {
            QueueError::WouldBlock => Ok(None),
            other => Err(other),
        },
    }
}

fn send_step(fd: RawFd, buf: &[u8]) -> QueueResult<Option<usize>> {
    match socket::send(fd, buf) {
        Ok(0) => Ok(None),
        Ok(n) => Ok(Some(n)),
        Err(e) => match QueueError::from(e) {
            QueueError::WouldBlock => Ok(None),
            other => Err(other),
        },
    }
}

/// Encoder state for one in-flight push on a socket queue.
#[derive(Debug)]
pub struct PushState {
    header: [u8; FRAME_HEADER_LEN],
    sga: Sga,
    /// Cursor into the serialized stream (header + payload).
    num_bytes: usize,
    total_bytes: usize,
}

impl PushState {
    /// The header is computed here, once, from a zeroed state.
    pub fn new(sga: Sga) -> Self {
        let payload_bytes = sga.total_len() + sga.num_segments() * SEG_LEN_PREFIX;
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..8].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        header[8..16].copy_from_slice(&(payload_bytes as u64).to_le_bytes());
        header[16..24].copy_from_slice(&(sga.num_segments() as u64).to_le_bytes());
        Self {
            header,
            sga,
            num_bytes: 0,
            total_bytes: FRAME_HEADER_LEN + payload_bytes,
        }
    }

    /// Drive the write forward. `Ok(None)` means would-block;
    /// `Ok(Some(n))` completion with `n` data bytes shipped.
    pub fn poll(&mut self, fd: RawFd) -> QueueResult<Option<usize>> {
        while self.num_bytes < FRAME_HEADER_LEN {
            let at = self.num_bytes;
            match send_step(fd, &self.header[at..])? {
                Some(n) => self.num_bytes += n,
                None => return Ok(None),
            }
        }

        let mut offset = FRAME_HEADER_LEN;
        for i in 0..self.sga.num_segments() {
            let seg = self.sga.segment(i).expect("segment index in range").clone();

            if self.num_bytes < offset + SEG_LEN_PREFIX {
                let prefix = (seg.len() as u64).to_le_bytes();
                let at = self.num_bytes - offset;
                match send_step(fd, &prefix[at..])? {
                    Some(n) => self.num_bytes += n,
                    None => return Ok(None),
                }
                if self.num_bytes < offset + SEG_LEN_PREFIX {
                    return Ok(None);
                }
            }
            offset += SEG_LEN_PREFIX;

            if self.num_bytes < offset + seg.len() {
                let at = self.num_bytes - offset;
                match send_step(fd, &seg[at..])? {
                    Some(n) => self.num_bytes += n,
                    None => return Ok(None),
                }
                if self.num_bytes < offset + seg.len() {
                    return Ok(None);
                }
            }
            offset += seg.len();
        }

        debug_assert_eq!(self.num_bytes, self.total_bytes);
        Ok(Some(self.sga.total_len()))
    }
}

/// Decoder state for one in-flight pop on a socket queue.
#[derive(Debug, Default)]
pub struct PopState {
    header: [u8; FRAME_HEADER_LEN],
    /// Cursor into the serialized stream (header + payload).
    num_bytes: usize,
    /// Allocated once the header is complete and validated.
    payload: Option<BytesMut>,
    payload_len: usize,
    num_segs: usize,
}

impl PopState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the read forward. `Ok(None)` means would-block and the
    /// cursor never advances past the bytes actually delivered.
    pub fn poll(&mut self, fd: RawFd) -> QueueResult<Option<Sga>> {
        while self.num_bytes < FRAME_HEADER_LEN {
            let at = self.num_bytes;
            match recv_step(fd, &mut self.header[at..])? {
                Some(n) => self.num_bytes += n,
                None => return Ok(None),
            }
        }

        if self.payload.is_none() {
            let magic = u64::from_le_bytes(self.header[0..8].try_into().expect("header word"));
            if magic != FRAME_MAGIC {
                return Err(QueueError::BadFrame);
            }
            let payload_len =
                u64::from_le_bytes(self.header[8..16].try_into().expect("header word")) as usize;
            let num_segs =
                u64::from_le_bytes(self.header[16..24].try_into().expect("header word")) as usize;
            if payload_len > MAX_FRAME_PAYLOAD
                || num_segs > MAX_SGA_SEGMENTS
                || payload_len < num_segs * SEG_LEN_PREFIX
            {
                return Err(QueueError::BadFrame);
            }
            let mut buf = BytesMut::with_capacity(payload_len);
            buf.resize(payload_len, 0);
            self.payload = Some(buf);
            self.payload_len = payload_len;
            self.num_segs = num_segs;
        }

        while self.num_bytes < FRAME_HEADER_LEN + self.payload_len {
            let at = self.num_bytes - FRAME_HEADER_LEN;
            let buf = self.payload.as_mut().expect("payload allocated");
            match recv_step(fd, &mut buf[at..])? {
                Some(n) => self.num_bytes += n,
                None => return Ok(None),
            }
        }

        // Whole payload on hand: carve the segments out of the single
        // allocation. Segments are plain byte ranges, not C strings.
        let payload = self.payload.take().expect("payload allocated").freeze();
        let mut sga = Sga::new();
        let mut pos = 0;
        for _ in 0..self.num_segs {
            if pos + SEG_LEN_PREFIX > payload.len() {
                return Err(QueueError::BadFrame);
            }
            let seg_len =
                u64::from_le_bytes(payload[pos..pos + 8].try_into().expect("length prefix"))
                    as usize;
            pos += SEG_LEN_PREFIX;
            if pos + seg_len > payload.len() {
                return Err(QueueError::BadFrame);
            }
            sga.push_segment(payload.slice(pos..pos + seg_len))
                .map_err(|_| QueueError::BadFrame)?;
            pos += seg_len;
        }
        if pos != payload.len() {
            return Err(QueueError::BadFrame);
        }
        Ok(Some(sga))
    }
}

/// Serialize a whole frame into one buffer. Test clients and tools use
/// this; the hot path streams through [`PushState`] instead.
pub fn encode_frame(sga: &Sga) -> Vec<u8> {
    let payload_bytes = sga.total_len() + sga.num_segments() * SEG_LEN_PREFIX;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload_bytes);
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&(payload_bytes as u64).to_le_bytes());
    out.extend_from_slice(&(sga.num_segments() as u64).to_le_bytes());
    for seg in sga.segments() {
        out.extend_from_slice(&(seg.len() as u64).to_le_bytes());
        out.extend_from_slice(seg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "socketpair failed");
        (fds[0], fds[1])
    }

    fn sample_sga() -> Sga {
        [
            Bytes::from_static(b"GET foo"),
            Bytes::from_static(b""),
            Bytes::from_static(b"trailing segment with some length"),
        ]
        .into_iter()
        .collect()
    }

    fn send_all(fd: RawFd, mut buf: &[u8]) {
        while !buf.is_empty() {
            match socket::send(fd, buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let (a, b) = socketpair();
        let sga = sample_sga();

        let mut push = PushState::new(sga.clone());
        let shipped = push.poll(a).unwrap().expect("small frame completes in one poll");
        assert_eq!(shipped, sga.total_len());

        let mut pop = PopState::new();
        let got = pop.poll(b).unwrap().expect("frame fully buffered");
        assert_eq!(got, sga);

        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn test_decoder_would_block_leaves_cursor() {
        let (a, b) = socketpair();
        let mut pop = PopState::new();
        assert!(pop.poll(b).unwrap().is_none());
        assert!(pop.poll(b).unwrap().is_none());
        assert_eq!(pop.num_bytes, 0);
        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn test_decoder_resumes_across_arbitrary_splits() {
        let sga = sample_sga();
        let encoded = encode_frame(&sga);

        // Several byte-split schedules, including the 16-byte pause of
        // the mid-header scenario.
        for split in [1usize, 3, 16, 24, 25, encoded.len() - 1] {
            let (a, b) = socketpair();
            let mut pop = PopState::new();

            let mut sent = 0;
            let mut result = None;
            while sent < encoded.len() {
                let end = (sent + split).min(encoded.len());
                send_all(a, &encoded[sent..end]);
                sent = end;
                match pop.poll(b).unwrap() {
                    Some(got) => {
                        assert_eq!(sent, encoded.len(), "completed before all bytes arrived");
                        result = Some(got);
                    }
                    None => {
                        // The cursor never runs ahead of delivery.
                        assert!(pop.num_bytes <= sent);
                    }
                }
            }
            if result.is_none() {
                result = pop.poll(b).unwrap();
            }
            assert_eq!(result.expect("frame decoded"), sga, "split {split}");
            socket::close(a);
            socket::close(b);
        }
    }

    #[test]
    fn test_encoder_resumes_under_backpressure() {
        let (a, b) = socketpair();
        // Large enough to overrun the socket buffer several times.
        let big = Bytes::from(vec![0xA5u8; 4 << 20]);
        let sga: Sga = [Bytes::from_static(b"hdr"), big.clone()].into_iter().collect();

        let mut push = PushState::new(sga.clone());
        let mut pop = PopState::new();
        let mut pushed = None;
        let mut popped = None;
        let mut saw_partial_write = false;
        while pushed.is_none() || popped.is_none() {
            if pushed.is_none() {
                match push.poll(a).unwrap() {
                    Some(n) => pushed = Some(n),
                    None => saw_partial_write = true,
                }
            }
            if popped.is_none() {
                if let Some(got) = pop.poll(b).unwrap() {
                    popped = Some(got);
                }
            }
        }
        assert!(saw_partial_write, "frame fit in the socket buffer; grow it");
        assert_eq!(pushed.unwrap(), sga.total_len());
        assert_eq!(popped.unwrap(), sga);
        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn test_bad_magic_is_bad_frame() {
        let (a, b) = socketpair();
        let mut encoded = encode_frame(&sample_sga());
        encoded[0] ^= 0xFF;
        send_all(a, &encoded);

        let mut pop = PopState::new();
        assert_eq!(pop.poll(b).unwrap_err(), QueueError::BadFrame);
        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn test_oversized_payload_is_bad_frame() {
        let (a, b) = socketpair();
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..8].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        header[8..16].copy_from_slice(&((MAX_FRAME_PAYLOAD as u64 + 1).to_le_bytes()));
        header[16..24].copy_from_slice(&1u64.to_le_bytes());
        send_all(a, &header);

        let mut pop = PopState::new();
        assert_eq!(pop.poll(b).unwrap_err(), QueueError::BadFrame);
        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn test_truncated_segment_table_is_bad_frame() {
        let (a, b) = socketpair();
        // Claims one segment of 100 bytes but the payload only has room
        // for the length prefix plus 4 bytes.
        let mut out = Vec::new();
        out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        out.extend_from_slice(&12u64.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes());
        out.extend_from_slice(&100u64.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        send_all(a, &out);

        let mut pop = PopState::new();
        assert_eq!(pop.poll(b).unwrap_err(), QueueError::BadFrame);
        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn test_eof_mid_frame_aborts() {
        let (a, b) = socketpair();
        let encoded = encode_frame(&sample_sga());
        send_all(a, &encoded[..10]);
        socket::close(a);

        let mut pop = PopState::new();
        assert_eq!(pop.poll(b).unwrap_err(), QueueError::ConnAborted);
        socket::close(b);
    }

    #[test]
    fn test_empty_frame_round_trips() {
        let (a, b) = socketpair();
        let sga = Sga::new();
        let mut push = PushState::new(sga.clone());
        assert_eq!(push.poll(a).unwrap(), Some(0));

        let mut pop = PopState::new();
        let got = pop.poll(b).unwrap().expect("empty frame decodes");
        assert_eq!(got, sga);
        socket::close(a);
        socket::close(b);
    }
}
