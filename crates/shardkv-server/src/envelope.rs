//! Request/response envelopes
//!
//! What crosses the shared channels between the network worker and the
//! store workers is still an ordinary sga; the envelope is a framing
//! convention on top of it. Segment 0 carries the originating client
//! queue descriptor as 8 little-endian bytes, the remaining segments
//! are the request or response payload, moved rather than copied in
//! and out. Ownership travels with the sga, so a response installed
//! into an outbound message simply cannot be freed twice.

use bytes::Bytes;
use shardkv_core::{QueueError, QueueResult, Sga};
use shardkv_queue::Qd;

fn qd_segment(qd: Qd) -> Bytes {
    Bytes::copy_from_slice(&(qd.as_raw() as u64).to_le_bytes())
}

fn qd_from_segment(seg: &Bytes) -> QueueResult<Qd> {
    let raw: [u8; 8] = seg.as_ref().try_into().map_err(|_| QueueError::BadFrame)?;
    Ok(Qd::from_raw(u64::from_le_bytes(raw) as u32))
}

/// A client request on its way to a store worker.
#[derive(Debug)]
pub struct KvRequest {
    /// Queue descriptor of the originating client connection, in the
    /// network worker's service unit. Replies are correlated by this
    /// field, not by ordering.
    pub client_qd: Qd,
    /// The decoded request payload, as popped from the socket.
    pub sga: Sga,
}

impl KvRequest {
    pub fn into_sga(self) -> QueueResult<Sga> {
        let mut out = Sga::from_segment(qd_segment(self.client_qd));
        for seg in self.sga.into_segments() {
            out.push_segment(seg).map_err(|_| QueueError::BadFrame)?;
        }
        Ok(out)
    }

    pub fn from_sga(sga: Sga) -> QueueResult<Self> {
        let mut segs = sga.into_segments();
        let head = segs.next().ok_or(QueueError::BadFrame)?;
        let client_qd = qd_from_segment(&head)?;
        Ok(Self {
            client_qd,
            sga: segs.collect(),
        })
    }
}

/// A store worker's reply on its way back to the client socket.
#[derive(Debug)]
pub struct KvResponse {
    pub client_qd: Qd,
    pub body: Bytes,
}

impl KvResponse {
    pub fn into_sga(self) -> QueueResult<Sga> {
        let mut out = Sga::from_segment(qd_segment(self.client_qd));
        out.push_segment(self.body).map_err(|_| QueueError::BadFrame)?;
        Ok(out)
    }

    pub fn from_sga(sga: Sga) -> QueueResult<Self> {
        let mut segs = sga.into_segments();
        let head = segs.next().ok_or(QueueError::BadFrame)?;
        let client_qd = qd_from_segment(&head)?;
        let body = segs.next().ok_or(QueueError::BadFrame)?;
        if segs.next().is_some() {
            return Err(QueueError::BadFrame);
        }
        Ok(Self { client_qd, body })
    }
}
