//! Scatter-gather payloads
//!
//! An [`Sga`] is an ordered list of byte-range segments treated as one
//! logical message. Segments are `bytes::Bytes`, so a decoded frame can
//! hand out all of its segments as slices of a single payload
//! allocation; the allocation is released when the last slice drops.
//! Independently built segments own their buffers independently.

use bytes::Bytes;

/// Upper bound on the number of segments a single message may carry.
pub const MAX_SGA_SEGMENTS: usize = 16;

/// An ordered sequence of byte-range segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sga {
    segs: Vec<Bytes>,
}

impl Sga {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self {
            segs: Vec::with_capacity(1),
        }
    }

    /// Create a payload holding a single segment.
    pub fn from_segment(seg: Bytes) -> Self {
        Self { segs: vec![seg] }
    }

    /// Append a segment, handing it back if the payload is already at
    /// [`MAX_SGA_SEGMENTS`].
    pub fn push_segment(&mut self, seg: Bytes) -> Result<(), Bytes> {
        if self.segs.len() >= MAX_SGA_SEGMENTS {
            return Err(seg);
        }
        self.segs.push(seg);
        Ok(())
    }

    /// Number of segments.
    #[inline]
    pub fn num_segments(&self) -> usize {
        self.segs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Total payload bytes across all segments (length prefixes and
    /// headers excluded).
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len()).sum()
    }

    /// Borrow segment `idx`, if present.
    #[inline]
    pub fn segment(&self, idx: usize) -> Option<&Bytes> {
        self.segs.get(idx)
    }

    /// Iterate over the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segs.iter()
    }

    /// Consume the payload, yielding its segments in order.
    pub fn into_segments(self) -> impl Iterator<Item = Bytes> {
        self.segs.into_iter()
    }
}

impl FromIterator<Bytes> for Sga {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        Self {
            segs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_segment() {
        let sga = Sga::from_segment(Bytes::from_static(b"GET foo"));
        assert_eq!(sga.num_segments(), 1);
        assert_eq!(sga.total_len(), 7);
        assert_eq!(sga.segment(0).unwrap().as_ref(), b"GET foo");
        assert!(sga.segment(1).is_none());
    }

    #[test]
    fn test_segment_cap() {
        let mut sga = Sga::new();
        for _ in 0..MAX_SGA_SEGMENTS {
            sga.push_segment(Bytes::from_static(b"x")).unwrap();
        }
        let rejected = sga.push_segment(Bytes::from_static(b"overflow"));
        assert_eq!(rejected.unwrap_err().as_ref(), b"overflow");
        assert_eq!(sga.num_segments(), MAX_SGA_SEGMENTS);
    }

    #[test]
    fn test_segments_share_one_allocation() {
        // Slicing one Bytes does not copy; all slices point into the
        // same backing buffer, mirroring a decoded frame.
        let payload = Bytes::from(vec![1u8, 2, 3, 4, 5, 6]);
        let sga: Sga = [payload.slice(0..2), payload.slice(2..6)]
            .into_iter()
            .collect();
        assert_eq!(sga.total_len(), 6);
        assert_eq!(sga.segment(0).unwrap().as_ref(), &[1, 2]);
        assert_eq!(sga.segment(1).unwrap().as_ref(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_into_segments_moves() {
        let sga: Sga = [Bytes::from_static(b"a"), Bytes::from_static(b"b")]
            .into_iter()
            .collect();
        let segs: Vec<Bytes> = sga.into_segments().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[1].as_ref(), b"b");
    }
}
