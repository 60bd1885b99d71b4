use std::collections::BTreeMap;
use bytes::Bytes;
use crate::codec::sequence::SequenceNumber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk closed the gap: `writable` are the now-contiguous payloads starting with the
    ///  received chunk, to be written in this order and then acknowledged with `ack`.
    InOrder { writable: Vec<Bytes>, ack: SequenceNumber },
    /// The chunk is ahead of the next expected one and was buffered (unless it was buffered
    ///  already). `ack` re-confirms the last written chunk, if there is one.
    Ahead { ack: Option<SequenceNumber>, duplicate: bool },
    /// The chunk was written before. It is acknowledged again since the peer apparently missed
    ///  the previous ACK.
    Duplicate { ack: SequenceNumber },
    /// The chunk is further ahead than the sender's window allows, or past the end of the file.
    ///  It is discarded.
    OutOfRange,
}

/// The receiver's reconstruction buffer. Chunks are released strictly in sequence order, and each
///  sequence number is released at most once.
///
/// A sender never has more than `window_size` chunks in flight past the last cumulative ACK, so
///  at most `window_size - 1` chunks are ever buffered.
#[derive(Debug)]
pub struct Reassembly {
    expected_next: SequenceNumber,
    window_size: u32,
    /// exclusive, if the file size is known
    end: Option<SequenceNumber>,
    /// invariant: all keys are > expected_next and < expected_next + window_size
    pending: BTreeMap<SequenceNumber, Bytes>,
}

impl Reassembly {
    /// `first` is the first chunk this receiver expects; everything before it is on disk already
    pub fn new(first: SequenceNumber, window_size: u32) -> Reassembly {
        Reassembly {
            expected_next: first,
            window_size,
            end: None,
            pending: Default::default(),
        }
    }

    /// Chunks at or after `end` are rejected
    pub fn limit_to(&mut self, end: SequenceNumber) {
        self.end = Some(end);
    }

    pub fn expected_next(&self) -> SequenceNumber {
        self.expected_next
    }

    /// The sequence number of the most recent cumulative ACK, or `None` if no chunk was ever
    ///  written
    pub fn last_written(&self) -> Option<SequenceNumber> {
        self.expected_next.prev()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn on_chunk(&mut self, seq: SequenceNumber, payload: Bytes) -> ChunkOutcome {
        if seq < self.expected_next {
            return ChunkOutcome::Duplicate { ack: seq };
        }

        if seq >= self.expected_next.plus(self.window_size) || self.end.is_some_and(|end| seq >= end) {
            return ChunkOutcome::OutOfRange;
        }

        if seq > self.expected_next {
            let duplicate = self.pending.contains_key(&seq);
            if !duplicate {
                self.pending.insert(seq, payload);
            }
            return ChunkOutcome::Ahead { ack: self.last_written(), duplicate };
        }

        let mut writable = vec![payload];
        let mut ack = seq;
        self.expected_next = seq.next();
        while let Some(next) = self.pending.remove(&self.expected_next) {
            writable.push(next);
            ack = self.expected_next;
            self.expected_next = self.expected_next.next();
        }

        ChunkOutcome::InOrder { writable, ack }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(seq: u32) -> Bytes {
        Bytes::from(vec![seq as u8; 3])
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::reordered(vec![2, 0, 1, 3])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::duplicates(vec![0, 0, 2, 2, 1, 1, 3, 0, 3])]
    fn test_releases_each_chunk_once_in_order(#[case] arrivals: Vec<u32>) {
        let mut reassembly = Reassembly::new(SequenceNumber::ZERO, 8);
        let mut written = Vec::new();
        for seq in arrivals {
            if let ChunkOutcome::InOrder { writable, .. } = reassembly.on_chunk(SequenceNumber::from_raw(seq), payload(seq)) {
                written.extend(writable);
            }
        }
        assert_eq!(written, vec![payload(0), payload(1), payload(2), payload(3)]);
        assert_eq!(reassembly.num_pending(), 0);
        assert_eq!(reassembly.expected_next(), SequenceNumber::from_raw(4));
    }

    #[test]
    fn test_out_of_order_acks() {
        let mut reassembly = Reassembly::new(SequenceNumber::ZERO, 8);

        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(2), payload(2)),
                   ChunkOutcome::Ahead { ack: None, duplicate: false });
        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(0), payload(0)),
                   ChunkOutcome::InOrder { writable: vec![payload(0)], ack: SequenceNumber::ZERO });
        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(2), payload(2)),
                   ChunkOutcome::Ahead { ack: Some(SequenceNumber::ZERO), duplicate: true });
        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(1), payload(1)),
                   ChunkOutcome::InOrder { writable: vec![payload(1), payload(2)], ack: SequenceNumber::from_raw(2) });
        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(1), payload(1)),
                   ChunkOutcome::Duplicate { ack: SequenceNumber::from_raw(1) });
        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(3), payload(3)),
                   ChunkOutcome::InOrder { writable: vec![payload(3)], ack: SequenceNumber::from_raw(3) });
    }

    #[test]
    fn test_resumed_acks_last_durable_chunk() {
        let mut reassembly = Reassembly::new(SequenceNumber::from_raw(5), 8);
        assert_eq!(reassembly.last_written(), Some(SequenceNumber::from_raw(4)));

        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(7), payload(7)),
                   ChunkOutcome::Ahead { ack: Some(SequenceNumber::from_raw(4)), duplicate: false });
        assert_eq!(reassembly.on_chunk(SequenceNumber::from_raw(3), payload(3)),
                   ChunkOutcome::Duplicate { ack: SequenceNumber::from_raw(3) });
    }

    #[rstest]
    #[case::window_edge(0, None, 3, false)]
    #[case::past_window(0, None, 4, true)]
    #[case::far_past_window(0, None, 1_000_000, true)]
    #[case::window_moves_with_acks(3, None, 6, false)]
    #[case::last_chunk(0, Some(3), 2, false)]
    #[case::past_end(0, Some(3), 3, true)]
    #[case::past_end_in_order(3, Some(3), 3, true)]
    fn test_rejects_chunks_out_of_range(#[case] num_written: u32, #[case] end: Option<u32>, #[case] seq: u32, #[case] rejected: bool) {
        let mut reassembly = Reassembly::new(SequenceNumber::ZERO, 4);
        if let Some(end) = end {
            reassembly.limit_to(SequenceNumber::from_raw(end));
        }
        for written in 0..num_written {
            reassembly.on_chunk(SequenceNumber::from_raw(written), payload(written));
        }

        let outcome = reassembly.on_chunk(SequenceNumber::from_raw(seq), payload(seq));
        assert_eq!(outcome == ChunkOutcome::OutOfRange, rejected);
        assert_eq!(reassembly.num_pending(), usize::from(!rejected));
    }
}
