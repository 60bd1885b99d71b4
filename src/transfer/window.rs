use std::collections::BTreeSet;
use tracing::trace;
use crate::codec::sequence::SequenceNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// the window moved forward by this many chunks
    Advanced(u32),
    /// the ACK is below the window, e.g. a duplicate or a re-sent ACK
    Stale,
    /// the ACK refers to a chunk that was never sent
    Beyond,
}

/// The sender's sliding window over a file's chunks. All chunks below `next_unacked` are
///  acknowledged, and only chunks in `[next_unacked, next_unacked + window_size)` may be in
///  flight.
///
/// This is pure bookkeeping: callers send what [SendWindow::take_to_send] returns and feed ACKs
///  and timeouts back.
#[derive(Debug)]
pub struct SendWindow {
    next_unacked: SequenceNumber,
    end: SequenceNumber,
    window_size: u32,
    /// in-window chunks that are currently considered in flight
    in_flight: BTreeSet<SequenceNumber>,
    /// everything below this has been sent at least once
    high_water_mark: SequenceNumber,
    transmitted: u64,
    retransmitted: u64,
}

impl SendWindow {
    pub fn new(first: SequenceNumber, end: SequenceNumber, window_size: u32) -> SendWindow {
        SendWindow {
            next_unacked: first,
            end,
            window_size,
            in_flight: Default::default(),
            high_water_mark: first,
            transmitted: 0,
            retransmitted: 0,
        }
    }

    pub fn next_unacked(&self) -> SequenceNumber {
        self.next_unacked
    }

    pub fn is_complete(&self) -> bool {
        self.next_unacked >= self.end
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn transmitted(&self) -> u64 {
        self.transmitted
    }

    pub fn retransmitted(&self) -> u64 {
        self.retransmitted
    }

    fn window_end(&self) -> SequenceNumber {
        self.next_unacked.plus(self.window_size).min(self.end)
    }

    /// Returns all chunks in the window that are not marked as sent, in ascending order, and
    ///  marks them as sent.
    pub fn take_to_send(&mut self) -> Vec<SequenceNumber> {
        let mut result = Vec::new();
        for seq in self.next_unacked.to(self.window_end()) {
            if self.in_flight.insert(seq) {
                if seq < self.high_water_mark {
                    self.retransmitted += 1;
                }
                self.transmitted += 1;
                result.push(seq);
            }
        }
        if let Some(&last) = result.last() {
            self.high_water_mark = self.high_water_mark.max(last.next());
        }
        result
    }

    /// ACKs are cumulative: an ACK for `seq` acknowledges all chunks up to and including `seq`
    pub fn on_ack(&mut self, seq: SequenceNumber) -> AckOutcome {
        if seq >= self.high_water_mark {
            trace!("ACK {} for a chunk that was never sent", seq);
            return AckOutcome::Beyond;
        }
        if seq < self.next_unacked {
            return AckOutcome::Stale;
        }

        let advanced = seq.to_raw() - self.next_unacked.to_raw() + 1;
        self.next_unacked = seq.next();
        let next_unacked = self.next_unacked;
        self.in_flight.retain(|s| *s >= next_unacked);
        AckOutcome::Advanced(advanced)
    }

    /// Treats every chunk in flight as lost, so the next call to [SendWindow::take_to_send]
    ///  returns the whole unacknowledged window. Returns the number of chunks marked for
    ///  retransmission.
    pub fn on_timeout(&mut self) -> usize {
        let result = self.in_flight.len();
        self.in_flight.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seqs(raw: &[u32]) -> Vec<SequenceNumber> {
        raw.iter().map(|&s| SequenceNumber::from_raw(s)).collect()
    }

    #[rstest]
    #[case::empty_file(0, 0, 8, vec![])]
    #[case::smaller_than_window(0, 3, 8, vec![0, 1, 2])]
    #[case::window_limits(0, 20, 4, vec![0, 1, 2, 3])]
    #[case::resumed(5, 20, 3, vec![5, 6, 7])]
    #[case::resumed_at_end(20, 20, 3, vec![])]
    fn test_initial_send(#[case] first: u32, #[case] end: u32, #[case] window_size: u32, #[case] expected: Vec<u32>) {
        let mut window = SendWindow::new(SequenceNumber::from_raw(first), SequenceNumber::from_raw(end), window_size);
        assert_eq!(window.take_to_send(), seqs(&expected));
        assert_eq!(window.is_complete(), first == end);
        assert!(window.take_to_send().is_empty());
    }

    #[rstest]
    #[case::first(0, AckOutcome::Advanced(1), 0, vec![4])]
    #[case::cumulative(2, AckOutcome::Advanced(3), 0, vec![4, 5, 6])]
    #[case::all_sent(3, AckOutcome::Advanced(4), 0, vec![4, 5, 6, 7])]
    #[case::never_sent(4, AckOutcome::Beyond, 0, vec![])]
    #[case::far_beyond(100, AckOutcome::Beyond, 0, vec![])]
    fn test_on_ack(#[case] ack: u32, #[case] expected: AckOutcome, #[case] expected_retransmitted: u64, #[case] expected_next: Vec<u32>) {
        let mut window = SendWindow::new(SequenceNumber::ZERO, SequenceNumber::from_raw(10), 4);
        window.take_to_send();

        assert_eq!(window.on_ack(SequenceNumber::from_raw(ack)), expected);
        assert_eq!(window.take_to_send(), seqs(&expected_next));
        assert_eq!(window.retransmitted(), expected_retransmitted);
    }

    #[test]
    fn test_stale_ack() {
        let mut window = SendWindow::new(SequenceNumber::ZERO, SequenceNumber::from_raw(10), 4);
        window.take_to_send();
        assert_eq!(window.on_ack(SequenceNumber::from_raw(1)), AckOutcome::Advanced(2));
        assert_eq!(window.on_ack(SequenceNumber::from_raw(1)), AckOutcome::Stale);
        assert_eq!(window.on_ack(SequenceNumber::ZERO), AckOutcome::Stale);
        assert_eq!(window.next_unacked(), SequenceNumber::from_raw(2));
    }

    #[test]
    fn test_timeout_resends_exactly_the_unacknowledged_window() {
        let mut window = SendWindow::new(SequenceNumber::ZERO, SequenceNumber::from_raw(10), 4);
        assert_eq!(window.take_to_send(), seqs(&[0, 1, 2, 3]));
        window.on_ack(SequenceNumber::from_raw(1));
        assert_eq!(window.take_to_send(), seqs(&[4, 5]));

        assert_eq!(window.on_timeout(), 4);
        assert_eq!(window.take_to_send(), seqs(&[2, 3, 4, 5]));
        assert_eq!(window.retransmitted(), 4);
        assert_eq!(window.transmitted(), 10);
    }

    #[test]
    fn test_lost_final_ack_retransmits_once() {
        let mut window = SendWindow::new(SequenceNumber::ZERO, SequenceNumber::from_raw(3), 8);
        assert_eq!(window.take_to_send(), seqs(&[0, 1, 2]));
        window.on_ack(SequenceNumber::from_raw(1));
        assert!(!window.is_complete());

        window.on_timeout();
        assert_eq!(window.take_to_send(), seqs(&[2]));
        assert_eq!(window.on_ack(SequenceNumber::from_raw(2)), AckOutcome::Advanced(1));
        assert!(window.is_complete());
        assert_eq!(window.retransmitted(), 1);
    }

    #[test]
    fn test_in_flight_never_exceeds_window() {
        let mut window = SendWindow::new(SequenceNumber::ZERO, SequenceNumber::from_raw(100), 5);
        for ack in [0, 0, 3, 2, 9, 4, 20] {
            window.take_to_send();
            assert!(window.num_in_flight() <= 5);
            window.on_ack(SequenceNumber::from_raw(ack));
            if ack == 9 {
                window.on_timeout();
            }
        }
        window.take_to_send();
        assert!(window.num_in_flight() <= 5);
    }
}
