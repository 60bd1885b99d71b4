use std::fmt::{Display, Formatter};

/// Absolute chunk number inside a file, i.e. `byte_offset / chunk_size`. Resumed transfers keep
///  absolute numbering so that ACKs stay comparable across sessions.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// NB: callers check against the number of chunks first, so overflow means a file of more
    ///      than 4G chunks, which is rejected when the transfer is set up
    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.saturating_add(1))
    }

    pub fn prev(&self) -> Option<SequenceNumber> {
        self.0.checked_sub(1).map(SequenceNumber)
    }

    pub fn plus(&self, n: u32) -> SequenceNumber {
        SequenceNumber(self.0.saturating_add(n))
    }

    /// iterates from self (inclusive) to `end` (exclusive)
    pub fn to(&self, end: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        (self.0..end.0).map(SequenceNumber)
    }
}
