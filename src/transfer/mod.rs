//! The sender and receiver state machines of a single transfer, plus the pure bookkeeping they
//!  are built on (send window, reassembly buffer).

pub mod reassembly;
pub mod receiver;
pub mod sender;
pub mod window;

use std::fmt::{Display, Formatter};
use std::time::Duration;
use crate::codec::sequence::SequenceNumber;
use crate::error::TransferError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Maps between byte offsets and sequence numbers for a file of known size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: usize,
    total_size: u64,
}

impl ChunkLayout {
    pub fn new(chunk_size: usize, total_size: u64) -> Result<ChunkLayout, TransferError> {
        let num_chunks = total_size.div_ceil(chunk_size.safe_cast());
        if num_chunks > u32::MAX as u64 {
            return Err(TransferError::Protocol(format!("a file of {} bytes has more than {} chunks", total_size, u32::MAX)));
        }
        Ok(ChunkLayout { chunk_size, total_size })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// exclusive upper bound of the file's sequence numbers
    pub fn end(&self) -> SequenceNumber {
        SequenceNumber::from_raw(self.total_size.div_ceil(self.chunk_size.safe_cast()).prechecked_cast())
    }

    /// The first sequence number to transfer when resuming at `offset`, which must be chunk
    ///  aligned and inside the file. Resuming at the end of the file is valid and transfers no
    ///  data.
    pub fn first_sequence(&self, offset: u64) -> Result<SequenceNumber, TransferError> {
        if offset > self.total_size {
            return Err(TransferError::InvalidOffset {
                offset,
                reason: format!("beyond file size {}", self.total_size),
            });
        }
        sequence_for_offset(offset, self.chunk_size)
    }

    pub fn offset_of(&self, seq: SequenceNumber) -> u64 {
        offset_of(seq, self.chunk_size)
    }

    /// only the last chunk may be shorter than the chunk size
    pub fn chunk_len(&self, seq: SequenceNumber) -> usize {
        let remaining = self.total_size.saturating_sub(self.offset_of(seq));
        remaining.min(self.chunk_size.safe_cast()).prechecked_cast()
    }
}

pub fn sequence_for_offset(offset: u64, chunk_size: usize) -> Result<SequenceNumber, TransferError> {
    let chunk_size: u64 = chunk_size.safe_cast();
    if offset % chunk_size != 0 {
        return Err(TransferError::InvalidOffset {
            offset,
            reason: format!("not a multiple of the chunk size {}", chunk_size),
        });
    }
    let seq = offset / chunk_size;
    if seq > u32::MAX as u64 {
        return Err(TransferError::InvalidOffset {
            offset,
            reason: "sequence number out of range".to_string(),
        });
    }
    Ok(SequenceNumber::from_raw(seq.prechecked_cast()))
}

pub fn offset_of(seq: SequenceNumber, chunk_size: usize) -> u64 {
    let raw: u64 = seq.to_raw().safe_cast();
    raw * chunk_size.safe_cast()
}

pub fn align_down(offset: u64, chunk_size: usize) -> u64 {
    let chunk_size: u64 = chunk_size.safe_cast();
    offset - offset % chunk_size
}

/// Counters collected while a transfer runs. The sender fills the `chunks_*` and `ack_*`
///  fields, the receiver the `written` / `duplicate` / `out_of_order` ones.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks_transmitted: u64,
    pub chunks_retransmitted: u64,
    pub ack_timeouts: u64,
    pub chunks_written: u64,
    pub duplicate_chunks: u64,
    pub out_of_order_chunks: u64,
    pub malformed_datagrams: u64,
}

/// Summary of a completed transfer, returned to the caller for logging
#[derive(Clone, Debug)]
pub struct TransferReport {
    pub filename: String,
    pub start_offset: u64,
    /// file size after the transfer, i.e. `start_offset` plus the bytes moved in this session
    pub total_size: u64,
    pub elapsed: Duration,
    pub stats: TransferStats,
}

impl TransferReport {
    pub fn bytes_transferred(&self) -> u64 {
        self.total_size.saturating_sub(self.start_offset)
    }

    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred() as f64 / secs
    }
}

impl Display for TransferReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} bytes (resumed at {}) in {:?}, {:.1} KiB/s, {:?}",
            self.filename,
            self.bytes_transferred(),
            self.start_offset,
            self.elapsed,
            self.bytes_per_second() / 1024.0,
            self.stats,
        )
    }
}
