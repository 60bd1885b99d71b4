use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::codec::sequence::SequenceNumber;

/// A sequenced chunk of file data:
///
/// ```ascii
/// 0: sequence number (u32 BE)
/// 4: payload (up to the configured chunk size)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub sequence_number: SequenceNumber,
    pub payload: Bytes,
}

impl DataPacket {
    pub const HEADER_LEN: usize = size_of::<u32>();

    pub fn new(sequence_number: SequenceNumber, payload: Bytes) -> DataPacket {
        DataPacket { sequence_number, payload }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(self.serialized_len());
        buf.put_u32(self.sequence_number.to_raw());
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<DataPacket> {
        if buf.remaining() < Self::HEADER_LEN {
            bail!("data packet of {} bytes is shorter than its header", buf.remaining());
        }
        let sequence_number = SequenceNumber::from_raw(buf.get_u32());
        let payload = Bytes::copy_from_slice(buf.chunk());
        Ok(DataPacket {
            sequence_number,
            payload,
        })
    }
}
