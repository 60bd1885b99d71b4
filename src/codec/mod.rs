//! Wire format of the two datagram shapes: UTF-8 control text and sequenced binary data.

pub mod command;
pub mod control;
pub mod data_packet;
pub mod sequence;

use bytes::Bytes;
use tracing::trace;
use crate::codec::control::ControlMessage;
use crate::codec::data_packet::DataPacket;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datagram {
    Control(ControlMessage),
    Data(DataPacket),
}

impl Datagram {
    /// Classifies a received datagram. A datagram that is valid UTF-8 and parses as a control
    ///  message is control; otherwise it is data if it has at least a full sequence number
    ///  header. Returns `None` for malformed datagrams, which callers discard.
    pub fn decode(buf: &[u8]) -> Option<Datagram> {
        if let Ok(text) = std::str::from_utf8(buf) {
            if let Some(msg) = ControlMessage::parse(text) {
                return Some(Datagram::Control(msg));
            }
        }

        match DataPacket::deser(buf) {
            Ok(packet) => Some(Datagram::Data(packet)),
            Err(e) => {
                trace!("discarding malformed datagram: {}", e);
                None
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Datagram::Control(msg) => Bytes::from(msg.to_string()),
            Datagram::Data(packet) => packet.to_bytes(),
        }
    }
}
