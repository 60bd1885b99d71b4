use std::fmt::{Display, Formatter};
use crate::codec::command::Command;
use crate::codec::sequence::SequenceNumber;

/// Control datagrams are UTF-8 text, exactly one message per datagram. There is no terminator:
///  UDP preserves datagram boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Command(Command),
    /// `READY: <info>` - the receiver of an upload is set up, `info` is the start offset
    Ready(String),
    /// `ACK:<seq>` - cumulative: all chunks up to and including `seq` are written
    Ack(SequenceNumber),
    AckEof,
    Eof,
    Success(String),
    Error(String),
    FileNotFound,
    /// `SIZE <n>` - total file size, announced by the sender of a download
    Size(u64),
}

impl ControlMessage {
    const READY: &'static str = "READY:";
    const ACK: &'static str = "ACK:";
    const ACK_EOF: &'static str = "ACKEOF";
    const EOF: &'static str = "EOF";
    const SUCCESS: &'static str = "SUCCESS:";
    const ERROR: &'static str = "ERROR:";
    const FILE_NOT_FOUND: &'static str = "FILE_NOT_FOUND";
    const SIZE: &'static str = "SIZE ";

    /// Returns `None` if the text is not a recognized control message. A prefix that is
    ///  recognized but has an unparseable argument (e.g. `ACK:x`) is not a control message
    ///  either, and the datagram is treated like any other unrecognized datagram.
    pub fn parse(text: &str) -> Option<ControlMessage> {
        if text == Self::ACK_EOF {
            return Some(ControlMessage::AckEof);
        }
        if text == Self::EOF {
            return Some(ControlMessage::Eof);
        }
        if text == Self::FILE_NOT_FOUND {
            return Some(ControlMessage::FileNotFound);
        }
        if let Some(seq) = text.strip_prefix(Self::ACK) {
            return seq.trim().parse::<u32>().ok()
                .map(|seq| ControlMessage::Ack(SequenceNumber::from_raw(seq)));
        }
        if let Some(info) = text.strip_prefix(Self::READY) {
            return Some(ControlMessage::Ready(info.trim().to_string()));
        }
        if let Some(info) = text.strip_prefix(Self::SUCCESS) {
            return Some(ControlMessage::Success(info.trim().to_string()));
        }
        if let Some(info) = text.strip_prefix(Self::ERROR) {
            return Some(ControlMessage::Error(info.trim().to_string()));
        }
        if let Some(size) = text.strip_prefix(Self::SIZE) {
            return size.trim().parse::<u64>().ok()
                .map(ControlMessage::Size);
        }

        Command::parse(text).ok()
            .map(ControlMessage::Command)
    }
}

impl Display for ControlMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::Command(command) => write!(f, "{}", command),
            ControlMessage::Ready(info) => write!(f, "{} {}", Self::READY, info),
            ControlMessage::Ack(seq) => write!(f, "{}{}", Self::ACK, seq),
            ControlMessage::AckEof => write!(f, "{}", Self::ACK_EOF),
            ControlMessage::Eof => write!(f, "{}", Self::EOF),
            ControlMessage::Success(info) => write!(f, "{} {}", Self::SUCCESS, info),
            ControlMessage::Error(info) => write!(f, "{} {}", Self::ERROR, info),
            ControlMessage::FileNotFound => write!(f, "{}", Self::FILE_NOT_FOUND),
            ControlMessage::Size(size) => write!(f, "{}{}", Self::SIZE, size),
        }
    }
}
