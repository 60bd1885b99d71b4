//! Reliable, resumable file transfer over plain UDP.
//!
//! A server listens on a single UDP socket and answers four commands, sent as one UTF-8 line
//!  per datagram:
//!
//! ```ascii
//! ECHO <text>                      -> <text>
//! TIME                             -> RFC 3339 timestamp
//! UPLOAD <filename> [<offset>]     -> READY: <offset>, then the client sends data
//! DOWNLOAD <filename> [<offset>]   -> SIZE <n> (or FILE_NOT_FOUND), then the server sends data
//! ```
//!
//! File content travels in data datagrams, a 4 byte big-endian sequence number followed by up
//!  to `chunk_size` bytes of payload:
//!
//! ```ascii
//! 0:  sequence number (u32 BE)
//! 4:  payload
//! ```
//!
//! The sender keeps a window of unacknowledged chunks in flight. The receiver acknowledges
//!  cumulatively with `ACK:<n>` (all chunks up to and including `n` are on disk), and the
//!  sender retransmits the unacknowledged part of the window if no ACK arrives in time. The
//!  end of data is signalled with `EOF` / `ACKEOF`, and the receiver confirms the completed
//!  file with `SUCCESS: <size>`. Anything the server can not do is answered with `ERROR: <reason>`.
//!
//! The receiver writes into a partial file and renames it only after the transfer completed.
//!  An interrupted transfer is resumed by sending the command with an offset: for downloads the
//!  client's partial file determines the offset, for uploads a marker file next to the local
//!  file records how many bytes the server acknowledged.

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod server;
pub mod session;
pub mod test_util;
pub mod transfer;
pub mod util;
