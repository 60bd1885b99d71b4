use std::sync::Arc;
use chrono::Local;
use tokio::fs::{self, File};
use tracing::{debug, trace};
use crate::codec::command::Command;
use crate::codec::control::ControlMessage;
use crate::config::{ServerConfig, TransferConfig};
use crate::error::TransferError;
use crate::link::{DatagramTx, PeerLink};
use crate::session::{resolve_in_storage, PartialFile};
use crate::transfer::receiver::FileReceiver;
use crate::transfer::sender::{FileSender, Handshake};
use crate::transfer::{sequence_for_offset, ChunkLayout, TransferReport};

/// What the server does with a datagram from a peer that has no active transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// answer right away, no state is kept
    Reply(String),
    /// start a transfer session for the peer
    Transfer(Command),
    /// not a command, e.g. a late datagram of a transfer that finished already
    Ignore,
}

/// Parses commands and runs the server side of transfers
pub struct CommandDispatcher {
    config: Arc<ServerConfig>,
    transfer_config: Arc<TransferConfig>,
}

impl CommandDispatcher {
    pub fn new(config: Arc<ServerConfig>) -> CommandDispatcher {
        let transfer_config = Arc::new(config.transfer.clone());
        CommandDispatcher { config, transfer_config }
    }

    pub fn route(&self, datagram: &[u8]) -> Route {
        let Ok(text) = std::str::from_utf8(datagram) else {
            trace!("ignoring binary datagram of {} bytes", datagram.len());
            return Route::Ignore;
        };

        match ControlMessage::parse(text) {
            Some(ControlMessage::Command(_)) | None => {}
            Some(other) => {
                debug!("ignoring {} outside of a transfer", other);
                return Route::Ignore;
            }
        }
        // data packets with small sequence numbers are valid UTF-8
        if text.starts_with(|c: char| c.is_control() && !c.is_whitespace()) {
            trace!("ignoring data datagram outside of a transfer");
            return Route::Ignore;
        }

        match Command::parse(text) {
            Ok(Command::Echo(text)) => Route::Reply(text),
            Ok(Command::Time) => Route::Reply(Local::now().to_rfc3339()),
            Ok(command) => Route::Transfer(command),
            Err(e) => Route::Reply(ControlMessage::Error(e.to_string()).to_string()),
        }
    }

    /// Runs the server side of an UPLOAD or DOWNLOAD. A request that can not be served is
    ///  answered with `ERROR:` or `FILE_NOT_FOUND` before the error is returned.
    pub async fn run_transfer(&self, command: Command, link: PeerLink) -> anyhow::Result<TransferReport> {
        let reply_tx = link.tx.clone();
        let result = match command {
            Command::Upload { filename, offset } => self.serve_upload(filename, offset, link).await,
            Command::Download { filename, offset } => self.serve_download(filename, offset, link).await,
            other => return Err(TransferError::Protocol(format!("{} is not a transfer command", other)).into()),
        };

        if let Err(e) = &result {
            if let Some(reply) = e.downcast_ref::<Rejection>() {
                send_reply(reply_tx.as_ref(), &reply.0).await;
            }
        }
        result.map_err(|e| match e.downcast::<Rejection>() {
            Ok(rejection) => rejection.1.into(),
            Err(e) => e,
        })
    }

    async fn serve_upload(&self, filename: String, offset: u64, link: PeerLink) -> anyhow::Result<TransferReport> {
        let transfer_config = self.transfer_config.clone();

        let path = resolve_in_storage(&self.config.storage_dir, &filename)
            .map_err(Rejection::from)?;
        sequence_for_offset(offset, transfer_config.chunk_size)
            .map_err(Rejection::from)?;
        let partial = PartialFile::open_at(&path, &transfer_config.partial_suffix, offset).await
            .map_err(Rejection::from_anyhow)?;

        debug!("receiving upload of {} at offset {}", filename, offset);
        FileReceiver::new(transfer_config, filename, link.tx, link.rx, partial)?
            .with_handshake_reply(ControlMessage::Ready(offset.to_string()))
            .run().await
    }

    async fn serve_download(&self, filename: String, offset: u64, link: PeerLink) -> anyhow::Result<TransferReport> {
        let transfer_config = self.transfer_config.clone();

        let path = resolve_in_storage(&self.config.storage_dir, &filename)
            .map_err(Rejection::from)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Rejection::from(TransferError::NotFound(filename)).into());
            }
            Err(e) => return Err(TransferError::io(&path, e).into()),
        };
        if metadata.is_dir() {
            return Err(Rejection::new("Cannot download directory", TransferError::Protocol(format!("{} is a directory", filename))).into());
        }

        let layout = ChunkLayout::new(transfer_config.chunk_size, metadata.len())
            .map_err(Rejection::from)?;
        layout.first_sequence(offset)
            .map_err(Rejection::from)?;

        let file = File::open(&path).await
            .map_err(|e| TransferError::io(&path, e))?;

        debug!("serving download of {} ({} bytes) from offset {}", filename, metadata.len(), offset);
        let mut sender = FileSender::new(
            transfer_config,
            filename,
            link,
            file,
            metadata.len(),
            offset,
            Handshake::Announce(ControlMessage::Size(metadata.len())),
        )?;
        sender.run().await
    }
}

/// A request the server refuses: the reply for the peer, and the error to report locally
#[derive(Debug, thiserror::Error)]
#[error("{1}")]
struct Rejection(ControlMessage, TransferError);

impl Rejection {
    fn new(reason: &str, error: TransferError) -> Rejection {
        Rejection(ControlMessage::Error(reason.to_string()), error)
    }

    fn from_anyhow(e: anyhow::Error) -> anyhow::Error {
        match e.downcast::<TransferError>() {
            Ok(e) => Rejection::from(e).into(),
            Err(e) => e,
        }
    }
}

impl From<TransferError> for Rejection {
    fn from(error: TransferError) -> Rejection {
        let reply = match &error {
            TransferError::NotFound(_) => ControlMessage::FileNotFound,
            TransferError::InvalidFilename(_) => ControlMessage::Error("Invalid filename".to_string()),
            TransferError::InvalidOffset { offset, reason } => ControlMessage::Error(format!("Invalid offset {}: {}", offset, reason)),
            other => ControlMessage::Error(other.to_string()),
        };
        Rejection(reply, error)
    }
}

async fn send_reply(tx: &dyn DatagramTx, reply: &ControlMessage) {
    debug!("rejecting request: {}", reply);
    if let Err(e) = tx.send_datagram(reply.to_string().as_bytes()).await {
        debug!("could not send {}: {}", reply, e);
    }
}
