use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use anyhow::{bail, Context};
use tokio::fs::{self, File};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::codec::command::Command;
use crate::codec::control::ControlMessage;
use crate::codec::Datagram;
use crate::config::{ClientConfig, TransferConfig};
use crate::error::TransferError;
use crate::link::{bind_udp, PeerLink};
use crate::session::{PartialFile, UploadMarker};
use crate::transfer::receiver::FileReceiver;
use crate::transfer::sender::{FileSender, Handshake};
use crate::transfer::{align_down, TransferReport};

/// Client side of the protocol. Every request uses a fresh UDP socket, so the server sees each
///  one as coming from a new peer.
pub struct Client {
    config: Arc<ClientConfig>,
    transfer_config: Arc<TransferConfig>,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;
        Ok(Client {
            transfer_config: Arc::new(config.transfer.clone()),
            config: Arc::new(config),
        })
    }

    async fn connect(&self) -> anyhow::Result<PeerLink> {
        let server_addr = self.config.server_addr;
        let local_addr: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        }
        else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = bind_udp(local_addr, self.config.socket_buffer_size)?;
        PeerLink::connected(socket, server_addr).await
    }

    pub async fn echo(&self, text: &str) -> anyhow::Result<String> {
        self.request(&Command::Echo(text.to_string()).to_string()).await
    }

    pub async fn time(&self) -> anyhow::Result<String> {
        self.request(&Command::Time.to_string()).await
    }

    /// Sends a single line and returns the server's reply verbatim, retrying if no reply arrives
    pub async fn request(&self, line: &str) -> anyhow::Result<String> {
        let mut link = self.connect().await?;
        let retries = self.transfer_config.ready_retries;

        for attempt in 1..=retries {
            trace!("sending request '{}', attempt {}", line, attempt);
            link.tx.send_datagram(line.as_bytes()).await?;
            match timeout(self.transfer_config.ready_timeout, link.rx.recv_datagram()).await {
                Ok(reply) => return Ok(String::from_utf8_lossy(&reply?).into_owned()),
                Err(_) => debug!("no reply to '{}' within {:?}", line, self.transfer_config.ready_timeout),
            }
        }
        Err(TransferError::NoResponse(retries).into())
    }

    /// Uploads `local` to the server, storing it as `remote`. An interrupted upload leaves a
    ///  marker next to the local file, and the next upload of the same file continues from the
    ///  offset it records.
    pub async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<TransferReport> {
        let metadata = fs::metadata(local).await
            .with_context(|| format!("reading metadata of {:?}", local))?;
        if !metadata.is_file() {
            bail!("{:?} is not a regular file", local);
        }
        let total_size = metadata.len();

        let marker = UploadMarker::for_file(local, &self.transfer_config.upload_marker_suffix);
        let mut offset = marker.read().await?;
        if offset > total_size || offset != align_down(offset, self.transfer_config.chunk_size) {
            warn!("upload marker {:?} holds offset {} which does not fit {:?} - starting from scratch", marker.path(), offset, local);
            offset = 0;
        }
        if offset > 0 {
            info!("resuming upload of {:?} at offset {}", local, offset);
        }

        let file = File::open(local).await
            .map_err(|e| TransferError::io(local, e))?;
        let link = self.connect().await?;
        let command = Command::Upload { filename: remote.to_string(), offset };
        let mut sender = FileSender::new(
            self.transfer_config.clone(),
            remote,
            link,
            file,
            total_size,
            offset,
            Handshake::AwaitReady(command),
        )?;

        let span = span!(Level::INFO, "upload", transfer_id = %Uuid::new_v4(), remote);
        match sender.run().instrument(span).await {
            Ok(report) => {
                marker.remove().await?;
                Ok(report)
            }
            Err(e) => {
                let rejected = matches!(e.downcast_ref::<TransferError>(), Some(TransferError::Rejected(_)));
                let marker_update = if rejected && offset > 0 {
                    warn!("server rejected resuming at offset {}, the next upload starts from scratch", offset);
                    marker.remove().await
                }
                else if sender.acknowledged_offset() > 0 {
                    marker.write(sender.acknowledged_offset()).await
                }
                else {
                    Ok(())
                };
                if let Err(marker_error) = marker_update {
                    error!("could not update upload marker {:?}: {}", marker.path(), marker_error);
                }
                Err(e)
            }
        }
    }

    /// Downloads `remote` into `local`. Data is written to a partial file next to `local`,
    ///  and a later download of the same file continues where the partial file ends.
    pub async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<TransferReport> {
        let suffix = &self.transfer_config.partial_suffix;
        let offset = PartialFile::resume_offset(local, suffix, self.transfer_config.chunk_size).await?;
        if offset > 0 {
            info!("resuming download of {} at offset {}", remote, offset);
        }

        let span = span!(Level::INFO, "download", transfer_id = %Uuid::new_v4(), remote);
        async {
            let mut link = self.connect().await?;
            let total_size = match self.await_size(&mut link, remote, offset).await {
                Ok(total_size) => total_size,
                Err(e) => {
                    if offset > 0 && matches!(e.downcast_ref::<TransferError>(), Some(TransferError::Rejected(_))) {
                        warn!("server rejected resuming at offset {}, discarding the partial file", offset);
                        PartialFile::remove(local, suffix).await?;
                    }
                    return Err(e);
                }
            };

            let partial = PartialFile::open_at(local, suffix, offset).await?;
            FileReceiver::new(self.transfer_config.clone(), remote, link.tx, link.rx, partial)?
                .with_expected_total(total_size)
                .run().await
        }.instrument(span).await
    }

    /// Sends DOWNLOAD until the server announces the file's size
    async fn await_size(&self, link: &mut PeerLink, remote: &str, offset: u64) -> anyhow::Result<u64> {
        let request = ControlMessage::Command(Command::Download { filename: remote.to_string(), offset });
        let retries = self.transfer_config.ready_retries;

        for attempt in 1..=retries {
            debug!("sending {}, attempt {}", request, attempt);
            link.tx.send_datagram(request.to_string().as_bytes()).await?;

            let attempt_end = Instant::now() + self.transfer_config.ready_timeout;
            while let Ok(received) = timeout_at(attempt_end, link.rx.recv_datagram()).await {
                match Datagram::decode(&received?) {
                    Some(Datagram::Control(ControlMessage::Size(total_size))) => {
                        if total_size < offset {
                            return Err(TransferError::Protocol(format!("server announced {} bytes, but {} are stored locally", total_size, offset)).into());
                        }
                        debug!("server announced {} bytes", total_size);
                        return Ok(total_size);
                    }
                    Some(Datagram::Control(ControlMessage::FileNotFound)) => {
                        return Err(TransferError::NotFound(remote.to_string()).into());
                    }
                    Some(Datagram::Control(ControlMessage::Error(msg))) => {
                        return Err(TransferError::Rejected(msg).into());
                    }
                    // data overtaking the announcement is sent again after the server's ACK timeout
                    Some(Datagram::Data(packet)) => trace!("ignoring chunk {} before the size announcement", packet.sequence_number),
                    Some(Datagram::Control(other)) => debug!("ignoring {} before the size announcement", other),
                    None => trace!("ignoring malformed datagram"),
                }
            }
        }
        Err(TransferError::NoResponse(retries).into())
    }
}
