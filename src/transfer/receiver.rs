use std::sync::Arc;
use anyhow::Context;
use bytes::Bytes;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};
use crate::codec::control::ControlMessage;
use crate::codec::data_packet::DataPacket;
use crate::codec::Datagram;
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::link::{DatagramRx, DatagramTx};
use crate::session::PartialFile;
use crate::transfer::reassembly::{ChunkOutcome, Reassembly};
use crate::transfer::{sequence_for_offset, ChunkLayout, TransferReport, TransferStats};

enum Flow {
    Continue,
    Eof,
}

/// Receiving end of a single transfer: reassembles chunks into a partial file, acknowledges
///  them cumulatively, and promotes the partial file once the sender signals EOF.
///
/// On failure the partial file is flushed and left in place, so a later transfer can resume
///  from its length.
pub struct FileReceiver {
    config: Arc<TransferConfig>,
    filename: String,
    tx: Arc<dyn DatagramTx>,
    rx: Box<dyn DatagramRx>,
    partial: PartialFile,
    reassembly: Reassembly,
    start_offset: u64,
    /// file size announced by the sender, if any
    expected_total: Option<u64>,
    /// reply to the peer's command, re-sent if the peer repeats the command
    handshake_reply: Option<ControlMessage>,
    stats: TransferStats,
}

impl FileReceiver {
    /// Data is appended to `partial`, which must be positioned at a chunk boundary
    pub fn new(
        config: Arc<TransferConfig>,
        filename: impl Into<String>,
        tx: Arc<dyn DatagramTx>,
        rx: Box<dyn DatagramRx>,
        partial: PartialFile,
    ) -> anyhow::Result<FileReceiver> {
        let start_offset = partial.len();
        let first = sequence_for_offset(start_offset, config.chunk_size)?;
        let reassembly = Reassembly::new(first, config.window_size);
        Ok(FileReceiver {
            config,
            filename: filename.into(),
            tx,
            rx,
            partial,
            reassembly,
            start_offset,
            expected_total: None,
            handshake_reply: None,
            stats: Default::default(),
        })
    }

    /// The reply is sent when the receiver starts, and again whenever the peer repeats its
    ///  command or falls silent before the first chunk arrived
    pub fn with_handshake_reply(mut self, reply: ControlMessage) -> FileReceiver {
        self.handshake_reply = Some(reply);
        self
    }

    /// The transfer only succeeds if the file ends up with exactly this size
    pub fn with_expected_total(mut self, expected_total: u64) -> FileReceiver {
        if let Ok(layout) = ChunkLayout::new(self.config.chunk_size, expected_total) {
            self.reassembly.limit_to(layout.end());
        }
        self.expected_total = Some(expected_total);
        self
    }

    pub async fn run(mut self) -> anyhow::Result<TransferReport> {
        let started = Instant::now();
        let deadline = started + self.config.global_timeout;
        debug!("receiving {} from offset {}", self.filename, self.start_offset);

        if let Some(reply) = self.handshake_reply.clone() {
            self.send(&reply).await?;
        }

        let mut num_silent = 0;
        let mut eof_grace_end = None;
        loop {
            if eof_grace_end.is_some() && self.reassembly.num_pending() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                let e = TransferError::GlobalTimeout(self.config.global_timeout).into();
                return self.abort(e).await;
            }

            let wait_until = match eof_grace_end {
                Some(grace_end) => grace_end,
                None => Instant::now() + self.config.silence_timeout,
            }.min(deadline);

            match timeout_at(wait_until, self.rx.recv_datagram()).await {
                Ok(Ok(buf)) => {
                    num_silent = 0;
                    match self.on_datagram(buf).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Eof) => {
                            if eof_grace_end.is_none() {
                                debug!("EOF received, {} chunks pending", self.reassembly.num_pending());
                                eof_grace_end = Some(Instant::now() + self.config.eof_grace);
                            }
                        }
                        Err(e) => return self.abort(e).await,
                    }
                }
                Ok(Err(e)) => return self.abort(e.context("receiving datagram")).await,
                Err(_) => {
                    if Instant::now() >= deadline {
                        let e = TransferError::GlobalTimeout(self.config.global_timeout).into();
                return self.abort(e).await;
                    }
                    if eof_grace_end.is_some() {
                        let missing = TransferError::Protocol(format!("EOF received, but {} chunks after {} are still missing",
                            self.reassembly.num_pending(), self.reassembly.expected_next()));
                        return self.abort(missing.into()).await;
                    }

                    num_silent += 1;
                    if num_silent >= self.config.silence_retries {
                        let e = TransferError::PeerSilent {
                            timeout: self.config.silence_timeout,
                            retries: self.config.silence_retries,
                        }.into();
                        return self.abort(e).await;
                    }
                    debug!("no data from peer for {:?}, poking it", self.config.silence_timeout);
                    if let Err(e) = self.poke().await {
                        return self.abort(e).await;
                    }
                }
            }
        }

        let total_size = self.partial.len();
        if let Some(expected) = self.expected_total {
            if expected != total_size {
                return self.abort(TransferError::SizeMismatch { expected, actual: total_size }.into()).await;
            }
        }

        let FileReceiver { config, filename, tx, mut rx, partial, reassembly, start_offset, stats, .. } = self;
        partial.promote().await?;
        info!("received {} ({} bytes)", filename, total_size);

        let linger_until = eof_grace_end.unwrap_or_else(Instant::now);
        confirm_success(&config, tx.as_ref(), rx.as_mut(), &reassembly, total_size, linger_until).await?;

        Ok(TransferReport {
            filename,
            start_offset,
            total_size,
            elapsed: started.elapsed(),
            stats,
        })
    }

    async fn on_datagram(&mut self, buf: Bytes) -> anyhow::Result<Flow> {
        match Datagram::decode(&buf) {
            Some(Datagram::Data(packet)) => {
                self.on_data(packet).await?;
            }
            Some(Datagram::Control(ControlMessage::Eof)) => {
                self.send(&ControlMessage::AckEof).await?;
                return Ok(Flow::Eof);
            }
            Some(Datagram::Control(ControlMessage::Command(command))) => {
                debug!("peer repeated its command {}", command);
                if let Some(reply) = self.handshake_reply.clone() {
                    self.send(&reply).await?;
                }
            }
            Some(Datagram::Control(ControlMessage::Error(msg))) => {
                return Err(TransferError::Rejected(msg).into());
            }
            Some(Datagram::Control(other)) => {
                debug!("ignoring unexpected control message {}", other);
            }
            None => {
                self.stats.malformed_datagrams += 1;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self, packet: DataPacket) -> anyhow::Result<()> {
        let seq = packet.sequence_number;
        trace!("received chunk {} with {} bytes", seq, packet.payload.len());

        if packet.payload.is_empty() || packet.payload.len() > self.config.chunk_size {
            warn!("discarding chunk {} with invalid length {}", seq, packet.payload.len());
            self.stats.malformed_datagrams += 1;
            return Ok(());
        }

        match self.reassembly.on_chunk(seq, packet.payload) {
            ChunkOutcome::InOrder { writable, ack } => {
                for payload in &writable {
                    self.partial.write_chunk(payload).await?;
                }
                self.stats.chunks_written += writable.len() as u64;
                self.partial.flush_buffered().await?;
                self.send(&ControlMessage::Ack(ack)).await?;
            }
            ChunkOutcome::Ahead { ack, duplicate } => {
                if duplicate {
                    self.stats.duplicate_chunks += 1;
                }
                else {
                    self.stats.out_of_order_chunks += 1;
                }
                if let Some(ack) = ack {
                    self.send(&ControlMessage::Ack(ack)).await?;
                }
            }
            ChunkOutcome::Duplicate { ack } => {
                self.stats.duplicate_chunks += 1;
                self.send(&ControlMessage::Ack(ack)).await?;
            }
            ChunkOutcome::OutOfRange => {
                warn!("discarding chunk {}, expecting {}", seq, self.reassembly.expected_next());
                self.stats.malformed_datagrams += 1;
            }
        }
        Ok(())
    }

    /// The peer may have lost our last message: re-send the handshake reply if nothing arrived
    ///  yet, the latest cumulative ACK otherwise
    async fn poke(&mut self) -> anyhow::Result<()> {
        if self.stats.chunks_written == 0 {
            if let Some(reply) = &self.handshake_reply {
                return self.send(reply).await;
            }
        }
        if let Some(ack) = self.reassembly.last_written() {
            self.send(&ControlMessage::Ack(ack)).await?;
        }
        Ok(())
    }

    fn send<'a>(&'a self, msg: &'a ControlMessage) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 'a {
        send_control(self.tx.as_ref(), msg)
    }

    /// Keeps the bytes written so far as a resume checkpoint
    async fn abort(mut self, e: anyhow::Error) -> anyhow::Result<TransferReport> {
        warn!("receiving {} failed after {} bytes: {}", self.filename, self.partial.len(), e);
        if let Err(flush_error) = self.partial.flush().await {
            error!("could not flush partial file {:?}: {}", self.partial.partial_path(), flush_error);
        }
        Err(e)
    }
}

async fn send_control(tx: &dyn DatagramTx, msg: &ControlMessage) -> anyhow::Result<()> {
    trace!("sending {}", msg);
    tx.send_datagram(&Datagram::Control(msg.clone()).encode()).await
        .with_context(|| format!("sending {}", msg))
}

/// `SUCCESS:` is not acknowledged, so it is sent several times. In between, late datagrams are
///  drained: repeated EOFs are answered with ACKEOF and retransmitted chunks are acknowledged again.
async fn confirm_success(
    config: &TransferConfig,
    tx: &dyn DatagramTx,
    rx: &mut dyn DatagramRx,
    reassembly: &Reassembly,
    total_size: u64,
    linger_until: Instant,
) -> anyhow::Result<()> {
    let success = ControlMessage::Success(total_size.to_string());

    let mut num_sent = 0;
    let mut next_send = Instant::now();
    loop {
        let now = Instant::now();
        if num_sent < config.success_repeats && now >= next_send {
            send_control(tx, &success).await?;
            num_sent += 1;
            next_send = now + config.success_interval;
            continue;
        }
        if num_sent >= config.success_repeats && now >= linger_until {
            return Ok(());
        }

        let wake_up = if num_sent < config.success_repeats { next_send } else { linger_until };
        match timeout_at(wake_up, rx.recv_datagram()).await {
            Ok(Ok(buf)) => match Datagram::decode(&buf) {
                Some(Datagram::Control(ControlMessage::Eof)) => {
                    send_control(tx, &ControlMessage::AckEof).await?;
                }
                Some(Datagram::Data(packet)) if packet.sequence_number < reassembly.expected_next() => {
                    send_control(tx, &ControlMessage::Ack(packet.sequence_number)).await?;
                }
                _ => {}
            },
            Ok(Err(e)) => {
                debug!("link closed while confirming success: {}", e);
                return Ok(());
            }
            Err(_) => {}
        }
    }
}
