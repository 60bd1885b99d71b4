use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;
use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn, Instrument, Span};
use crate::codec::command::Command;
use crate::codec::control::ControlMessage;
use crate::codec::data_packet::DataPacket;
use crate::codec::sequence::SequenceNumber;
use crate::codec::Datagram;
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::link::{DatagramRx, DatagramTx, PeerLink};
use crate::transfer::window::{AckOutcome, SendWindow};
use crate::transfer::{align_down, ChunkLayout, TransferReport, TransferStats};

/// How the sender gets the receiver ready before sending data
#[derive(Clone, Debug)]
pub enum Handshake {
    /// Send the command and wait for `READY:` (a client uploading a file)
    AwaitReady(Command),
    /// Send this announcement and start right away (a server serving a download). The
    ///  announcement is repeated whenever the peer repeats its command.
    Announce(ControlMessage),
}

enum Inbound {
    Datagram(Datagram),
    Malformed,
}

/// Sending end of a single transfer: drives a sliding window over the file's chunks, and
///  retransmits the unacknowledged part of the window whenever an ACK does not arrive in time.
///
/// Incoming datagrams are decoded by a separate task and handed over through a channel, so the
///  send loop is the only place that touches the window.
pub struct FileSender {
    config: Arc<TransferConfig>,
    filename: String,
    tx: Arc<dyn DatagramTx>,
    inbound: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
    file: File,
    layout: ChunkLayout,
    start_offset: u64,
    window: SendWindow,
    /// chunks that were read from the file and are not acknowledged yet
    chunks: BTreeMap<SequenceNumber, Bytes>,
    handshake: Handshake,
    stats: TransferStats,
}

impl Drop for FileSender {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl FileSender {
    pub fn new(
        config: Arc<TransferConfig>,
        filename: impl Into<String>,
        link: PeerLink,
        file: File,
        total_size: u64,
        start_offset: u64,
        handshake: Handshake,
    ) -> anyhow::Result<FileSender> {
        let layout = ChunkLayout::new(config.chunk_size, total_size)?;
        let first = layout.first_sequence(start_offset)?;
        let window = SendWindow::new(first, layout.end(), config.window_size);

        let (inbound, reader) = spawn_reader(link.rx);

        Ok(FileSender {
            config,
            filename: filename.into(),
            tx: link.tx,
            inbound,
            reader,
            file,
            layout,
            start_offset,
            window,
            chunks: Default::default(),
            handshake,
            stats: Default::default(),
        })
    }

    /// The number of bytes the receiver confirmed, i.e. the offset a later transfer can resume
    ///  from. This is always a chunk boundary.
    pub fn acknowledged_offset(&self) -> u64 {
        self.layout.offset_of(self.window.next_unacked())
            .min(align_down(self.layout.total_size(), self.layout.chunk_size()))
    }

    pub async fn run(&mut self) -> anyhow::Result<TransferReport> {
        let started = Instant::now();
        let deadline = started + self.config.global_timeout;
        debug!("sending {} ({} bytes) from offset {}", self.filename, self.layout.total_size(), self.start_offset);

        let result = self.do_run(deadline).await;
        self.stats.chunks_transmitted = self.window.transmitted();
        self.stats.chunks_retransmitted = self.window.retransmitted();

        if let Err(e) = result {
            warn!("sending {} failed with {} bytes acknowledged: {}", self.filename, self.acknowledged_offset(), e);
            return Err(e);
        }

        info!("sent {} ({} bytes from offset {})", self.filename, self.layout.total_size(), self.start_offset);
        Ok(TransferReport {
            filename: self.filename.clone(),
            start_offset: self.start_offset,
            total_size: self.layout.total_size(),
            elapsed: started.elapsed(),
            stats: self.stats.clone(),
        })
    }

    async fn do_run(&mut self, deadline: Instant) -> anyhow::Result<()> {
        self.handshake(deadline).await?;
        self.send_chunks(deadline).await?;
        self.send_eof(deadline).await
    }

    async fn handshake(&mut self, deadline: Instant) -> anyhow::Result<()> {
        let request = match &self.handshake {
            Handshake::Announce(announcement) => {
                let announcement = announcement.clone();
                return self.send(&announcement).await;
            }
            Handshake::AwaitReady(command) => ControlMessage::Command(command.clone()),
        };

        for attempt in 1..=self.config.ready_retries {
            self.send(&request).await?;

            let until = Instant::now() + self.config.ready_timeout;
            while let Some(datagram) = self.next_inbound(until, deadline).await? {
                match datagram {
                    Datagram::Control(ControlMessage::Ready(info)) => {
                        if let Ok(offset) = info.parse::<u64>() {
                            if offset != self.start_offset {
                                return Err(TransferError::Protocol(format!("peer is ready at offset {}, requested was {}", offset, self.start_offset)).into());
                            }
                        }
                        debug!("peer is ready: {}", info);
                        return Ok(());
                    }
                    Datagram::Control(ControlMessage::Error(msg)) => return Err(TransferError::Rejected(msg).into()),
                    Datagram::Control(ControlMessage::FileNotFound) => return Err(TransferError::NotFound(self.filename.clone()).into()),
                    Datagram::Control(other) => return Err(TransferError::Protocol(format!("expected READY, received {}", other)).into()),
                    Datagram::Data(packet) => {
                        trace!("ignoring data packet {} while waiting for READY", packet.sequence_number);
                    }
                }
            }
            debug!("no READY after attempt {} of {}", attempt, self.config.ready_retries);
        }
        Err(TransferError::NoResponse(self.config.ready_retries).into())
    }

    async fn send_chunks(&mut self, deadline: Instant) -> anyhow::Result<()> {
        let mut num_consecutive_timeouts = 0;
        let mut ack_deadline = Instant::now() + self.config.ack_timeout;

        while !self.window.is_complete() {
            for seq in self.window.take_to_send() {
                self.send_chunk(seq).await?;
            }

            let datagram = match self.next_inbound(ack_deadline, deadline).await? {
                Some(datagram) => datagram,
                None => {
                    num_consecutive_timeouts += 1;
                    self.stats.ack_timeouts += 1;
                    if num_consecutive_timeouts >= self.config.max_consecutive_ack_timeouts {
                        return Err(TransferError::AckTimeouts(num_consecutive_timeouts).into());
                    }
                    let num_lost = self.window.on_timeout();
                    debug!("ACK timeout, re-sending {} chunks from {}", num_lost, self.window.next_unacked());
                    ack_deadline = Instant::now() + self.config.ack_timeout;
                    continue;
                }
            };

            let Some(ack) = self.on_datagram(datagram).await? else {
                continue;
            };
            match self.window.on_ack(ack) {
                AckOutcome::Advanced(n) => {
                    trace!("ACK {} advanced the window by {}", ack, n);
                    num_consecutive_timeouts = 0;
                    ack_deadline = Instant::now() + self.config.ack_timeout;
                    let next_unacked = self.window.next_unacked();
                    self.chunks.retain(|seq, _| *seq >= next_unacked);
                }
                AckOutcome::Stale => {
                    trace!("stale ACK {}", ack);
                }
                AckOutcome::Beyond => {
                    warn!("ACK {} for a chunk that was never sent - ignoring", ack);
                }
            }
        }
        Ok(())
    }

    /// Returns the acknowledged sequence number if the datagram is an ACK, either as text or as
    ///  a binary sequence number without payload
    async fn on_datagram(&mut self, datagram: Datagram) -> anyhow::Result<Option<SequenceNumber>> {
        match datagram {
            Datagram::Control(ControlMessage::Ack(seq)) => return Ok(Some(seq)),
            Datagram::Data(packet) if packet.payload.is_empty() => return Ok(Some(packet.sequence_number)),
            Datagram::Control(ControlMessage::Error(msg)) => return Err(TransferError::Rejected(msg).into()),
            Datagram::Control(ControlMessage::Command(command)) => {
                if let Handshake::Announce(announcement) = &self.handshake {
                    debug!("peer repeated {}, repeating {}", command, announcement);
                    let announcement = announcement.clone();
                    self.send(&announcement).await?;
                }
            }
            other => {
                debug!("ignoring unexpected datagram {:?}", other);
            }
        }
        Ok(None)
    }

    async fn send_eof(&mut self, deadline: Instant) -> anyhow::Result<()> {
        for attempt in 1..=self.config.eof_retries {
            self.send(&ControlMessage::Eof).await?;

            let until = Instant::now() + self.config.eof_timeout;
            while let Some(datagram) = self.next_inbound(until, deadline).await? {
                match datagram {
                    Datagram::Control(ControlMessage::AckEof) => {
                        debug!("EOF acknowledged");
                        return self.await_final_reply(deadline).await;
                    }
                    Datagram::Control(ControlMessage::Success(info)) => {
                        debug!("peer confirmed success: {}", info);
                        return Ok(());
                    }
                    other => {
                        // late ACKs and repeated commands
                        self.on_datagram(other).await?;
                    }
                }
            }
            debug!("no ACKEOF after attempt {} of {}", attempt, self.config.eof_retries);
        }

        warn!("EOF was not acknowledged after {} attempts, assuming the peer has the complete file", self.config.eof_retries);
        Ok(())
    }

    /// The peer finalizes the file after acknowledging EOF, and may still report a failure
    async fn await_final_reply(&mut self, deadline: Instant) -> anyhow::Result<()> {
        let until = Instant::now() + self.config.eof_timeout;
        while let Some(datagram) = self.next_inbound(until, deadline).await? {
            match datagram {
                Datagram::Control(ControlMessage::Success(info)) => {
                    debug!("peer confirmed success: {}", info);
                    return Ok(());
                }
                Datagram::Control(ControlMessage::Error(msg)) => return Err(TransferError::Rejected(msg).into()),
                _ => {}
            }
        }
        debug!("no SUCCESS after ACKEOF");
        Ok(())
    }

    async fn send_chunk(&mut self, seq: SequenceNumber) -> anyhow::Result<()> {
        let payload = match self.chunks.get(&seq) {
            Some(payload) => payload.clone(),
            None => {
                let payload = self.read_chunk(seq).await?;
                self.chunks.insert(seq, payload.clone());
                payload
            }
        };

        trace!("sending chunk {} with {} bytes", seq, payload.len());
        let datagram = Datagram::Data(DataPacket::new(seq, payload));
        self.tx.send_datagram(&datagram.encode()).await
            .with_context(|| format!("sending chunk {}", seq))
    }

    async fn read_chunk(&mut self, seq: SequenceNumber) -> anyhow::Result<Bytes> {
        let offset = self.layout.offset_of(seq);
        let mut buf = vec![0u8; self.layout.chunk_len(seq)];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await
            .with_context(|| format!("reading {} bytes at offset {} of {}", buf.len(), offset, self.filename))?;
        Ok(Bytes::from(buf))
    }

    /// Waits for the next well-formed datagram until `until`, returning `None` on timeout
    async fn next_inbound(&mut self, until: Instant, deadline: Instant) -> anyhow::Result<Option<Datagram>> {
        loop {
            if Instant::now() >= deadline {
                return Err(TransferError::GlobalTimeout(self.config.global_timeout).into());
            }

            match timeout_at(until.min(deadline), self.inbound.recv()).await {
                Ok(Some(Inbound::Datagram(datagram))) => return Ok(Some(datagram)),
                Ok(Some(Inbound::Malformed)) => {
                    self.stats.malformed_datagrams += 1;
                }
                Ok(None) => bail!("datagram link to peer was closed"),
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(TransferError::GlobalTimeout(self.config.global_timeout).into());
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&self, msg: &ControlMessage) -> anyhow::Result<()> {
        trace!("sending {}", msg);
        self.tx.send_datagram(&Datagram::Control(msg.clone()).encode()).await
            .with_context(|| format!("sending {}", msg))
    }
}

fn spawn_reader(mut rx: Box<dyn DatagramRx>) -> (mpsc::Receiver<Inbound>, JoinHandle<()>) {
    let (send, recv) = mpsc::channel(1024);

    let handle = tokio::spawn(async move {
        loop {
            let buf = match rx.recv_datagram().await {
                Ok(buf) => buf,
                Err(e) => {
                    debug!("stopping datagram reader: {}", e);
                    break;
                }
            };

            let inbound = match Datagram::decode(&buf) {
                Some(datagram) => Inbound::Datagram(datagram),
                None => Inbound::Malformed,
            };
            if send.send(inbound).await.is_err() {
                break;
            }
        }
    }.instrument(Span::current()));

    (recv, handle)
}
