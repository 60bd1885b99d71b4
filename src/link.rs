use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use crate::config::MAX_UDP_PAYLOAD;

/// Abstraction for sending a datagram to the (single) peer of a transfer, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramTx: Send + Sync + 'static {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()>;
}

/// Receiving side of a transfer's datagram channel. Only datagrams from the transfer's peer are
///  delivered here; demultiplexing is done by whoever creates the link.
#[async_trait]
pub trait DatagramRx: Send + 'static {
    async fn recv_datagram(&mut self) -> anyhow::Result<Bytes>;
}

/// The two directions of a datagram channel to a single peer
pub struct PeerLink {
    pub peer: SocketAddr,
    pub tx: Arc<dyn DatagramTx>,
    pub rx: Box<dyn DatagramRx>,
}

impl PeerLink {
    pub fn new(peer: SocketAddr, tx: Arc<dyn DatagramTx>, rx: Box<dyn DatagramRx>) -> PeerLink {
        PeerLink { peer, tx, rx }
    }

    /// A client socket that is `connect`ed to the server, so the OS filters out datagrams
    ///  from anywhere else
    pub async fn connected(socket: UdpSocket, peer: SocketAddr) -> anyhow::Result<PeerLink> {
        socket.connect(peer).await
            .with_context(|| format!("connecting UDP socket to {:?}", peer))?;
        let socket = Arc::new(socket);
        Ok(PeerLink {
            peer,
            tx: Arc::new(ConnectedUdp(socket.clone())),
            rx: Box::new(ConnectedUdp(socket)),
        })
    }
}

/// Creates a UDP socket with enlarged OS buffers. If the OS rejects the requested buffer size,
///  the request is halved until it is accepted.
pub fn bind_udp(addr: SocketAddr, buffer_size: usize) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if try_set_buffer_size(buffer_size, |size| socket.set_recv_buffer_size(size)).is_some() {
        debug!("UDP receive buffer size is {:?}", socket.recv_buffer_size());
    }
    if try_set_buffer_size(buffer_size, |size| socket.set_send_buffer_size(size)).is_some() {
        debug!("UDP send buffer size is {:?}", socket.send_buffer_size());
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())
        .with_context(|| format!("binding UDP socket to {:?}", addr))?;

    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

const MIN_SOCKET_BUFFER: usize = 64 * 1024;

/// returns the accepted size, or `None` if the OS default was kept
fn try_set_buffer_size(requested: usize, mut set: impl FnMut(usize) -> std::io::Result<()>) -> Option<usize> {
    let mut size = requested;
    while size >= MIN_SOCKET_BUFFER {
        match set(size) {
            Ok(()) => return Some(size),
            Err(e) => {
                debug!("socket buffer size {} rejected ({}), trying {}", size, e, size / 2);
                size /= 2;
            }
        }
    }
    warn!("could not set socket buffer size to {} or less, keeping OS default", requested);
    None
}

pub struct ConnectedUdp(pub Arc<UdpSocket>);

#[async_trait]
impl DatagramTx for ConnectedUdp {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes", buf.len());
        match self.0.send(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                debug!("peer port is unreachable, treating the datagram as lost");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DatagramRx for ConnectedUdp {
    async fn recv_datagram(&mut self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::zeroed(MAX_UDP_PAYLOAD);
        loop {
            match self.0.recv(&mut buf).await {
                Ok(num_read) => {
                    buf.truncate(num_read);
                    return Ok(buf.freeze());
                }
                // an ICMP 'port unreachable' for an earlier datagram is reported on a later call
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!("peer port is unreachable");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The sending half of a server session: all sessions share the server's socket
pub struct AddressedUdp {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

#[async_trait]
impl DatagramTx for AddressedUdp {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), self.peer);
        self.socket.send_to(buf, self.peer).await?;
        Ok(())
    }
}

/// The receiving half of a server session: the server's listener forwards the peer's datagrams
#[async_trait]
impl DatagramRx for mpsc::Receiver<Bytes> {
    async fn recv_datagram(&mut self) -> anyhow::Result<Bytes> {
        match self.recv().await {
            Some(buf) => Ok(buf),
            None => bail!("datagram channel was closed"),
        }
    }
}
