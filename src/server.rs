use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::codec::command::Command;
use crate::config::{ServerConfig, MAX_UDP_PAYLOAD};
use crate::dispatcher::{CommandDispatcher, Route};
use crate::link::{bind_udp, AddressedUdp, PeerLink};

struct ActiveSession {
    id: Uuid,
    queue: mpsc::Sender<Bytes>,
}

/// The file server: a single UDP socket, one task per running transfer.
///
/// The receive loop is the only reader of the socket. Datagrams from a peer with an active
///  transfer are forwarded to that transfer's task, everything else is treated as a new
///  command.
pub struct Server {
    socket: Arc<UdpSocket>,
    config: Arc<ServerConfig>,
    dispatcher: Arc<CommandDispatcher>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage_dir).await
            .with_context(|| format!("creating storage directory {:?}", config.storage_dir))?;

        let socket = Arc::new(bind_udp(config.bind_addr, config.socket_buffer_size)?);
        info!("bound server socket to {:?}, storing files in {:?}", socket.local_addr()?, config.storage_dir);

        let config = Arc::new(config);
        Ok(Server {
            socket,
            dispatcher: Arc::new(CommandDispatcher::new(config.clone())),
            config,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves requests until the task is aborted
    pub async fn run(self) {
        info!("starting receive loop");

        let mut sessions: FxHashMap<SocketAddr, ActiveSession> = FxHashMap::default();
        let (finished_send, mut finished_recv) = mpsc::unbounded_channel::<(SocketAddr, Uuid)>();

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        loop {
            tokio::select! {
                Some((peer, id)) = finished_recv.recv() => {
                    if let Entry::Occupied(e) = sessions.entry(peer) {
                        // the peer may have started a new transfer in the meantime
                        if e.get().id == id {
                            e.remove();
                        }
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };
                    let datagram = Bytes::copy_from_slice(&buf[..num_read]);
                    self.on_datagram(&mut sessions, &finished_send, from, datagram).await;
                }
            }
        }
    }

    async fn on_datagram(
        &self,
        sessions: &mut FxHashMap<SocketAddr, ActiveSession>,
        finished: &mpsc::UnboundedSender<(SocketAddr, Uuid)>,
        from: SocketAddr,
        datagram: Bytes,
    ) {
        trace!("received {} bytes from {:?}", datagram.len(), from);

        let datagram = match sessions.get(&from) {
            None => datagram,
            Some(session) => match session.queue.try_send(datagram) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!("session queue for {:?} is full - dropping datagram", from);
                    return;
                }
                Err(TrySendError::Closed(datagram)) => {
                    sessions.remove(&from);
                    datagram
                }
            },
        };

        match self.dispatcher.route(&datagram) {
            Route::Ignore => {}
            Route::Reply(reply) => {
                if let Err(e) = self.socket.send_to(reply.as_bytes(), from).await {
                    warn!("could not send reply to {:?}: {}", from, e);
                }
            }
            Route::Transfer(command) => {
                let session = self.start_session(from, command, finished.clone());
                debug!("started transfer {} for {:?}", session.id, from);
                sessions.insert(from, session);
            }
        }
    }

    fn start_session(
        &self,
        peer: SocketAddr,
        command: Command,
        finished: mpsc::UnboundedSender<(SocketAddr, Uuid)>,
    ) -> ActiveSession {
        let transfer_id = Uuid::new_v4();
        let (queue_send, queue_recv) = mpsc::channel(self.config.session_queue_len);

        let link = PeerLink::new(
            peer,
            Arc::new(AddressedUdp { socket: self.socket.clone(), peer }),
            Box::new(queue_recv),
        );

        let span = span!(Level::INFO, "transfer", %transfer_id, ?peer, %command);
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.run_transfer(command, link).await {
                Ok(report) => info!("{}", report),
                Err(e) => warn!("transfer failed: {:#}", e),
            }
            let _ = finished.send((peer, transfer_id));
        }.instrument(span));

        ActiveSession { id: transfer_id, queue: queue_send }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use crate::codec::control::ControlMessage;
    use crate::codec::data_packet::DataPacket;
    use crate::codec::sequence::SequenceNumber;

    async fn start_server(storage_dir: &std::path::Path) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), storage_dir);
        config.transfer.silence_timeout = Duration::from_secs(2);
        config.transfer.eof_grace = Duration::from_millis(50);
        config.transfer.success_interval = Duration::from_millis(5);

        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        (addr, tokio::spawn(server.run()))
    }

    async fn request(socket: &UdpSocket, request: &[u8]) -> String {
        socket.send(request).await.unwrap();
        let mut buf = [0u8; 1024];
        let n = timeout(Duration::from_secs(5), socket.recv(&mut buf)).await.unwrap().unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    async fn client_socket(server_addr: SocketAddr) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server_addr).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn test_stateless_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (server_addr, server) = start_server(dir.path()).await;
        let socket = client_socket(server_addr).await;

        assert_eq!(request(&socket, b"ECHO ping").await, "ping");
        assert_eq!(request(&socket, b"FROB").await, "ERROR: Unknown command 'FROB'");
        assert_eq!(request(&socket, b"DOWNLOAD nothing.bin").await, "FILE_NOT_FOUND");
        assert_eq!(request(&socket, b"UPLOAD ../escape.bin").await, "ERROR: Invalid filename");
        chrono::DateTime::parse_from_rfc3339(&request(&socket, b"TIME").await).unwrap();

        server.abort();
    }

    #[tokio::test]
    async fn test_upload_session_is_fed_from_the_receive_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (server_addr, server) = start_server(dir.path()).await;
        let socket = client_socket(server_addr).await;

        assert_eq!(request(&socket, b"UPLOAD hello.txt 0").await, "READY: 0");
        // a repeated command reaches the session, which repeats its handshake
        assert_eq!(request(&socket, b"UPLOAD hello.txt 0").await, "READY: 0");

        let chunk = DataPacket::new(SequenceNumber::ZERO, Bytes::from_static(b"hello world")).to_bytes();
        assert_eq!(request(&socket, &chunk).await, "ACK:0");
        assert_eq!(request(&socket, b"EOF").await, ControlMessage::AckEof.to_string());

        let mut buf = [0u8; 1024];
        let success = loop {
            let n = timeout(Duration::from_secs(5), socket.recv(&mut buf)).await.unwrap().unwrap();
            let reply = String::from_utf8(buf[..n].to_vec()).unwrap();
            if reply.starts_with("SUCCESS") {
                break reply;
            }
        };
        assert_eq!(success, "SUCCESS: 11");
        assert_eq!(tokio::fs::read(dir.path().join("hello.txt")).await.unwrap(), b"hello world");

        server.abort();
    }
}
