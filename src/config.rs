use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;

/// Largest UDP payload over IPv4 (`65535 - 20 - 8`)
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Settings shared by both ends of a transfer. Chunk size and window size must be the same on
///  both peers: resume offsets and sequence numbers are derived from the chunk size.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Payload bytes per data datagram. The datagram carries a 4 byte sequence number on top of
    ///  this, so the default of 1400 keeps datagrams below a typical Ethernet MTU.
    pub chunk_size: usize,
    /// Maximum number of chunks in flight without a cumulative ACK
    pub window_size: u32,

    /// How long the sender waits for an ACK before treating the whole window as lost
    pub ack_timeout: Duration,
    /// The sender gives up after this many ACK timeouts in a row without any progress
    pub max_consecutive_ack_timeouts: u32,

    pub ready_timeout: Duration,
    pub ready_retries: u32,

    pub eof_timeout: Duration,
    pub eof_retries: u32,

    /// Wall-clock ceiling for a single transfer, measured from its start
    pub global_timeout: Duration,

    /// A receiver that hears nothing for `silence_timeout` this many times in a row aborts
    pub silence_timeout: Duration,
    pub silence_retries: u32,

    /// After acknowledging EOF, the receiver keeps draining late data for this long
    pub eof_grace: Duration,

    /// `SUCCESS:` is sent this many times since it is never acknowledged
    pub success_repeats: u32,
    pub success_interval: Duration,

    /// Suffix of the receiver's partial file, promoted to the final name on success
    pub partial_suffix: String,
    /// Suffix of the uploading client's offset record next to the local file
    pub upload_marker_suffix: String,
}

impl TransferConfig {
    pub fn new() -> TransferConfig {
        TransferConfig {
            chunk_size: 1400,
            window_size: 8,
            ack_timeout: Duration::from_millis(100),
            max_consecutive_ack_timeouts: 50,
            ready_timeout: Duration::from_secs(1),
            ready_retries: 3,
            eof_timeout: Duration::from_millis(100),
            eof_retries: 5,
            global_timeout: Duration::from_secs(5 * 60),
            silence_timeout: Duration::from_secs(1),
            silence_retries: 3,
            eof_grace: Duration::from_millis(500),
            success_repeats: 3,
            success_interval: Duration::from_millis(50),
            partial_suffix: ".part".to_string(),
            upload_marker_suffix: ".upload-offset".to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_UDP_PAYLOAD - 4 {
            bail!("chunk size must be between 1 and {}, was {}", MAX_UDP_PAYLOAD - 4, self.chunk_size);
        }
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.max_consecutive_ack_timeouts == 0 || self.ready_retries == 0 || self.eof_retries == 0 || self.silence_retries == 0 {
            bail!("retry counts must be at least 1");
        }
        if self.success_repeats == 0 {
            bail!("SUCCESS must be sent at least once");
        }
        if self.partial_suffix.is_empty() || self.upload_marker_suffix.is_empty() {
            bail!("file suffixes must not be empty");
        }
        if self.partial_suffix == self.upload_marker_suffix {
            bail!("partial file suffix and upload marker suffix must differ");
        }
        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Uploaded files are stored here, downloads are served from here
    pub storage_dir: PathBuf,
    /// Requested OS receive and send buffer size. The OS may grant less, see [crate::link::bind_udp].
    pub socket_buffer_size: usize,
    /// Datagrams queued per session before the listener starts dropping them
    pub session_queue_len: usize,
    pub transfer: TransferConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, storage_dir: impl Into<PathBuf>) -> ServerConfig {
        ServerConfig {
            bind_addr,
            storage_dir: storage_dir.into(),
            socket_buffer_size: 8 * 1024 * 1024,
            session_queue_len: 1024,
            transfer: TransferConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_queue_len == 0 {
            bail!("session queue length must be at least 1");
        }
        self.transfer.validate()
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub socket_buffer_size: usize,
    pub transfer: TransferConfig,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr,
            socket_buffer_size: 8 * 1024 * 1024,
            transfer: TransferConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.transfer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        TransferConfig::new().validate().unwrap();
        ServerConfig::new("127.0.0.1:0".parse().unwrap(), "/tmp").validate().unwrap();
        ClientConfig::new("127.0.0.1:9000".parse().unwrap()).validate().unwrap();
    }

    #[rstest]
    #[case::zero_chunk(|c: &mut TransferConfig| c.chunk_size = 0)]
    #[case::huge_chunk(|c: &mut TransferConfig| c.chunk_size = MAX_UDP_PAYLOAD)]
    #[case::zero_window(|c: &mut TransferConfig| c.window_size = 0)]
    #[case::zero_eof_retries(|c: &mut TransferConfig| c.eof_retries = 0)]
    #[case::zero_ready_retries(|c: &mut TransferConfig| c.ready_retries = 0)]
    #[case::zero_silence_retries(|c: &mut TransferConfig| c.silence_retries = 0)]
    #[case::no_success(|c: &mut TransferConfig| c.success_repeats = 0)]
    #[case::empty_suffix(|c: &mut TransferConfig| c.partial_suffix = "".to_string())]
    #[case::same_suffix(|c: &mut TransferConfig| c.upload_marker_suffix = ".part".to_string())]
    fn test_validate_rejects(#[case] modify: fn(&mut TransferConfig)) {
        let mut config = TransferConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_largest_chunk_is_valid() {
        let mut config = TransferConfig::new();
        config.chunk_size = MAX_UDP_PAYLOAD - 4;
        config.validate().unwrap();
    }
}
