use crate::backoff::BackoffPolicy;
use crate::protocol::{Parameters, IPERF_COMPAT_VERSION};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Default iperf3 port.
pub const DEFAULT_PORT: u16 = 5201;

/// Default TCP write size, matching iperf3.
pub const DEFAULT_TCP_LEN: usize = 128 * 1024;

/// Default UDP datagram size: one Ethernet MTU's worth of payload.
pub const DEFAULT_UDP_LEN: usize = 1460;

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Largest TCP write size a session will allocate for.
pub const MAX_TCP_LEN: usize = 16 * 1024 * 1024;

/// iperf3's UDP target when none is given, in bits per second.
pub const DEFAULT_UDP_BANDWIDTH: u64 = 1_000_000;

/// Transport protocol type for network testing.
///
/// Specifies whether to use TCP or UDP for the data channel.
///
/// # Examples
///
/// ```
/// use nperf3::{Config, Protocol};
///
/// // TCP test
/// let tcp_config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Tcp);
///
/// // UDP test with bandwidth limit
/// let udp_config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(100_000_000); // 100 Mbps
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol - provides reliable, ordered delivery
    Tcp,
    /// User Datagram Protocol - provides best-effort delivery with lower overhead
    Udp,
}

impl Protocol {
    /// Largest payload length a session accepts for this protocol.
    pub fn max_len(self) -> usize {
        match self {
            Protocol::Tcp => MAX_TCP_LEN,
            Protocol::Udp => MAX_UDP_PAYLOAD,
        }
    }
}

/// Which way the payload flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Client sends, server receives
    Normal,
    /// Server sends, client receives
    Reverse,
}

/// Test mode: client or server.
///
/// Determines whether this instance acts as a server (listening for connections)
/// or as a client (initiating connections to a server). The same value names
/// the role a session plays in the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - listens for incoming connections
    Server,
    /// Client mode - connects to a server and initiates tests
    Client,
}

/// Configuration for nperf3 clients and servers.
///
/// This structure holds all configuration parameters for both client and server modes.
/// Use the builder pattern methods to customize the configuration.
///
/// # Examples
///
/// ## Basic TCP Client
///
/// ```
/// use nperf3::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_duration(Duration::from_secs(30))
///     .with_buffer_size(256 * 1024); // 256 KB writes
/// ```
///
/// ## UDP Client with Bandwidth Limit
///
/// ```
/// use nperf3::{Config, Protocol};
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(100_000_000) // 100 Mbps
///     .with_duration(Duration::from_secs(10));
/// ```
///
/// ## Server Configuration
///
/// ```
/// use nperf3::Config;
///
/// let config = Config::server(5201);
/// ```
///
/// ## Reverse Mode Test
///
/// ```
/// use nperf3::Config;
/// use std::time::Duration;
///
/// // Server sends data, client receives
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_reverse(true)
///     .with_duration(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use (TCP or UDP)
    pub protocol: Protocol,

    /// Port number to use
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode)
    pub bind_addr: Option<IpAddr>,

    /// Test duration, whole seconds
    pub duration: Duration,

    /// Stop after sending this many bytes
    pub bytes: Option<u64>,

    /// Target bandwidth in bits per second (for UDP)
    pub bandwidth: Option<u64>,

    /// Payload length per write or datagram; protocol default when unset
    pub buffer_size: Option<usize>,

    /// Reverse mode (server sends, client receives)
    pub reverse: bool,

    /// Interval for periodic bandwidth reports
    pub interval: Duration,

    /// Retry policy for the control connection
    pub connect_retry: BackoffPolicy,

    /// Pause before a server accepts again after a failed session
    pub relisten_delay: Duration,

    /// Backoff when the data socket reports it would block
    pub would_block: BackoffPolicy,

    /// Abort the session when the UDP probe reply is wrong
    pub strict_udp_ack: bool,

    /// How long a UDP client waits for the probe reply
    pub udp_ack_timeout: Duration,

    /// How long either side waits for the data connection to appear
    pub stream_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            duration: Duration::from_secs(10),
            bytes: None,
            bandwidth: None,
            buffer_size: None,
            reverse: false,
            interval: Duration::from_secs(1),
            connect_retry: BackoffPolicy::fixed(Duration::from_secs(5), 5),
            relisten_delay: Duration::from_secs(30),
            would_block: BackoffPolicy::exponential(
                Duration::from_micros(10),
                Duration::from_millis(10),
                1000,
            ),
            strict_udp_ack: false,
            udp_ack_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use nperf3::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 5201);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration.
    ///
    /// # Arguments
    ///
    /// * `port` - The port number to listen on (typically 5201)
    ///
    /// # Examples
    ///
    /// ```
    /// use nperf3::Config;
    ///
    /// let config = Config::server(5201);
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration.
    ///
    /// # Arguments
    ///
    /// * `server_addr` - The IP address or hostname of the server
    /// * `port` - The port number to connect to (typically 5201)
    ///
    /// # Examples
    ///
    /// ```
    /// use nperf3::Config;
    ///
    /// let config = Config::client("192.168.1.100".to_string(), 5201);
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the test duration.
    ///
    /// iperf3 negotiates whole seconds; any fraction is dropped on the wire.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Ends the test after `bytes` have been sent instead of after the duration.
    ///
    /// # Examples
    ///
    /// ```
    /// use nperf3::Config;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_bytes(1_000_000);
    /// assert_eq!(config.bytes, Some(1_000_000));
    /// ```
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    /// Sets the target bandwidth for UDP tests.
    ///
    /// This option only applies to UDP tests. For TCP tests, it is ignored.
    ///
    /// # Arguments
    ///
    /// * `bandwidth` - Target bandwidth in bits per second
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    /// Sets the payload length per write (TCP) or per datagram (UDP).
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Enables or disables reverse mode.
    ///
    /// In reverse mode, the server sends data and the client receives.
    /// In normal mode, the client sends data and the server receives.
    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    /// Sets the interval for periodic reporting.
    ///
    /// # Examples
    ///
    /// ```
    /// use nperf3::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_interval(Duration::from_millis(500));
    /// ```
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn with_connect_retry(mut self, policy: BackoffPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    pub fn with_relisten_delay(mut self, delay: Duration) -> Self {
        self.relisten_delay = delay;
        self
    }

    pub fn with_would_block(mut self, policy: BackoffPolicy) -> Self {
        self.would_block = policy;
        self
    }

    /// Makes a wrong UDP probe reply fatal instead of a warning.
    pub fn with_strict_udp_ack(mut self, strict: bool) -> Self {
        self.strict_udp_ack = strict;
        self
    }

    pub fn with_udp_ack_timeout(mut self, timeout: Duration) -> Self {
        self.udp_ack_timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn direction(&self) -> Direction {
        if self.reverse {
            Direction::Reverse
        } else {
            Direction::Normal
        }
    }

    /// Payload length, falling back to the protocol's default.
    pub fn payload_len(&self) -> usize {
        self.buffer_size.unwrap_or(match self.protocol {
            Protocol::Tcp => DEFAULT_TCP_LEN,
            Protocol::Udp => DEFAULT_UDP_LEN,
        })
    }

    /// Checks the settings a client is about to negotiate.
    pub fn validate(&self) -> Result<()> {
        let len = self.payload_len();
        if len == 0 {
            return Err(Error::Config("payload length must be non-zero".to_string()));
        }
        if len > self.protocol.max_len() {
            return Err(Error::Config(format!(
                "{:?} payload length {} exceeds {}",
                self.protocol,
                len,
                self.protocol.max_len()
            )));
        }
        if self.interval.as_millis() == 0 {
            return Err(Error::Config(
                "report interval must be at least 1 ms".to_string(),
            ));
        }
        if self.duration.as_secs() == 0 && self.bytes.unwrap_or(0) == 0 {
            return Err(Error::Config(
                "test needs a duration of at least 1 s or a byte count".to_string(),
            ));
        }
        if self.bandwidth == Some(0) {
            return Err(Error::Config("bandwidth must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Parameters a client sends at `PARAM_EXCHANGE`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if [`Config::validate`] fails.
    pub fn to_params(&self) -> Result<Parameters> {
        self.validate()?;
        Ok(Parameters {
            protocol: self.protocol,
            direction: self.direction(),
            len: self.payload_len(),
            pacing_timer: Duration::from_millis(self.interval.as_millis() as u64),
            duration: Duration::from_secs(self.duration.as_secs()),
            bytes: self.bytes.filter(|&n| n > 0),
            bandwidth: match self.protocol {
                Protocol::Udp => Some(self.bandwidth.unwrap_or(DEFAULT_UDP_BANDWIDTH)),
                Protocol::Tcp => None,
            },
            client_version: IPERF_COMPAT_VERSION.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5201);
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.relisten_delay, Duration::from_secs(30));
        assert_eq!(config.connect_retry.max_retries(), 5);
        assert!(!config.strict_udp_ack);
    }

    #[test]
    fn test_payload_len_defaults() {
        let tcp = Config::client("h".to_string(), 5201);
        assert_eq!(tcp.payload_len(), 128 * 1024);

        let udp = tcp.clone().with_protocol(Protocol::Udp);
        assert_eq!(udp.payload_len(), 1460);

        let explicit = udp.with_buffer_size(512);
        assert_eq!(explicit.payload_len(), 512);
    }

    #[test]
    fn test_to_params() {
        let params = Config::client("h".to_string(), 5201)
            .with_protocol(Protocol::Udp)
            .with_reverse(true)
            .with_duration(Duration::from_millis(2500))
            .with_interval(Duration::from_millis(500))
            .to_params()
            .unwrap();

        assert_eq!(params.direction, Direction::Reverse);
        assert_eq!(params.duration, Duration::from_secs(2));
        assert_eq!(params.pacing_timer, Duration::from_millis(500));
        assert_eq!(params.bandwidth, Some(DEFAULT_UDP_BANDWIDTH));
        assert_eq!(params.client_version, IPERF_COMPAT_VERSION);
    }

    #[test]
    fn test_tcp_params_carry_no_bandwidth() {
        let params = Config::client("h".to_string(), 5201)
            .with_bandwidth(5_000_000)
            .to_params()
            .unwrap();
        assert_eq!(params.bandwidth, None);
    }

    #[test]
    fn test_validation_failures() {
        let base = Config::client("h".to_string(), 5201);

        assert!(matches!(
            base.clone().with_buffer_size(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(base
            .clone()
            .with_protocol(Protocol::Udp)
            .with_buffer_size(70_000)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_duration(Duration::from_millis(200))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_interval(Duration::from_micros(10))
            .validate()
            .is_err());
        assert!(base.clone().with_bandwidth(0).validate().is_err());
    }

    #[test]
    fn test_tcp_buffer_size_is_bounded() {
        let base = Config::client("h".to_string(), 5201);
        assert!(base.clone().with_buffer_size(MAX_TCP_LEN).validate().is_ok());
        assert!(matches!(
            base.clone().with_buffer_size(MAX_TCP_LEN + 1).validate(),
            Err(Error::Config(_))
        ));
        assert!(base.with_buffer_size(usize::MAX).to_params().is_err());
    }

    #[test]
    fn test_byte_count_without_duration() {
        let config = Config::client("h".to_string(), 5201)
            .with_duration(Duration::ZERO)
            .with_bytes(1_000_000);
        let params = config.to_params().unwrap();
        assert_eq!(params.bytes, Some(1_000_000));
        assert_eq!(params.duration, Duration::ZERO);
    }

    #[test]
    fn test_config_serializes() {
        let config = Config::server(5301).with_strict_udp_ack(true);
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 5301);
        assert!(back.strict_udp_ack);
        assert_eq!(back.connect_retry, config.connect_retry);
    }
}
