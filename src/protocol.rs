//! Control-channel wire format.
//!
//! The control connection carries three kinds of data:
//!
//! - the 37-byte session cookie (see [`crate::cookie`]), once, right after connect
//! - single-byte [`Opcode`]s driving the session state machine
//! - length-prefixed JSON frames carrying [`Parameters`] and [`Results`]
//!
//! # Frame Format
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ length (u32, BE)     │ ASCII JSON (length bytes)    │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! A frame must be read to its declared length before it is parsed. Running
//! out of bytes inside a frame is a protocol error, not an orderly EOF.

use crate::config::{Direction, Protocol};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default stream ID, matching iperf3's behavior.
///
/// iperf3 numbers the first data stream 5; with a single stream it is the
/// only ID that ever appears in reports and results.
pub const DEFAULT_STREAM_ID: u32 = 5;

/// iperf3 version advertised in the parameter exchange.
pub const IPERF_COMPAT_VERSION: &str = "3.6";

/// Upper bound on an accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Probe a UDP client sends so the server learns its address (little-endian on the wire).
pub const UDP_CONNECT_MSG: u32 = 123_456_789;

/// Server's reply to the UDP probe, as raw bytes.
pub const UDP_CONNECT_REPLY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

/// Probe datagram bytes.
pub fn udp_connect_msg() -> [u8; 4] {
    UDP_CONNECT_MSG.to_le_bytes()
}

/// Commands exchanged on the control connection.
///
/// Only the values in the first group are ever sent by this crate. The
/// termination and error values are recognised so that a peer giving up is
/// reported as such rather than as garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    TestStart = 1,
    TestRunning = 2,
    TestEnd = 4,
    ParamExchange = 9,
    CreateStreams = 10,
    ExchangeResults = 13,
    DisplayResults = 14,
    IperfDone = 16,

    ServerTerminate = 11,
    ClientTerminate = 12,
    /// `-1` as a signed byte; the server is busy with another test.
    AccessDenied = 0xff,
    /// `-2` as a signed byte.
    ServerError = 0xfe,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::TestStart => "TEST_START",
            Opcode::TestRunning => "TEST_RUNNING",
            Opcode::TestEnd => "TEST_END",
            Opcode::ParamExchange => "PARAM_EXCHANGE",
            Opcode::CreateStreams => "CREATE_STREAMS",
            Opcode::ExchangeResults => "EXCHANGE_RESULTS",
            Opcode::DisplayResults => "DISPLAY_RESULTS",
            Opcode::IperfDone => "IPERF_DONE",
            Opcode::ServerTerminate => "SERVER_TERMINATE",
            Opcode::ClientTerminate => "CLIENT_TERMINATE",
            Opcode::AccessDenied => "ACCESS_DENIED",
            Opcode::ServerError => "SERVER_ERROR",
        }
    }

    /// True for the values that end a session abnormally.
    pub fn is_abort(self) -> bool {
        matches!(
            self,
            Opcode::ServerTerminate
                | Opcode::ClientTerminate
                | Opcode::AccessDenied
                | Opcode::ServerError
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => Opcode::TestStart,
            2 => Opcode::TestRunning,
            4 => Opcode::TestEnd,
            9 => Opcode::ParamExchange,
            10 => Opcode::CreateStreams,
            11 => Opcode::ServerTerminate,
            12 => Opcode::ClientTerminate,
            13 => Opcode::ExchangeResults,
            14 => Opcode::DisplayResults,
            16 => Opcode::IperfDone,
            0xff => Opcode::AccessDenied,
            0xfe => Opcode::ServerError,
            other => return Err(Error::protocol(format!("unknown opcode {}", other))),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_byte())
    }
}

/// Reads one opcode byte.
///
/// EOF here means the peer closed the control connection.
pub async fn read_opcode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Opcode> {
    match reader.read_u8().await {
        Ok(byte) => Opcode::try_from(byte),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Connection(
            "control connection closed by peer".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

pub async fn write_opcode<W: AsyncWrite + Unpin>(writer: &mut W, opcode: Opcode) -> Result<()> {
    writer.write_all(&[opcode.as_byte()]).await?;
    writer.flush().await?;
    Ok(())
}

/// Serializes a value into a length-prefixed JSON frame.
///
/// # Examples
///
/// ```
/// use nperf3::protocol::{encode_frame, Results, StreamResult};
///
/// let results = Results::single(StreamResult::new(5), false);
/// let frame = encode_frame(&results).expect("serialization failed");
/// let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
/// assert_eq!(len as usize, frame.len() - 4);
/// ```
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if json.len() > MAX_FRAME_LEN {
        return Err(Error::protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            json.len(),
            MAX_FRAME_LEN
        )));
    }
    let len = json.len() as u32;
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a length-prefixed JSON frame and parses it.
///
/// # Errors
///
/// - `Error::Protocol` if the stream ends inside the frame, the declared
///   length exceeds [`MAX_FRAME_LEN`], or the body is not ASCII
/// - `Error::Json` if the body does not parse as `T`
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    read_exact_in_frame(reader, &mut len_bytes, "length prefix").await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!(
            "frame length {} exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    read_exact_in_frame(reader, &mut body, "frame body").await?;

    if !body.is_ascii() {
        return Err(Error::protocol("frame body is not ASCII"));
    }

    Ok(serde_json::from_slice(&body)?)
}

async fn read_exact_in_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::protocol(format!(
            "truncated {}: expected {} bytes",
            what,
            buf.len()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Negotiated test parameters, validated.
///
/// This is what the rest of the crate works with. The JSON shape iperf3
/// puts on the wire is [`WireParameters`]; conversion between the two is the
/// only place the parameter exchange is validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    pub protocol: Protocol,
    pub direction: Direction,
    /// Payload length per write (TCP) or datagram (UDP), in bytes
    pub len: usize,
    /// Interval between periodic reports
    pub pacing_timer: Duration,
    /// Test duration, whole seconds on the wire; zero when `bytes` bounds the test
    pub duration: Duration,
    /// Byte budget for the sender
    pub bytes: Option<u64>,
    /// UDP target rate in bits per second
    pub bandwidth: Option<u64>,
    pub client_version: String,
}

impl Parameters {
    pub fn is_reverse(&self) -> bool {
        self.direction == Direction::Reverse
    }

    pub fn to_wire(&self) -> WireParameters {
        let udp = self.protocol == Protocol::Udp;
        WireParameters {
            tcp: (!udp).then_some(true),
            udp: udp.then_some(true),
            reverse: self.is_reverse(),
            omit: 0,
            time: self.duration.as_secs(),
            num: self.bytes,
            blockcount: None,
            parallel: 1,
            len: self.len as u64,
            pacing_timer: self.pacing_timer.as_millis() as u64,
            bandwidth: if udp { self.bandwidth } else { None },
            client_version: self.client_version.clone(),
            bidirectional: None,
            udp_counters_64bit: None,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Parameter record exactly as iperf3 serializes it.
///
/// Unknown keys are rejected: a peer asking for an option this engine does
/// not implement must fail the negotiation rather than silently run a
/// different test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<bool>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reverse: bool,
    #[serde(default)]
    pub omit: u64,
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockcount: Option<u64>,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    pub len: u64,
    pub pacing_timer: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    #[serde(default)]
    pub client_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidirectional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_counters_64bit: Option<u32>,
}

fn default_parallel() -> u32 {
    1
}

impl TryFrom<WireParameters> for Parameters {
    type Error = Error;

    fn try_from(wire: WireParameters) -> Result<Self> {
        let protocol = match (wire.tcp.unwrap_or(false), wire.udp.unwrap_or(false)) {
            (true, false) => Protocol::Tcp,
            (false, true) => Protocol::Udp,
            (true, true) => return Err(Error::protocol("parameters request both tcp and udp")),
            (false, false) => return Err(Error::protocol("parameters request no transport")),
        };

        if wire.parallel != 1 {
            return Err(Error::protocol(format!(
                "{} parallel streams requested, only 1 is supported",
                wire.parallel
            )));
        }
        if wire.bidirectional.unwrap_or(false) {
            return Err(Error::protocol("bidirectional mode is not supported"));
        }
        if wire.blockcount.unwrap_or(0) != 0 {
            return Err(Error::protocol("block count limited tests are not supported"));
        }
        if wire.udp_counters_64bit.unwrap_or(0) != 0 {
            return Err(Error::protocol("64-bit UDP counters are not supported"));
        }
        let bytes = wire.num.filter(|&n| n > 0);
        if wire.time == 0 && bytes.is_none() {
            return Err(Error::protocol("test needs a duration or a byte count"));
        }
        if wire.len == 0 {
            return Err(Error::protocol("payload length must be non-zero"));
        }
        if wire.pacing_timer == 0 {
            return Err(Error::protocol("pacing timer must be non-zero"));
        }
        if wire.len > protocol.max_len() as u64 {
            return Err(Error::protocol(format!(
                "{:?} payload length {} exceeds {}",
                protocol,
                wire.len,
                protocol.max_len()
            )));
        }

        Ok(Parameters {
            protocol,
            direction: if wire.reverse {
                Direction::Reverse
            } else {
                Direction::Normal
            },
            len: wire.len as usize,
            pacing_timer: Duration::from_millis(wire.pacing_timer),
            duration: Duration::from_secs(wire.time),
            bytes,
            bandwidth: if protocol == Protocol::Udp {
                wire.bandwidth
            } else {
                None
            },
            client_version: wire.client_version,
        })
    }
}

/// Per-stream entry of a results record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub id: u32,
    pub bytes: u64,
    #[serde(default)]
    pub retransmits: i64,
    /// Milliseconds; only meaningful for a UDP receiver
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub packets: u64,
    /// Seconds since the start of the measurement. Servers older than 3.2
    /// omit both timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

impl StreamResult {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            bytes: 0,
            retransmits: 0,
            jitter: 0.0,
            errors: 0,
            packets: 0,
            start_time: None,
            end_time: None,
        }
    }

    /// Measured span in seconds, if both timestamps are present.
    pub fn seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Results record exchanged at `EXCHANGE_RESULTS`.
///
/// Extra keys sent by a full iperf3 are ignored; the record is display-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Results {
    #[serde(default)]
    pub cpu_util_total: f64,
    #[serde(default)]
    pub cpu_util_user: f64,
    #[serde(default)]
    pub cpu_util_system: f64,
    #[serde(default)]
    pub sender_has_retransmits: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_used: Option<String>,
    pub streams: Vec<StreamResult>,
}

impl Results {
    /// Wraps a single stream's result.
    pub fn single(stream: StreamResult, has_retransmits: bool) -> Self {
        Self {
            cpu_util_total: 0.0,
            cpu_util_user: 0.0,
            cpu_util_system: 0.0,
            sender_has_retransmits: i32::from(has_retransmits),
            congestion_used: None,
            streams: vec![stream],
        }
    }

    /// The one stream this engine runs.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the record does not hold exactly one stream.
    pub fn stream(&self) -> Result<&StreamResult> {
        match self.streams.as_slice() {
            [only] => Ok(only),
            other => Err(Error::protocol(format!(
                "results carry {} streams, expected 1",
                other.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_params() -> Parameters {
        Parameters {
            protocol: Protocol::Tcp,
            direction: Direction::Normal,
            len: 1460,
            pacing_timer: Duration::from_millis(1000),
            duration: Duration::from_secs(2),
            bytes: None,
            bandwidth: None,
            client_version: IPERF_COMPAT_VERSION.to_string(),
        }
    }

    #[test]
    fn test_default_stream_id() {
        assert_eq!(DEFAULT_STREAM_ID, 5);
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::TestStart.as_byte(), 1);
        assert_eq!(Opcode::TestRunning.as_byte(), 2);
        assert_eq!(Opcode::TestEnd.as_byte(), 4);
        assert_eq!(Opcode::ParamExchange.as_byte(), 9);
        assert_eq!(Opcode::CreateStreams.as_byte(), 10);
        assert_eq!(Opcode::ExchangeResults.as_byte(), 13);
        assert_eq!(Opcode::DisplayResults.as_byte(), 14);
        assert_eq!(Opcode::IperfDone.as_byte(), 16);
        assert_eq!(Opcode::AccessDenied.as_byte(), 0xff);
    }

    #[test]
    fn test_unknown_opcode() {
        for byte in [0u8, 3, 5, 8, 15, 17, 200] {
            assert!(matches!(Opcode::try_from(byte), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_abort_opcodes() {
        assert!(Opcode::AccessDenied.is_abort());
        assert!(Opcode::ServerTerminate.is_abort());
        assert!(!Opcode::TestEnd.is_abort());
    }

    #[test]
    fn test_opcode_display() {
        assert_eq!(Opcode::CreateStreams.to_string(), "CREATE_STREAMS(10)");
    }

    #[test]
    fn test_udp_bootstrap_bytes() {
        assert_eq!(udp_connect_msg(), [0x15, 0xcd, 0x5b, 0x07]);
        assert_eq!(u32::from_be_bytes(UDP_CONNECT_REPLY), 0x1234_5678);
    }

    #[test]
    fn test_wire_parameters_tcp_shape() {
        let json = serde_json::to_value(tcp_params().to_wire()).unwrap();
        assert_eq!(json["tcp"], true);
        assert!(json.get("udp").is_none());
        assert!(json.get("reverse").is_none());
        assert!(json.get("bandwidth").is_none());
        assert_eq!(json["len"], 1460);
        assert_eq!(json["pacing_timer"], 1000);
        assert_eq!(json["time"], 2);
        assert_eq!(json["parallel"], 1);
    }

    #[test]
    fn test_parse_iperf3_client_params() {
        let json = br#"{"tcp":true,"omit":0,"time":10,"parallel":1,"len":131072,"pacing_timer":1000,"client_version":"3.9"}"#;
        let wire: WireParameters = serde_json::from_slice(json).unwrap();
        let params = Parameters::try_from(wire).unwrap();
        assert_eq!(params.protocol, Protocol::Tcp);
        assert_eq!(params.direction, Direction::Normal);
        assert_eq!(params.len, 131072);
        assert_eq!(params.duration, Duration::from_secs(10));
        assert_eq!(params.client_version, "3.9");
    }

    #[test]
    fn test_parse_udp_reverse_params() {
        let json = br#"{"udp":true,"reverse":true,"time":5,"len":1458,"pacing_timer":1000,"bandwidth":10485760}"#;
        let wire: WireParameters = serde_json::from_slice(json).unwrap();
        let params = Parameters::try_from(wire).unwrap();
        assert_eq!(params.protocol, Protocol::Udp);
        assert!(params.is_reverse());
        assert_eq!(params.bandwidth, Some(10_485_760));
    }

    #[test]
    fn test_reject_unknown_key() {
        let json = br#"{"tcp":true,"time":5,"len":1460,"pacing_timer":1000,"MSS":1400}"#;
        assert!(serde_json::from_slice::<WireParameters>(json).is_err());
    }

    #[test]
    fn test_reject_missing_required_key() {
        let json = br#"{"tcp":true,"time":5,"pacing_timer":1000}"#;
        assert!(serde_json::from_slice::<WireParameters>(json).is_err());
    }

    #[test]
    fn test_reject_invalid_combinations() {
        let mut wire = tcp_params().to_wire();
        wire.udp = Some(true);
        assert!(matches!(Parameters::try_from(wire), Err(Error::Protocol(_))));

        let mut wire = tcp_params().to_wire();
        wire.tcp = None;
        assert!(Parameters::try_from(wire).is_err());

        let mut wire = tcp_params().to_wire();
        wire.parallel = 4;
        assert!(Parameters::try_from(wire).is_err());

        let mut wire = tcp_params().to_wire();
        wire.time = 0;
        assert!(Parameters::try_from(wire).is_err());

        let mut wire = tcp_params().to_wire();
        wire.blockcount = Some(100);
        assert!(Parameters::try_from(wire).is_err());

        let mut wire = tcp_params().to_wire();
        wire.udp_counters_64bit = Some(1);
        assert!(Parameters::try_from(wire).is_err());
    }

    #[test]
    fn test_reject_oversized_tcp_len() {
        let json = br#"{"tcp":true,"time":1,"len":18446744073709551615,"pacing_timer":1000,"parallel":1,"client_version":"3.6"}"#;
        let wire: WireParameters = serde_json::from_slice(json).unwrap();
        assert!(matches!(Parameters::try_from(wire), Err(Error::Protocol(_))));

        let mut wire = tcp_params().to_wire();
        wire.len = crate::config::MAX_TCP_LEN as u64 + 1;
        assert!(matches!(Parameters::try_from(wire), Err(Error::Protocol(_))));

        let mut wire = tcp_params().to_wire();
        wire.len = crate::config::MAX_TCP_LEN as u64;
        assert!(Parameters::try_from(wire).is_ok());
    }

    #[test]
    fn test_byte_count_replaces_duration() {
        let mut wire = tcp_params().to_wire();
        wire.time = 0;
        wire.num = Some(1_000_000);
        let params = Parameters::try_from(wire).unwrap();
        assert_eq!(params.bytes, Some(1_000_000));
        assert_eq!(params.duration, Duration::ZERO);
    }

    #[test]
    fn test_tcp_drops_bandwidth() {
        let mut wire = tcp_params().to_wire();
        wire.bandwidth = Some(1_000_000);
        let params = Parameters::try_from(wire).unwrap();
        assert_eq!(params.bandwidth, None);
    }

    #[test]
    fn test_results_from_micropython_peer() {
        // Shape sent by small iperf3 ports: no timestamps on old versions
        let json = br#"{"cpu_util_total":1,"cpu_util_user":0.5,"cpu_util_system":0.5,"sender_has_retransmits":1,"congestion_used":"cubic","streams":[{"id":1,"bytes":123456,"retransmits":0,"jitter":0,"errors":0,"packets":0}]}"#;
        let results: Results = serde_json::from_slice(json).unwrap();
        let stream = results.stream().unwrap();
        assert_eq!(stream.bytes, 123456);
        assert_eq!(stream.seconds(), None);
        assert_eq!(results.congestion_used.as_deref(), Some("cubic"));
    }

    #[test]
    fn test_results_require_one_stream() {
        let mut results = Results::single(StreamResult::new(5), true);
        assert!(results.stream().is_ok());
        results.streams.clear();
        assert!(results.stream().is_err());
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let params = tcp_params();
        write_frame(&mut a, &params.to_wire()).await.unwrap();
        let wire: WireParameters = read_frame(&mut b).await.unwrap();
        assert_eq!(Parameters::try_from(wire).unwrap(), params);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = encode_frame(&tcp_params().to_wire()).unwrap();
        a.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(a);
        let result: Result<WireParameters> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        let result: Result<Results> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        let result: Result<Results> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_malformed_json_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let body = b"{not json}";
        a.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        a.write_all(body).await.unwrap();
        let result: Result<Results> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_read_opcode_eof() {
        let (a, mut b) = tokio::io::duplex(16);
        drop(a);
        assert!(matches!(
            read_opcode(&mut b).await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_opcode_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(16);
        write_opcode(&mut a, Opcode::ExchangeResults).await.unwrap();
        assert_eq!(read_opcode(&mut b).await.unwrap(), Opcode::ExchangeResults);
    }

    // ============================================================
    // Property-Based Tests
    // ============================================================

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn protocol_strategy() -> impl Strategy<Value = Protocol> {
            prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)]
        }

        fn direction_strategy() -> impl Strategy<Value = Direction> {
            prop_oneof![Just(Direction::Normal), Just(Direction::Reverse)]
        }

        proptest! {
            /// Property: serialize then parse preserves every negotiated field
            #[test]
            fn prop_parameters_roundtrip(
                protocol in protocol_strategy(),
                direction in direction_strategy(),
                len in 1usize..=1460,
                pacing_ms in 1u64..10_000,
                secs in 1u64..3600,
                bytes in proptest::option::of(1u64..u64::MAX),
                bandwidth in proptest::option::of(1u64..10_000_000_000),
            ) {
                let params = Parameters {
                    protocol,
                    direction,
                    len,
                    pacing_timer: Duration::from_millis(pacing_ms),
                    duration: Duration::from_secs(secs),
                    bytes,
                    bandwidth: if protocol == Protocol::Udp { bandwidth } else { None },
                    client_version: IPERF_COMPAT_VERSION.to_string(),
                };

                let frame = encode_frame(&params.to_wire()).unwrap();
                let len_prefix = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                prop_assert_eq!(len_prefix as usize, frame.len() - 4);
                prop_assert!(frame[4..].is_ascii());

                let wire: WireParameters = serde_json::from_slice(&frame[4..]).unwrap();
                let parsed = Parameters::try_from(wire).unwrap();
                prop_assert_eq!(parsed, params);
            }

            /// Property: results survive a frame roundtrip
            #[test]
            fn prop_results_roundtrip(
                bytes in any::<u64>(),
                packets in 0u64..1_000_000,
                errors in 0u64..1_000,
                end in 0.0f64..3600.0,
            ) {
                let mut stream = StreamResult::new(DEFAULT_STREAM_ID);
                stream.bytes = bytes;
                stream.packets = packets;
                stream.errors = errors;
                stream.start_time = Some(0.0);
                stream.end_time = Some(end);

                let frame = encode_frame(&Results::single(stream.clone(), true)).unwrap();
                let parsed: Results = serde_json::from_slice(&frame[4..]).unwrap();
                let got = parsed.stream().unwrap();
                prop_assert_eq!(got.bytes, bytes);
                prop_assert_eq!(got.packets, packets);
                prop_assert_eq!(got.errors, errors);
                prop_assert!((got.end_time.unwrap() - end).abs() < 1e-9);
            }

            /// Property: every byte either maps to an opcode that maps back, or is rejected
            #[test]
            fn prop_opcode_byte_mapping(byte in any::<u8>()) {
                match Opcode::try_from(byte) {
                    Ok(op) => prop_assert_eq!(op.as_byte(), byte),
                    Err(e) => prop_assert!(matches!(e, Error::Protocol(_))),
                }
            }
        }
    }
}
