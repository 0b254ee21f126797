//! Data channel: opening it, moving payload through it, and draining it.
//!
//! The data channel is either a TCP connection bound to the session by the
//! cookie, or a connected UDP socket set up with a 4-byte probe exchange.
//! Payload moves one buffer per [`DataPump::pump`] call using non-blocking
//! `try_*` operations, so the session driver stays in charge of waiting.

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{Direction, Mode, Protocol, DEFAULT_UDP_BANDWIDTH};
use crate::cookie::Cookie;
use crate::net::NetStack;
use crate::protocol::{udp_connect_msg, Parameters, UDP_CONNECT_REPLY};
use crate::stats::Stats;
use crate::token_bucket::TokenBucket;
use crate::udp_packet::UdpHeader;
use crate::{Error, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{self, Instant};

/// Seed for the payload pattern; both sides of a test produce the same bytes.
const PAYLOAD_SEED: u64 = 0x6e70_6572_6633;

/// Upper bound on writes during a sender drain.
const MAX_DRAIN_WRITES: usize = 4096;

/// A receiver drain stops once the stream has been quiet this long.
const DRAIN_IDLE: Duration = Duration::from_millis(250);

/// Which end of the data stream this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Send,
    Receive,
}

impl Flow {
    /// The client sends in normal mode, the server sends in reverse mode.
    pub fn for_role(mode: Mode, direction: Direction) -> Self {
        match (mode, direction) {
            (Mode::Client, Direction::Normal) | (Mode::Server, Direction::Reverse) => Flow::Send,
            (Mode::Client, Direction::Reverse) | (Mode::Server, Direction::Normal) => {
                Flow::Receive
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Flow::Send => "sender",
            Flow::Receive => "receiver",
        }
    }

    pub fn peer(self) -> Flow {
        match self {
            Flow::Send => Flow::Receive,
            Flow::Receive => Flow::Send,
        }
    }
}

/// The session's one data connection.
#[derive(Debug)]
pub enum DataChannel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DataChannel {
    pub fn protocol(&self) -> Protocol {
        match self {
            DataChannel::Tcp(_) => Protocol::Tcp,
            DataChannel::Udp(_) => Protocol::Udp,
        }
    }

    /// Waits until a `try_*` operation for `flow` may make progress.
    ///
    /// Readiness can be spurious; the following operation may still report
    /// `WouldBlock`.
    pub async fn ready(&self, flow: Flow) -> io::Result<()> {
        match (self, flow) {
            (DataChannel::Tcp(stream), Flow::Send) => stream.writable().await,
            (DataChannel::Tcp(stream), Flow::Receive) => stream.readable().await,
            (DataChannel::Udp(socket), Flow::Send) => socket.writable().await,
            (DataChannel::Udp(socket), Flow::Receive) => socket.readable().await,
        }
    }

    /// Signals end of data to a TCP receiver. No-op for UDP.
    pub async fn shutdown_write(&mut self) -> Result<()> {
        if let DataChannel::Tcp(stream) = self {
            stream.shutdown().await?;
        }
        Ok(())
    }

    /// Kernel retransmit count for a TCP channel, where the platform exposes it.
    pub fn tcp_retransmits(&self) -> Option<i64> {
        match self {
            DataChannel::Tcp(stream) => match tcp_retransmits(stream) {
                Ok(retransmits) => Some(retransmits),
                Err(e) => {
                    debug!("TCP_INFO unavailable: {}", e);
                    None
                }
            },
            DataChannel::Udp(_) => None,
        }
    }
}

/// Total retransmits from the kernel's TCP_INFO (Linux only).
#[cfg(target_os = "linux")]
fn tcp_retransmits(stream: &TcpStream) -> io::Result<i64> {
    use std::mem;
    use std::os::unix::io::AsRawFd;

    // Leading part of struct tcp_info, up to tcpi_total_retrans
    #[repr(C)]
    struct TcpInfo {
        state: u8,
        ca_state: u8,
        retransmits: u8,
        probes: u8,
        backoff: u8,
        options: u8,
        wscale: u8,
        flags: u8,

        rto: u32,
        ato: u32,
        snd_mss: u32,
        rcv_mss: u32,

        unacked: u32,
        sacked: u32,
        lost: u32,
        retrans: u32,
        fackets: u32,

        last_data_sent: u32,
        last_ack_sent: u32,
        last_data_recv: u32,
        last_ack_recv: u32,

        pmtu: u32,
        rcv_ssthresh: u32,
        rtt: u32,
        rttvar: u32,
        snd_ssthresh: u32,
        snd_cwnd: u32,
        advmss: u32,
        reordering: u32,

        rcv_rtt: u32,
        rcv_space: u32,

        total_retrans: u32,
    }

    let mut info: TcpInfo = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_TCP,
            libc::TCP_INFO,
            &mut info as *mut TcpInfo as *mut libc::c_void,
            &mut len,
        )
    };

    if rc == 0 {
        Ok(info.total_retrans as i64)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn tcp_retransmits(_stream: &TcpStream) -> io::Result<i64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP_INFO is Linux only",
    ))
}

/// Fills a payload buffer from a fixed-seed generator.
///
/// # Examples
///
/// ```
/// use nperf3::transport::payload;
///
/// assert_eq!(payload(64), payload(64));
/// assert_eq!(payload(1460).len(), 1460);
/// ```
pub fn payload(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    StdRng::seed_from_u64(PAYLOAD_SEED).fill_bytes(&mut buf);
    buf
}

/// Result of one pump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Bytes moved through the socket
    Transferred(usize),
    /// Socket was not ready; the pump backed off
    WouldBlock,
    /// Peer closed the stream
    Closed,
}

/// Moves payload between the data channel and the stats engine.
#[derive(Debug)]
pub struct DataPump {
    flow: Flow,
    buf: Vec<u8>,
    sequence: u32,
    pacer: Option<TokenBucket>,
    backoff: Backoff,
    remaining: Option<u64>,
}

impl DataPump {
    pub fn new(params: &Parameters, flow: Flow, would_block: BackoffPolicy) -> Self {
        let pacer = (params.protocol == Protocol::Udp && flow == Flow::Send).then(|| {
            TokenBucket::from_bits_per_sec(params.bandwidth.unwrap_or(DEFAULT_UDP_BANDWIDTH))
        });
        Self {
            flow,
            buf: payload(params.len),
            sequence: 0,
            pacer,
            backoff: would_block.tracker(),
            remaining: match flow {
                Flow::Send => params.bytes,
                Flow::Receive => None,
            },
        }
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    /// True once a byte budget has been fully sent.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    fn next_len(&self) -> usize {
        match self.remaining {
            Some(remaining) => remaining.min(self.buf.len() as u64) as usize,
            None => self.buf.len(),
        }
    }

    /// How long the UDP pacer wants the next send held back.
    pub fn pacing_delay(&mut self) -> Duration {
        let len = self.next_len();
        match &mut self.pacer {
            Some(pacer) => pacer.wait_time(len),
            None => Duration::ZERO,
        }
    }

    /// Moves one buffer in the pump's direction.
    ///
    /// `WouldBlock` is absorbed by the backoff policy until its retry budget
    /// runs out. A closed stream and any other I/O error stop `stats`.
    pub async fn pump(&mut self, channel: &DataChannel, stats: &mut Stats) -> Result<PumpOutcome> {
        let step = match self.flow {
            Flow::Send => self.send_once(channel, stats).await,
            Flow::Receive => self.recv_once(channel, stats),
        };

        match step {
            Ok(PumpOutcome::Closed) => {
                debug!("Data channel closed by peer");
                stats.stop();
                Ok(PumpOutcome::Closed)
            }
            Ok(outcome) => {
                self.backoff.reset();
                Ok(outcome)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => match self.backoff.next_delay() {
                Some(delay) => {
                    time::sleep(delay).await;
                    Ok(PumpOutcome::WouldBlock)
                }
                None => {
                    stats.stop();
                    Err(Error::Connection(format!(
                        "data channel still blocked after {} retries",
                        self.backoff.attempts()
                    )))
                }
            },
            Err(e) => {
                stats.stop();
                Err(e.into())
            }
        }
    }

    async fn send_once(&mut self, channel: &DataChannel, stats: &mut Stats) -> io::Result<PumpOutcome> {
        let len = self.next_len();
        if len == 0 {
            return Ok(PumpOutcome::Transferred(0));
        }

        let n = match channel {
            DataChannel::Tcp(stream) => stream.try_write(&self.buf[..len])?,
            DataChannel::Udp(socket) => {
                let sequence = self.sequence.wrapping_add(1);
                let datagram = &mut self.buf[..len];
                let mut send = || {
                    // Datagrams too short for a header go out bare
                    let _ = UdpHeader::now(sequence).write_into(datagram);
                    socket.try_send(datagram)
                };
                let n = match &mut self.pacer {
                    Some(pacer) => pacer.paced(len, send).await?,
                    None => send()?,
                };
                self.sequence = sequence;
                n
            }
        };

        stats.add_bytes(n);
        if let Some(remaining) = &mut self.remaining {
            *remaining = remaining.saturating_sub(n as u64);
        }
        Ok(PumpOutcome::Transferred(n))
    }

    fn recv_once(&mut self, channel: &DataChannel, stats: &mut Stats) -> io::Result<PumpOutcome> {
        match channel {
            DataChannel::Tcp(stream) => match stream.try_read(&mut self.buf)? {
                0 => Ok(PumpOutcome::Closed),
                n => {
                    stats.add_bytes(n);
                    Ok(PumpOutcome::Transferred(n))
                }
            },
            DataChannel::Udp(socket) => {
                let n = socket.try_recv(&mut self.buf)?;
                stats.add_bytes(n);
                if let Some(header) = UdpHeader::parse(&self.buf[..n]) {
                    stats.record_datagram(&header);
                }
                Ok(PumpOutcome::Transferred(n))
            }
        }
    }

    /// Keeps writing while the TCP socket accepts data without blocking.
    ///
    /// Used by a reverse-mode sender after `TEST_END`, so a receiver still
    /// waiting on a full buffer is released. Drained bytes are not counted.
    pub fn drain_sender(&mut self, channel: &DataChannel) -> Result<u64> {
        let DataChannel::Tcp(stream) = channel else {
            return Ok(0);
        };

        let mut drained = 0u64;
        for _ in 0..MAX_DRAIN_WRITES {
            match stream.try_write(&self.buf) {
                Ok(0) => break,
                Ok(n) => drained += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_peer_gone(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Drained {} bytes after TEST_END", drained);
        Ok(drained)
    }

    /// Reads what the sender put on the wire before it ended the test.
    ///
    /// TCP reads until EOF, until the stream goes quiet, or until `limit`
    /// passes. UDP takes whatever is already queued.
    pub async fn drain_receiver(
        &mut self,
        channel: &DataChannel,
        stats: &mut Stats,
        limit: Duration,
    ) -> Result<u64> {
        let mut drained = 0u64;
        match channel {
            DataChannel::Tcp(stream) => {
                let deadline = Instant::now() + limit;
                loop {
                    let idle = (Instant::now() + DRAIN_IDLE).min(deadline);
                    match time::timeout_at(idle, stream.readable()).await {
                        Ok(ready) => ready?,
                        Err(_) => {
                            debug!("Data stream idle, stopping drain");
                            break;
                        }
                    }
                    match stream.try_read(&mut self.buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            stats.add_bytes(n);
                            drained += n as u64;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) if is_peer_gone(&e) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            DataChannel::Udp(socket) => loop {
                match socket.try_recv(&mut self.buf) {
                    Ok(n) => {
                        stats.add_bytes(n);
                        if let Some(header) = UdpHeader::parse(&self.buf[..n]) {
                            stats.record_datagram(&header);
                        }
                        drained += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if is_peer_gone(&e) => break,
                    Err(e) => return Err(e.into()),
                }
            },
        }
        Ok(drained)
    }
}

fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
    )
}

/// Server side of `CREATE_STREAMS` over TCP.
///
/// Accepts on the session's listener until a connection presents `cookie`.
/// Connections carrying any other cookie are dropped.
pub async fn accept_tcp(listener: &TcpListener, cookie: &Cookie, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let timed_out = || Error::Connection(format!("no data connection within {:?}", timeout));

    loop {
        let (mut stream, peer) = time::timeout_at(deadline, listener.accept())
            .await
            .map_err(|_| timed_out())??;

        match time::timeout_at(deadline, Cookie::read_from(&mut stream)).await {
            Ok(Ok(presented)) if presented == *cookie => {
                info!("Accepted data connection from {}", peer);
                return Ok(stream);
            }
            Ok(Ok(presented)) => {
                warn!("Dropping connection from {}: foreign cookie {}", peer, presented);
            }
            Ok(Err(e)) => {
                warn!("Dropping connection from {}: {}", peer, e);
            }
            Err(_) => return Err(timed_out()),
        }
    }
}

/// Server side of `CREATE_STREAMS` over UDP.
///
/// `socket` must already be bound to the server port, so a fast client's probe
/// is never lost. Datagrams other than the probe are ignored.
pub async fn accept_udp(socket: UdpSocket, timeout: Duration) -> Result<UdpSocket> {
    let deadline = Instant::now() + timeout;
    let expected = udp_connect_msg();
    let mut probe = [0u8; 64];

    loop {
        let (n, peer) = time::timeout_at(deadline, socket.recv_from(&mut probe))
            .await
            .map_err(|_| Error::Connection(format!("no UDP probe within {:?}", timeout)))??;

        if probe[..n] == expected {
            socket.connect(peer).await?;
            socket.send(&UDP_CONNECT_REPLY).await?;
            info!("UDP data channel connected to {}", peer);
            return Ok(socket);
        }
        warn!("Ignoring {}-byte datagram from {} while waiting for the UDP probe", n, peer);
    }
}

/// Client side of `CREATE_STREAMS` over TCP: connect, then present the cookie.
pub async fn connect_tcp<N: NetStack>(
    net: &N,
    addr: SocketAddr,
    cookie: &Cookie,
    timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = time::timeout(timeout, net.connect(addr))
        .await
        .map_err(|_| Error::Connection(format!("data connection to {} timed out", addr)))??;
    cookie.write_to(&mut stream).await?;
    debug!("Data connection established to {}", addr);
    Ok(stream)
}

/// Client side of `CREATE_STREAMS` over UDP: send the probe, await the reply.
///
/// A reply other than `12 34 56 78` aborts when `strict`, and is logged
/// otherwise.
pub async fn connect_udp<N: NetStack>(
    net: &N,
    addr: SocketAddr,
    strict: bool,
    timeout: Duration,
) -> Result<UdpSocket> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = net.bind_udp(local).await?;
    socket.connect(addr).await?;
    socket.send(&udp_connect_msg()).await?;

    let mut reply = [0u8; 64];
    let n = time::timeout(timeout, socket.recv(&mut reply))
        .await
        .map_err(|_| Error::Connection(format!("no UDP probe reply from {}", addr)))??;

    if reply[..n] != UDP_CONNECT_REPLY {
        if strict {
            return Err(Error::protocol(format!(
                "unexpected UDP probe reply {:02x?}",
                &reply[..n]
            )));
        }
        warn!("Unexpected UDP probe reply {:02x?}, continuing", &reply[..n]);
    }
    debug!("UDP data channel connected to {}", addr);
    Ok(socket)
}
