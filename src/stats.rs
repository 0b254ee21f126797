//! Throughput accounting and periodic reporting.
//!
//! A [`Stats`] instance follows one data stream. The session driver feeds it
//! every transferred buffer, calls [`Stats::update`] after each loop
//! iteration, and bounds its wait with [`Stats::max_wait`], so interval lines
//! come out on time even when the data channel is idle.
//!
//! Time is read from [`tokio::time::Instant`], which makes the cadence
//! testable under paused time.

use crate::config::Protocol;
use crate::protocol::{Parameters, StreamResult, DEFAULT_STREAM_ID};
use crate::reporter::SinkRef;
use crate::transport::Flow;
use crate::udp_packet::{wall_clock, Arrival, SequenceTracker, UdpHeader};
use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Formats a quantity with a unit prefix, iperf3 style.
///
/// The value is scaled by `base` until it drops below 1000, keeping two,
/// one or zero decimals depending on magnitude. `G` is the largest unit.
///
/// # Examples
///
/// ```
/// use nperf3::stats::fmt_size;
///
/// assert_eq!(fmt_size(512.0, 1024.0), "  512 ");
/// assert_eq!(fmt_size(1_048_576.0, 1024.0), " 1.00 M");
/// assert_eq!(fmt_size(94_400_000.0, 1000.0), " 94.4 M");
/// ```
pub fn fmt_size(value: f64, base: f64) -> String {
    let mut value = value;
    for unit in ["", "K", "M", "G"] {
        if value < 10.0 {
            return format!("{:5.2} {}", value, unit);
        } else if value < 100.0 {
            return format!("{:5.1} {}", value, unit);
        } else if unit == "G" || value < 1000.0 {
            return format!("{:5.0} {}", value, unit);
        }
        value /= base;
    }
    unreachable!("the G unit always formats")
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    bytes: u64,
    packets: u64,
    errors: u64,
}

impl Counters {
    fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
        self.packets += 1;
    }

    fn add_lost(&mut self, n: u64) {
        self.packets += n;
        self.errors += n;
    }

    fn recover_one(&mut self) {
        self.packets = self.packets.saturating_sub(1);
        self.errors = self.errors.saturating_sub(1);
    }
}

/// Running measurement for one stream.
///
/// # Examples
///
/// ```
/// use nperf3::stats::Stats;
/// use nperf3::transport::Flow;
/// use nperf3::config::Protocol;
/// use nperf3::reporter::CaptureSink;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let capture = CaptureSink::new();
/// let mut stats = Stats::new(Protocol::Tcp, Flow::Send, Duration::from_secs(1), Arc::new(capture.clone()));
///
/// stats.add_bytes(1460); // ignored, not running yet
/// stats.start();
/// stats.add_bytes(1460);
/// stats.stop();
///
/// assert_eq!(stats.total_bytes(), 1460);
/// assert_eq!(capture.matching("sender").len(), 1);
/// # }
/// ```
pub struct Stats {
    protocol: Protocol,
    flow: Flow,
    pacing: Duration,
    stream_id: u32,
    sink: SinkRef,
    running: bool,
    start: Instant,
    interval_start: Instant,
    stopped_at: Option<Instant>,
    total: Counters,
    interval: Counters,
    sequence: SequenceTracker,
    retransmits: i64,
}

impl Stats {
    pub fn new(protocol: Protocol, flow: Flow, pacing: Duration, sink: SinkRef) -> Self {
        let now = Instant::now();
        Self {
            protocol,
            flow,
            pacing,
            stream_id: DEFAULT_STREAM_ID,
            sink,
            running: false,
            start: now,
            interval_start: now,
            stopped_at: None,
            total: Counters::default(),
            interval: Counters::default(),
            sequence: SequenceTracker::new(),
            retransmits: 0,
        }
    }

    /// Stats for the negotiated test, seen from one side of the stream.
    pub fn for_params(params: &Parameters, flow: Flow, sink: SinkRef) -> Self {
        Self::new(params.protocol, flow, params.pacing_timer, sink)
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begins a measurement, discarding anything counted before.
    pub fn start(&mut self) {
        let now = Instant::now();
        self.running = true;
        self.start = now;
        self.interval_start = now;
        self.stopped_at = None;
        self.total = Counters::default();
        self.interval = Counters::default();
        self.sequence = SequenceTracker::new();
        self.retransmits = 0;

        let extra = match (self.protocol, self.flow) {
            (Protocol::Udp, Flow::Receive) => "         Jitter    Lost/Total Datagrams",
            (Protocol::Udp, Flow::Send) => "         Total Datagrams",
            (Protocol::Tcp, _) => "",
        };
        self.sink
            .report(&format!("[ ID] Interval           Transfer     Bitrate{}", extra));
    }

    /// Counts one transferred buffer of `n` bytes.
    pub fn add_bytes(&mut self, n: usize) {
        if !self.running {
            return;
        }
        self.total.add_bytes(n as u64);
        self.interval.add_bytes(n as u64);
    }

    /// Counts `n` datagrams that never arrived.
    pub fn add_lost_packets(&mut self, n: u64) {
        if !self.running || n == 0 {
            return;
        }
        self.total.add_lost(n);
        self.interval.add_lost(n);
    }

    /// Feeds a received datagram's header into loss and jitter tracking.
    pub fn record_datagram(&mut self, header: &UdpHeader) {
        self.record_datagram_at(header, wall_clock());
    }

    pub fn record_datagram_at(&mut self, header: &UdpHeader, arrived: Duration) {
        if !self.running {
            return;
        }
        let Arrival { lost, late } = self.sequence.observe(header, arrived);
        if lost > 0 {
            debug!("{} datagrams lost before sequence {}", lost, header.sequence);
            self.add_lost_packets(lost);
        }
        if late {
            self.total.recover_one();
            self.interval.recover_one();
        }
    }

    /// Sets the TCP retransmit count reported in the result record.
    pub fn set_retransmits(&mut self, retransmits: i64) {
        self.retransmits = retransmits;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.bytes
    }

    pub fn total_packets(&self) -> u64 {
        self.total.packets
    }

    pub fn errors(&self) -> u64 {
        self.total.errors
    }

    pub fn jitter_ms(&self) -> f64 {
        self.sequence.jitter_ms()
    }

    /// Length of the measurement: up to `stop()`, or up to now while running.
    pub fn elapsed(&self) -> Duration {
        self.stopped_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.start)
    }

    /// Emits an interval line if one is due, or unconditionally when `final_`.
    pub fn update(&mut self, final_: bool) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        let dt = now.duration_since(self.interval_start);
        if final_ || dt > self.pacing {
            let ta = self.interval_start.duration_since(self.start).as_secs_f64();
            let tb = now.duration_since(self.start).as_secs_f64();
            let line = self.format_line(ta, tb, self.interval, self.jitter_ms(), "");
            self.sink.report(&line);
            self.interval_start = now;
            self.interval = Counters::default();
        }
    }

    /// Ends the measurement and emits the separator and local summary.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.update(true);
        self.running = false;
        let now = Instant::now();
        self.stopped_at = Some(now);

        self.sink.report(&"- ".repeat(30));
        let tb = now.duration_since(self.start).as_secs_f64();
        let tag = format!("  {}", self.flow.label());
        let line = self.format_line(0.0, tb, self.total, self.jitter_ms(), &tag);
        self.sink.report(&line);
    }

    /// Time left until the next interval line is due.
    ///
    /// `None` means there is nothing to wait for.
    pub fn max_wait(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        let elapsed = Instant::now().duration_since(self.interval_start);
        Some(self.pacing.saturating_sub(elapsed))
    }

    /// This side's result record.
    pub fn result(&self) -> StreamResult {
        let mut result = StreamResult::new(self.stream_id);
        result.bytes = self.total.bytes;
        result.packets = self.total.packets;
        result.errors = self.total.errors;
        result.retransmits = self.retransmits;
        if self.protocol == Protocol::Udp && self.flow == Flow::Receive {
            result.jitter = self.jitter_ms();
        }
        result.start_time = Some(0.0);
        result.end_time = Some(self.elapsed().as_secs_f64());
        result
    }

    /// Emits the summary line for the peer's side of the stream.
    ///
    /// Peers that omit timestamps are shown over the local measurement span.
    pub fn report_peer(&self, peer: &StreamResult) {
        let ta = peer.start_time.unwrap_or(0.0);
        let tb = peer
            .end_time
            .unwrap_or_else(|| ta + self.elapsed().as_secs_f64());
        let counters = Counters {
            bytes: peer.bytes,
            packets: peer.packets,
            errors: peer.errors,
        };
        let tag = format!("  {}", self.flow.peer().label());
        let line = self.format_line_for(self.flow.peer(), ta, tb, counters, peer.jitter, &tag);
        self.sink.report(&line);
    }

    fn format_line(&self, ta: f64, tb: f64, c: Counters, jitter_ms: f64, extra: &str) -> String {
        self.format_line_for(self.flow, ta, tb, c, jitter_ms, extra)
    }

    fn format_line_for(
        &self,
        flow: Flow,
        ta: f64,
        tb: f64,
        c: Counters,
        jitter_ms: f64,
        extra: &str,
    ) -> String {
        let dt = tb - ta;
        let bitrate = if dt > 0.0 {
            c.bytes as f64 * 8.0 / dt
        } else {
            0.0
        };
        let mut line = format!(
            "[{:3}] {:5.2}-{:<5.2}  sec {}Bytes {}bits/sec",
            self.stream_id,
            ta,
            tb,
            fmt_size(c.bytes as f64, 1024.0),
            fmt_size(bitrate, 1000.0)
        );
        if self.protocol == Protocol::Udp {
            match flow {
                Flow::Receive => {
                    let pct = 100.0 * c.errors as f64 / c.packets.max(1) as f64;
                    line.push_str(&format!(
                        " {:6.3} ms  {}/{} ({:.2}%)",
                        jitter_ms, c.errors, c.packets, pct
                    ));
                }
                Flow::Send => line.push_str(&format!("  {}", c.packets)),
            }
        }
        line.push_str(extra);
        line
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats")
            .field("protocol", &self.protocol)
            .field("flow", &self.flow)
            .field("pacing", &self.pacing)
            .field("running", &self.running)
            .field("total", &self.total)
            .finish()
    }
}
