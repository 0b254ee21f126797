//! iperf3 UDP datagram header and receive-side loss/jitter tracking.
//!
//! Every UDP datagram starts with a 12-byte header, stamped in place into the
//! reusable payload buffer just before the send.
//!
//! # Packet Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │   Seconds    │ Microseconds │  Sequence    │   Payload    │
//! │   (4 bytes)  │  (4 bytes)   │  (4 bytes)   │  (variable)  │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! All fields are big-endian. The timestamp is the sender's wall clock, the
//! sequence starts at 1.
//!
//! # Jitter Measurement
//!
//! Jitter follows RFC 3550:
//! ```text
//! J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16
//! ```
//! where D(i-1,i) is the difference in relative transit times between packets.
//!
//! # Examples
//!
//! ```
//! use nperf3::udp_packet::UdpHeader;
//!
//! let mut datagram = vec![0u8; 1460];
//! UdpHeader::now(42).write_into(&mut datagram).expect("buffer too short");
//!
//! let header = UdpHeader::parse(&datagram).expect("invalid datagram");
//! assert_eq!(header.sequence, 42);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sender-side timestamp and sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sec: u32,
    pub usec: u32,
    pub sequence: u32,
}

impl UdpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 12;

    pub fn new(sent_at: Duration, sequence: u32) -> Self {
        Self {
            sec: sent_at.as_secs() as u32,
            usec: sent_at.subsec_micros(),
            sequence,
        }
    }

    /// Header stamped with the current wall-clock time.
    pub fn now(sequence: u32) -> Self {
        Self::new(wall_clock(), sequence)
    }

    /// Writes the header over the first 12 bytes of `buf`.
    ///
    /// Returns `None` if `buf` is too short to hold it.
    pub fn write_into(&self, buf: &mut [u8]) -> Option<()> {
        let dst = buf.get_mut(..Self::SIZE)?;
        dst[0..4].copy_from_slice(&self.sec.to_be_bytes());
        dst[4..8].copy_from_slice(&self.usec.to_be_bytes());
        dst[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        Some(())
    }

    /// Reads the header from the front of a received datagram.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let src = datagram.get(..Self::SIZE)?;
        Some(Self {
            sec: u32::from_be_bytes(src[0..4].try_into().ok()?),
            usec: u32::from_be_bytes(src[4..8].try_into().ok()?),
            sequence: u32::from_be_bytes(src[8..12].try_into().ok()?),
        })
    }

    /// Send time as an offset from the Unix epoch.
    pub fn sent_at(&self) -> Duration {
        Duration::from_secs(self.sec as u64) + Duration::from_micros(self.usec as u64)
    }
}

/// Current wall-clock time since the Unix epoch.
pub fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// What one arriving datagram revealed about the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Arrival {
    /// Datagrams skipped over by this one
    pub lost: u64,
    /// Arrived after a higher sequence number, so one earlier loss was not a loss
    pub late: bool,
}

/// Receive-side sequence and jitter tracking.
///
/// # Examples
///
/// ```
/// use nperf3::udp_packet::{SequenceTracker, UdpHeader};
/// use std::time::Duration;
///
/// let mut tracker = SequenceTracker::new();
/// let t = Duration::from_secs(100);
/// tracker.observe(&UdpHeader::new(t, 1), t);
/// let arrival = tracker.observe(&UdpHeader::new(t, 4), t);
/// assert_eq!(arrival.lost, 2);
/// assert_eq!(tracker.lost(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    highest: u32,
    lost: u64,
    out_of_order: u64,
    jitter: f64,
    prev_transit: Option<f64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one datagram that arrived at `arrived` (wall clock).
    pub fn observe(&mut self, header: &UdpHeader, arrived: Duration) -> Arrival {
        let transit = arrived.as_secs_f64() - header.sent_at().as_secs_f64();
        if let Some(prev) = self.prev_transit {
            let d = (transit - prev).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.prev_transit = Some(transit);

        let expected = self.highest.wrapping_add(1);
        if header.sequence >= expected {
            let lost = (header.sequence - expected) as u64;
            self.lost += lost;
            self.highest = header.sequence;
            Arrival { lost, late: false }
        } else {
            self.out_of_order += 1;
            let late = self.lost > 0;
            if late {
                self.lost -= 1;
            }
            Arrival { lost: 0, late }
        }
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// Highest sequence number seen, which is the number of datagrams the sender emitted so far.
    pub fn highest(&self) -> u32 {
        self.highest
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1000.0
    }
}
