//! Token bucket pacing for the UDP sender.
//!
//! UDP has no congestion control, so the sender must hold itself to the
//! negotiated bandwidth target. Tokens are bytes; they accrue at the target
//! rate up to a burst capacity of 100 ms worth of traffic, and a datagram may
//! only leave once enough tokens are available.

use std::time::Duration;
use tokio::time::{self, Instant};

/// Smallest burst allowance, so very low rates can still send a full datagram.
const MIN_CAPACITY: u64 = 8192;

/// Sleeps shorter than this are skipped and the deficit carried forward.
const MIN_SLEEP: Duration = Duration::from_micros(10);

/// Rate limiter expressed in bytes per second.
///
/// # Examples
///
/// ```
/// use nperf3::token_bucket::TokenBucket;
///
/// # async fn example() {
/// // 1 Mbit/s, the iperf3 UDP default
/// let mut bucket = TokenBucket::from_bits_per_sec(1_000_000);
/// assert_eq!(bucket.bytes_per_sec(), 125_000);
///
/// // Waits if the datagram would exceed the rate
/// bucket.consume(1460).await;
/// # }
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_sec: u64,
    tokens: i64,
    capacity: i64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        let capacity = (bytes_per_sec / 10).max(MIN_CAPACITY) as i64;
        Self {
            bytes_per_sec,
            tokens: capacity,
            capacity,
            last_refill: Instant::now(),
        }
    }

    /// Creates a bucket for a target given in bits per second.
    pub fn from_bits_per_sec(bits_per_sec: u64) -> Self {
        Self::new(bits_per_sec / 8)
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn available_tokens(&self) -> i64 {
        self.tokens
    }

    /// How long a send of `bytes` has to wait, given the tokens on hand.
    pub fn delay_for(&self, bytes: usize) -> Duration {
        let deficit = bytes as i64 - self.tokens;
        if deficit <= 0 || self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let nanos = deficit as u128 * 1_000_000_000 / self.bytes_per_sec as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Refills, then reports how long a send of `bytes` would have to wait.
    ///
    /// Unlike [`TokenBucket::consume`] this never sleeps, so a caller can fold
    /// the wait into a larger `select!`.
    pub fn wait_time(&mut self, bytes: usize) -> Duration {
        if self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        self.refill();
        self.delay_for(bytes)
    }

    /// Takes `bytes` tokens, sleeping first if the bucket runs short.
    ///
    /// A rate of zero means unpaced.
    pub async fn consume(&mut self, bytes: usize) {
        self.wait_for(bytes).await;
        self.take(bytes);
    }

    /// Waits for `bytes` tokens, then runs `send`.
    ///
    /// Only the byte count `send` reports is taken from the bucket; a failed
    /// send costs nothing.
    pub async fn paced<E>(
        &mut self,
        bytes: usize,
        send: impl FnOnce() -> std::result::Result<usize, E>,
    ) -> std::result::Result<usize, E> {
        self.wait_for(bytes).await;
        let sent = send()?;
        self.take(sent);
        Ok(sent)
    }

    async fn wait_for(&mut self, bytes: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }

        self.refill();

        let delay = self.delay_for(bytes);
        if delay > MIN_SLEEP {
            time::sleep(delay).await;
            self.refill();
        }
    }

    fn take(&mut self, bytes: usize) {
        if self.bytes_per_sec != 0 {
            self.tokens -= bytes as i64;
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(self.last_refill).as_micros() as u64;
        let earned = elapsed_micros.saturating_mul(self.bytes_per_sec) / 1_000_000;

        if earned > 0 {
            self.tokens = (self.tokens + earned as i64).min(self.capacity);
            self.last_refill = now;
        }
    }
}
