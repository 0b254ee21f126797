//! nperf3 - an iperf3-compatible throughput test engine
//!
//! This library speaks the iperf3 control protocol (version 3.6 semantics)
//! in both roles, so an nperf3 client can test against a stock `iperf3 -s`
//! and a stock `iperf3 -c` can test against an nperf3 server.
//!
//! # Features
//!
//! - One TCP or UDP data stream per test, normal or reverse direction
//! - Timed tests or a fixed byte budget
//! - UDP pacing, loss and jitter accounting
//! - iperf3-style interval and summary report lines
//! - Asynchronous I/O using tokio
//!
//! # Example
//!
//! ```no_run
//! use nperf3::{Client, Config};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> nperf3::Result<()> {
//! let config = Config::client("127.0.0.1".to_string(), 5201)
//!     .with_duration(Duration::from_secs(5));
//! let outcome = Client::new(config)?.run().await?;
//! println!("{} bytes sent", outcome.local.bytes);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod cookie;
pub mod error;
pub mod net;
pub mod protocol;
pub mod reporter;
pub mod server;
pub mod session;
pub mod state;
pub mod stats;
pub mod token_bucket;
pub mod transport;
pub mod udp_packet;

pub use client::Client;
pub use config::{Config, Direction, Mode, Protocol};
pub use error::{Error, Result};
pub use reporter::{CaptureSink, ReportSink, StdoutSink};
pub use server::Server;
pub use session::TestOutcome;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
