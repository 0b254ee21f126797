use crate::config::{Config, Mode};
use crate::net::{NetStack, TokioNet};
use crate::protocol::DEFAULT_STREAM_ID;
use crate::reporter::{ReportSink, SinkRef, StdoutSink};
use crate::session::{self, TestOutcome};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time;

/// iperf3-compatible test client.
///
/// The `Client` connects to a server, negotiates one test, runs it, and
/// returns both sides' result records. Report lines go to stdout unless
/// another sink is attached.
///
/// # Examples
///
/// ## Basic TCP Test
///
/// ```no_run
/// use nperf3::{Client, Config};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_duration(Duration::from_secs(10));
///
/// let outcome = Client::new(config)?.run().await?;
/// println!("sent {} bytes", outcome.local.bytes);
/// # Ok(())
/// # }
/// ```
///
/// ## Capturing Report Lines
///
/// ```no_run
/// use nperf3::{Client, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201);
/// let client = Client::new(config)?.with_sink(|line: &str| eprintln!("{}", line));
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<N: NetStack = TokioNet> {
    config: Config,
    net: N,
    sink: SinkRef,
}

impl Client<TokioNet> {
    /// Creates a client on the host network stack.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is not a client
    /// configuration, has no server address, or fails [`Config::validate`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nperf3::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201);
    /// let client = Client::new(config).expect("valid client config");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Client {
            return Err(Error::Config("client requires a client configuration".to_string()));
        }
        if config.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        config.validate()?;

        Ok(Self {
            config,
            net: TokioNet,
            sink: Arc::new(StdoutSink),
        })
    }
}

impl<N: NetStack> Client<N> {
    /// Sends report lines to `sink` instead of stdout.
    pub fn with_sink<S: ReportSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Runs the client over another network stack.
    pub fn with_net<M: NetStack>(self, net: M) -> Client<M> {
        Client {
            config: self.config,
            net,
            sink: self.sink,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one test against the configured server.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` once the connect retry policy is used up,
    /// and any error the session itself ends with.
    pub async fn run(&self) -> Result<TestOutcome> {
        let (control, server) = self.connect().await?;
        session::run(&self.config, &self.net, self.sink.clone(), control, server).await
    }

    /// Opens the control connection, retrying per [`Config::connect_retry`].
    async fn connect(&self) -> Result<(TcpStream, SocketAddr)> {
        let host = self
            .config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;
        let port = self.config.port;

        info!("Connecting to nperf3 server at {}:{}", host, port);
        self.sink
            .report(&format!("Connecting to host {}, port {}", host, port));

        let mut backoff = self.config.connect_retry.tracker();
        loop {
            match self.try_connect(host, port).await {
                Ok((stream, addr)) => {
                    let local = stream.local_addr()?;
                    self.sink.report(&format!(
                        "[{:3}] local {} port {} connected to {} port {}",
                        DEFAULT_STREAM_ID,
                        local.ip(),
                        local.port(),
                        addr.ip(),
                        addr.port()
                    ));
                    return Ok((stream, addr));
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Connection to {}:{} failed ({}), retrying in {:?}",
                            host, port, e, delay
                        );
                        time::sleep(delay).await;
                    }
                    None => {
                        return Err(Error::Connection(format!(
                            "unable to connect to {}:{} after {} retries: {}",
                            host,
                            port,
                            backoff.attempts(),
                            e
                        )));
                    }
                },
            }
        }
    }

    /// One attempt: every resolved address in turn.
    async fn try_connect(&self, host: &str, port: u16) -> io::Result<(TcpStream, SocketAddr)> {
        let mut last_err = None;
        for addr in self.net.resolve(host, port).await? {
            match self.net.connect(addr).await {
                Ok(stream) => {
                    debug!("Control connection established to {}", addr);
                    return Ok((stream, addr));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
        }))
    }
}
