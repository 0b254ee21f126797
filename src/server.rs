use crate::config::{Config, Mode};
use crate::net::{NetStack, TokioNet};
use crate::reporter::{SinkRef, StdoutSink};
use crate::session::{self, TestOutcome};
use crate::{Error, Result};
use log::{error, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time;

/// iperf3-compatible test server.
///
/// The `Server` owns a listening socket on the configured port and serves
/// one client at a time. A session that fails is logged; the server then
/// waits [`Config::relisten_delay`] and accepts again on the same socket.
///
/// # Examples
///
/// ## Basic Server
///
/// ```no_run
/// use nperf3::{Server, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind(Config::server(5201)).await?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## One Session on an Ephemeral Port
///
/// ```no_run
/// use nperf3::{Server, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind(Config::server(0)).await?;
/// println!("listening on {}", server.local_addr()?);
/// let outcome = server.serve_once().await?;
/// println!("received {} bytes", outcome.local.bytes);
/// # Ok(())
/// # }
/// ```
pub struct Server<N: NetStack = TokioNet> {
    config: Config,
    net: N,
    sink: SinkRef,
    listener: Arc<TcpListener>,
}

impl Server<TokioNet> {
    /// Binds a server on the host network stack, reporting to stdout.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` is not a server configuration, and
    /// `Error::Io` if the port cannot be bound.
    pub async fn bind(config: Config) -> Result<Self> {
        Self::bind_with(config, TokioNet, Arc::new(StdoutSink)).await
    }
}

impl<N: NetStack> Server<N> {
    /// Binds a server on `net`, sending report lines to `sink`.
    pub async fn bind_with(config: Config, net: N, sink: SinkRef) -> Result<Self> {
        if config.mode != Mode::Server {
            return Err(Error::Config("server requires a server configuration".to_string()));
        }

        let ip = config.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = net.listen(SocketAddr::new(ip, config.port)).await?;
        let local = listener.local_addr()?;
        info!("Listening on {}", local);
        sink.report(&format!("Server listening on {}", local.port()));

        Ok(Self {
            config,
            net,
            sink,
            listener: Arc::new(listener),
        })
    }

    /// Address the control listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves sessions until the process is stopped.
    ///
    /// Session failures never end the loop. Each one is logged, followed by a
    /// pause of [`Config::relisten_delay`].
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.serve_once().await {
                Ok(outcome) => {
                    info!(
                        "Session finished: {} bytes local, {} bytes remote",
                        outcome.local.bytes, outcome.remote.bytes
                    );
                }
                Err(e) => {
                    error!("Session failed: {}", e);
                    time::sleep(self.config.relisten_delay).await;
                }
            }
            self.sink.report(&"-".repeat(60));
        }
    }

    /// Accepts one control connection and runs its session to the end.
    ///
    /// The session runs on its own task. A session that panics is reported
    /// as `Error::Test` and leaves the listener untouched.
    pub async fn serve_once(&self) -> Result<TestOutcome> {
        let (control, peer) = self.listener.accept().await?;
        control.set_nodelay(true)?;
        info!("New control connection from {}", peer);
        self.sink.report(&format!(
            "Accepted connection from {}, port {}",
            peer.ip(),
            peer.port()
        ));

        let config = self.config.clone();
        let net = self.net.clone();
        let sink = self.sink.clone();
        let listener = Arc::clone(&self.listener);
        let handle = tokio::spawn(async move {
            session::serve(&config, &net, sink, &listener, control).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Test(format!("session with {} died: {}", peer, e))),
        }
    }
}
