//! Network stack the engine runs on.
//!
//! Sessions never call `tokio::net` constructors directly; they go through a
//! [`NetStack`] handed to [`Server`](crate::Server) or
//! [`Client`](crate::Client) at construction. [`TokioNet`] is the real one;
//! tests substitute stacks that fail on purpose.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Socket factory and resolver.
///
/// # Examples
///
/// ```
/// use nperf3::net::{NetStack, TokioNet};
///
/// # #[tokio::main]
/// # async fn main() -> std::io::Result<()> {
/// let net = TokioNet;
/// let addrs = net.resolve("127.0.0.1", 5201).await?;
/// assert_eq!(addrs[0].port(), 5201);
/// # Ok(())
/// # }
/// ```
pub trait NetStack: Clone + Send + Sync + 'static {
    /// Resolves `host` to one or more socket addresses.
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = io::Result<TcpStream>> + Send;

    fn listen(&self, addr: SocketAddr) -> impl Future<Output = io::Result<TcpListener>> + Send;

    fn bind_udp(&self, addr: SocketAddr) -> impl Future<Output = io::Result<UdpSocket>> + Send;
}

/// The host's network stack, through tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioNet;

impl NetStack for TokioNet {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", host),
            ));
        }
        Ok(addrs)
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn listen(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    async fn bind_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        UdpSocket::bind(addr).await
    }
}
