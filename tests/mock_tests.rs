// Sessions against scripted peers and substitute network stacks.
// The scripted peers speak raw bytes, so these tests pin the wire format
// independently of the crate's own codec.

use nperf3::backoff::BackoffPolicy;
use nperf3::net::{NetStack, TokioNet};
use nperf3::{CaptureSink, Client, Config, Error, Protocol, Server};
use serde_json::{json, Value};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Network stack whose first `failures` connects are refused.
#[derive(Clone)]
struct FlakyNet {
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl FlakyNet {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl NetStack for FlakyNet {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        TokioNet.resolve(host, port).await
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "flaky"));
        }
        TokioNet.connect(addr).await
    }

    async fn listen(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        TokioNet.listen(addr).await
    }

    async fn bind_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        TokioNet.bind_udp(addr).await
    }
}

async fn read_json(stream: &mut TcpStream) -> io::Result<Value> {
    let len = stream.read_u32().await?;
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn write_json(stream: &mut TcpStream, value: &Value) -> io::Result<()> {
    let body = serde_json::to_vec(value)?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

struct Transcript {
    params: Value,
    client_results: Value,
    received: u64,
}

/// Plays the server half of an iperf3 3.6 session, opcode by opcode.
///
/// The results it sends back carry no timestamps, like servers before 3.2.
async fn scripted_server(listener: TcpListener, udp_reply: [u8; 4]) -> io::Result<Transcript> {
    let (mut control, _) = listener.accept().await?;
    let mut cookie = [0u8; 37];
    control.read_exact(&mut cookie).await?;
    assert_eq!(cookie[36], 0);

    control.write_all(&[9]).await?;
    let params = read_json(&mut control).await?;
    let udp = params["udp"] == json!(true);

    enum Data {
        Tcp(TcpStream),
        Udp(UdpSocket),
    }
    let mut data = if udp {
        let socket = UdpSocket::bind(listener.local_addr()?).await?;
        control.write_all(&[10]).await?;
        let mut probe = [0u8; 4];
        let (_, peer) = socket.recv_from(&mut probe).await?;
        assert_eq!(u32::from_le_bytes(probe), 123_456_789);
        socket.connect(peer).await?;
        socket.send(&udp_reply).await?;
        Data::Udp(socket)
    } else {
        control.write_all(&[10]).await?;
        let (mut stream, _) = listener.accept().await?;
        let mut data_cookie = [0u8; 37];
        stream.read_exact(&mut data_cookie).await?;
        assert_eq!(data_cookie, cookie);
        Data::Tcp(stream)
    };

    control.write_all(&[1]).await?;
    control.write_all(&[2]).await?;

    let mut received = 0u64;
    let mut buf = vec![0u8; 256 * 1024];
    let mut data_open = true;
    loop {
        tokio::select! {
            op = control.read_u8() => {
                assert_eq!(op?, 4, "expected TEST_END");
                break;
            }
            n = async {
                match &mut data {
                    Data::Tcp(stream) => stream.read(&mut buf).await,
                    Data::Udp(socket) => socket.recv(&mut buf).await,
                }
            }, if data_open => {
                match n? {
                    0 => data_open = false,
                    n => received += n as u64,
                }
            }
        }
    }
    // The client half-closes TCP before TEST_END; collect what is in flight
    if let (Data::Tcp(stream), true) = (&mut data, data_open) {
        loop {
            match stream.read(&mut buf).await? {
                0 => break,
                n => received += n as u64,
            }
        }
    }
    drop(data);

    control.write_all(&[13]).await?;
    let client_results = read_json(&mut control).await?;
    let results = json!({
        "cpu_util_total": 1.5,
        "cpu_util_user": 0.5,
        "cpu_util_system": 1.0,
        "sender_has_retransmits": 0,
        "streams": [{
            "id": 1,
            "bytes": received,
            "retransmits": -1,
            "jitter": 0.0,
            "errors": 0,
            "packets": 0
        }]
    });
    write_json(&mut control, &results).await?;
    control.write_all(&[14]).await?;
    assert_eq!(control.read_u8().await?, 16, "expected IPERF_DONE");

    Ok(Transcript {
        params,
        client_results,
        received,
    })
}

async fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn client_config(addr: SocketAddr) -> Config {
    Config::client("127.0.0.1".to_string(), addr.port())
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(500))
}

#[tokio::test]
async fn test_client_against_scripted_iperf3_server() {
    let (listener, addr) = local_listener().await;
    let server = tokio::spawn(scripted_server(listener, [0x12, 0x34, 0x56, 0x78]));

    let capture = CaptureSink::new();
    let outcome = Client::new(client_config(addr).with_buffer_size(1460))
        .unwrap()
        .with_sink(capture.clone())
        .run()
        .await
        .unwrap();
    let transcript = server.await.unwrap().unwrap();

    let params = transcript.params;
    assert_eq!(params["tcp"], json!(true));
    assert!(params.get("udp").is_none());
    assert_eq!(params["time"], json!(1));
    assert_eq!(params["len"], json!(1460));
    assert_eq!(params["pacing_timer"], json!(500));
    assert_eq!(params["parallel"], json!(1));
    assert_eq!(params["client_version"], json!("3.6"));

    assert_eq!(transcript.received, outcome.local.bytes);
    assert_eq!(transcript.client_results["streams"][0]["bytes"], json!(outcome.local.bytes));
    assert_eq!(transcript.client_results["streams"].as_array().unwrap().len(), 1);

    // Peer result without timestamps still gets a summary line
    assert_eq!(outcome.remote.bytes, transcript.received);
    assert_eq!(outcome.remote.start_time, None);
    assert_eq!(capture.matching("  receiver").len(), 1);
}

#[tokio::test]
async fn test_udp_client_sends_bandwidth_and_tolerates_new_ack() {
    let (listener, addr) = local_listener().await;
    // Newer iperf3 servers answer the probe with 987654321
    let server = tokio::spawn(scripted_server(listener, 987_654_321u32.to_le_bytes()));

    let config = client_config(addr)
        .with_protocol(Protocol::Udp)
        .with_bandwidth(2_000_000)
        .with_buffer_size(1200);
    let outcome = Client::new(config)
        .unwrap()
        .with_sink(CaptureSink::new())
        .run()
        .await
        .unwrap();
    let transcript = server.await.unwrap().unwrap();

    assert_eq!(transcript.params["udp"], json!(true));
    assert_eq!(transcript.params["bandwidth"], json!(2_000_000));
    assert_eq!(transcript.params["len"], json!(1200));
    assert!(outcome.local.packets > 0);
    assert!(transcript.received <= outcome.local.bytes);
}

#[tokio::test]
async fn test_strict_udp_ack_aborts() {
    let (listener, addr) = local_listener().await;
    let _server = tokio::spawn(scripted_server(listener, 987_654_321u32.to_le_bytes()));

    let config = client_config(addr)
        .with_protocol(Protocol::Udp)
        .with_strict_udp_ack(true);
    let result = Client::new(config)
        .unwrap()
        .with_sink(CaptureSink::new())
        .run()
        .await;
    assert!(matches!(result, Err(Error::Protocol(_))));
}

/// Plays the client half of an iperf3 3.6 session against `addr`.
async fn scripted_client(addr: SocketAddr, params: Value, payload: usize) -> io::Result<Value> {
    let cookie: Vec<u8> = b"abcdefghijklmnopqrstuvwxyz2345672345"
        .iter()
        .copied()
        .chain(std::iter::once(0))
        .collect();

    let mut control = TcpStream::connect(addr).await?;
    control.write_all(&cookie).await?;
    assert_eq!(control.read_u8().await?, 9);
    write_json(&mut control, &params).await?;

    assert_eq!(control.read_u8().await?, 10);
    let mut data = TcpStream::connect(addr).await?;
    data.write_all(&cookie).await?;

    assert_eq!(control.read_u8().await?, 1);
    assert_eq!(control.read_u8().await?, 2);
    data.write_all(&vec![0x5a; payload]).await?;
    control.write_all(&[4]).await?;

    assert_eq!(control.read_u8().await?, 13);
    let results = json!({
        "cpu_util_total": 0.0,
        "cpu_util_user": 0.0,
        "cpu_util_system": 0.0,
        "sender_has_retransmits": 1,
        "congestion_used": "cubic",
        "streams": [{
            "id": 1, "bytes": payload, "retransmits": 0, "jitter": 0.0,
            "errors": 0, "packets": 0, "start_time": 0.0, "end_time": 0.2
        }]
    });
    write_json(&mut control, &results).await?;
    let server_results = read_json(&mut control).await?;
    assert_eq!(control.read_u8().await?, 14);
    control.write_all(&[16]).await?;
    Ok(server_results)
}

fn iperf3_params() -> Value {
    json!({
        "tcp": true,
        "omit": 0,
        "time": 1,
        "parallel": 1,
        "len": 1460,
        "pacing_timer": 1000,
        "client_version": "3.6"
    })
}

async fn local_server(sink: CaptureSink) -> (Server, SocketAddr) {
    let config = Config::server(0)
        .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_relisten_delay(Duration::from_millis(10));
    let server = Server::bind_with(config, TokioNet, Arc::new(sink)).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

#[tokio::test]
async fn test_server_against_scripted_iperf3_client() {
    let sink = CaptureSink::new();
    let (server, addr) = local_server(sink.clone()).await;
    let serving = tokio::spawn(async move { server.serve_once().await });

    let server_results = scripted_client(addr, iperf3_params(), 200_000).await.unwrap();
    let outcome = serving.await.unwrap().unwrap();

    assert_eq!(outcome.local.bytes, 200_000);
    assert_eq!(outcome.remote.bytes, 200_000);
    assert_eq!(server_results["streams"][0]["bytes"], json!(200_000));
    assert_eq!(server_results["streams"].as_array().unwrap().len(), 1);
    assert!(server_results["streams"][0]["end_time"].is_number());
    assert_eq!(sink.matching("  sender").len(), 1);
}

#[tokio::test]
async fn test_server_rejects_multi_stream_request() {
    let (server, addr) = local_server(CaptureSink::new()).await;
    let serving = tokio::spawn(async move { server.serve_once().await });

    let mut params = iperf3_params();
    params["parallel"] = json!(4);
    assert!(scripted_client(addr, params, 1000).await.is_err());
    assert!(matches!(serving.await.unwrap(), Err(Error::Protocol(_))));
}

#[tokio::test]
async fn test_server_rejects_unknown_parameter() {
    let (server, addr) = local_server(CaptureSink::new()).await;
    let serving = tokio::spawn(async move { server.serve_once().await });

    let mut params = iperf3_params();
    params["MSS"] = json!(1400);
    assert!(scripted_client(addr, params, 1000).await.is_err());
    assert!(matches!(serving.await.unwrap(), Err(Error::Protocol(_))));
}

#[tokio::test]
async fn test_connect_retry_recovers() {
    let sink = CaptureSink::new();
    let (server, addr) = local_server(sink).await;
    let serving = tokio::spawn(async move { server.serve_once().await });

    let net = FlakyNet::new(2);
    let config = client_config(addr)
        .with_connect_retry(BackoffPolicy::fixed(Duration::from_millis(10), 3));
    let client = Client::new(config)
        .unwrap()
        .with_sink(CaptureSink::new())
        .with_net(net.clone());

    let outcome = client.run().await.unwrap();
    assert!(outcome.local.bytes > 0);
    // Two refused control connects, then the control and data connects
    assert_eq!(net.attempts(), 4);
    assert!(serving.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_connect_retry_exhausted() {
    let (_listener, addr) = local_listener().await;
    let net = FlakyNet::new(usize::MAX);
    let config = client_config(addr)
        .with_connect_retry(BackoffPolicy::fixed(Duration::from_millis(10), 3));
    let client = Client::new(config)
        .unwrap()
        .with_sink(CaptureSink::new())
        .with_net(net.clone());

    let err = client.run().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    // The first attempt plus three retries
    assert_eq!(net.attempts(), 4);
}
