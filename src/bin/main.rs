use clap::{ArgGroup, Parser};
use nperf3::backoff::BackoffPolicy;
use nperf3::{Client, Config, Protocol, Server};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "nperf3")]
#[command(about = "iperf3-compatible network throughput tester", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["server", "client"])))]
struct Cli {
    /// Run in server mode
    #[arg(short = 's', long)]
    server: bool,

    /// Run in client mode, connecting to HOST
    #[arg(short = 'c', long, value_name = "HOST")]
    client: Option<String>,

    /// Server port to listen on or connect to
    #[arg(short, long, default_value = "5201")]
    port: u16,

    /// Bind to specific address (server)
    #[arg(short = 'B', long)]
    bind: Option<IpAddr>,

    /// Use UDP instead of TCP
    #[arg(short, long)]
    udp: bool,

    /// Test duration in seconds
    #[arg(short = 't', long, default_value = "10")]
    time: u64,

    /// Number of bytes to send instead of a timed test
    #[arg(short = 'n', long)]
    bytes: Option<u64>,

    /// Target bandwidth in bits per second (UDP)
    #[arg(short, long)]
    bandwidth: Option<u64>,

    /// Payload length per write or datagram
    #[arg(short = 'l', long)]
    length: Option<usize>,

    /// Run in reverse mode (server sends, client receives)
    #[arg(short = 'R', long)]
    reverse: bool,

    /// Seconds between periodic reports
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// Abort when the server's UDP probe reply is not 12 34 56 78
    #[arg(long)]
    strict_udp_ack: bool,

    /// Control connection retries after the first attempt
    #[arg(long, default_value = "5")]
    connect_retries: u32,

    /// Seconds the server waits before accepting again after a failed session
    #[arg(long, default_value = "30")]
    relisten_delay: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.server {
        let mut config =
            Config::server(cli.port).with_relisten_delay(Duration::from_secs(cli.relisten_delay));
        if let Some(bind_addr) = cli.bind {
            config = config.with_bind_addr(bind_addr);
        }

        let server = Server::bind(config).await?;
        server.run().await?;
        return Ok(());
    }

    let host = cli
        .client
        .ok_or_else(|| anyhow::anyhow!("either -s or -c HOST is required"))?;
    let protocol = if cli.udp { Protocol::Udp } else { Protocol::Tcp };

    let mut config = Config::client(host, cli.port)
        .with_protocol(protocol)
        .with_duration(Duration::from_secs(cli.time))
        .with_reverse(cli.reverse)
        .with_interval(Duration::from_secs_f64(cli.interval.max(0.001)))
        .with_strict_udp_ack(cli.strict_udp_ack)
        .with_connect_retry(BackoffPolicy::fixed(Duration::from_secs(5), cli.connect_retries));

    if let Some(bytes) = cli.bytes {
        config = config.with_bytes(bytes);
    }
    if let Some(bw) = cli.bandwidth {
        config = config.with_bandwidth(bw);
    }
    if let Some(len) = cli.length {
        config = config.with_buffer_size(len);
    }

    let client = Client::new(config)?;
    client.run().await?;

    Ok(())
}
