use nperf3::{Client, Config, Protocol};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Starting UDP test against 127.0.0.1:5201 at 100 Mbps...");

    let config = Config::client("127.0.0.1".to_string(), 5201)
        .with_protocol(Protocol::Udp)
        .with_bandwidth(100_000_000)
        .with_duration(Duration::from_secs(10));

    let outcome = Client::new(config)?.run().await?;

    let server = &outcome.remote;
    println!(
        "\nServer saw {} of {} datagrams lost, jitter {:.3} ms",
        server.errors, server.packets, server.jitter
    );

    Ok(())
}
