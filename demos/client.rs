use nperf3::{Client, Config, Mode, Protocol};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Connecting to iperf3 server at 127.0.0.1:5201...");

    let config = Config::client("127.0.0.1".to_string(), 5201)
        .with_protocol(Protocol::Tcp)
        .with_duration(Duration::from_secs(10))
        .with_buffer_size(128 * 1024);

    let outcome = Client::new(config)?.run().await?;

    let local = &outcome.local;
    let span = match (local.start_time, local.end_time) {
        (Some(start), Some(end)) if end > start => end - start,
        _ => outcome.params.duration.as_secs_f64(),
    };
    println!(
        "\nFinal Results: {} bytes sent, {} received by the server, {:.2} Mbps",
        outcome.sent_bytes(Mode::Client),
        outcome.received_bytes(Mode::Client),
        local.bytes as f64 * 8.0 / span / 1_000_000.0
    );

    Ok(())
}
