use nperf3::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Starting nperf3 server on port 5201...");

    let server = Server::bind(Config::server(5201)).await?;
    server.run().await?;

    Ok(())
}
