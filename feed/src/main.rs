use clap::Parser;
use feed::fleet::Fleet;
use feed::network::FeedServer;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Resources to simulate, comma separated
    #[arg(short, long, default_value = "srv-1,srv-2,srv-3")]
    resources: String,

    /// Milliseconds between telemetry emissions
    #[arg(short, long, default_value = "500")]
    emit_ms: u64,

    /// Every Nth resource emits legacy wire shapes (0 disables)
    #[arg(long, default_value = "3")]
    legacy_every: usize,

    /// Maximum concurrent subscriber endpoints
    #[arg(short, long, default_value = "32")]
    max_subscribers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let names: Vec<String> = args
        .resources
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if names.is_empty() {
        return Err("no resources given".into());
    }

    info!("Simulating {} resources: {}", names.len(), args.resources);

    let fleet = Fleet::new(&names, args.legacy_every);
    let address = format!("{}:{}", args.host, args.port);
    let mut server = FeedServer::new(
        &address,
        Duration::from_millis(args.emit_ms),
        args.max_subscribers,
        fleet,
    )
    .await?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
