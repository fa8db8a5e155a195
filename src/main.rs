use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use accel_zenoh_runtime::runtime::{self, RuntimeOptions};

/// Accelerometer streaming runtime over zenoh
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON sensor configuration (defaults to an adxl345 on the default port)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the motion-control firmware (overrides the config)
    #[arg(long)]
    port: Option<String>,

    /// Use the in-process simulated firmware instead of a serial link
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let options = RuntimeOptions {
        config: args.config,
        port: args.port,
        simulate: args.simulate,
    };
    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
