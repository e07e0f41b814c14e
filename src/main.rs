use std::path::PathBuf;

use clap::Parser;

use sensorlink_lib::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "sensorlink")]
#[command(about = "Ingest serial sensor readings into encrypted SQLite storage")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port path, overriding the configuration (auto-detect otherwise)
    #[arg(short, long)]
    port: Option<String>,

    /// Skip the HTTP API
    #[arg(long)]
    no_api: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.serial.path = Some(port);
    }
    if args.no_api {
        config.api.enabled = false;
    }

    sensorlink_lib::run(config).await
}
