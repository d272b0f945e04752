use clap::Parser;
use luma_trace_server::{server, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "LUMA_TRACE_CONFIG")]
    config: Option<PathBuf>,

    /// Broker address, e.g. memory://luma
    #[arg(long, env = "LUMA_BOOTSTRAP_SERVERS")]
    bootstrap_servers: Option<String>,

    /// HTTP port for the query and ingestion API
    #[arg(long, env = "LUMA_HTTP_PORT")]
    http_port: Option<u16>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    }
    .with_overrides(args.bootstrap_servers, args.http_port);

    init_tracing(&config);
    tracing::info!(config = ?args.config, "Configuration loaded");

    server::run(config).await
}
