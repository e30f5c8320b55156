use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dojo_matchd::{DirectoryConfig, net::rate_limit::RateLimitConfig, run_directory};

/// Match-code directory for netplay hosts
#[derive(Parser, Debug)]
#[command(name = "dojo-matchd")]
#[command(about = "Maps short match codes to netplay host addresses", long_about = None)]
struct Args {
    /// TCP bind address
    #[arg(short, long, default_value = "0.0.0.0:52001")]
    bind: String,

    /// Seconds a registration lives without a refresh
    #[arg(long, default_value_t = 600)]
    entry_ttl_secs: u64,

    /// Seconds before an idle connection is closed
    #[arg(long, default_value_t = 10)]
    idle_timeout_secs: u64,

    /// Max new connections per IP per second (0 disables the limit)
    #[arg(long, default_value_t = 20)]
    conn_per_ip_per_sec: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let bind_addr: SocketAddr = args.bind.parse()?;
    let listener = TcpListener::bind(bind_addr).await?;

    let config = DirectoryConfig {
        entry_ttl: Duration::from_secs(args.entry_ttl_secs),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        rate: RateLimitConfig {
            conn_per_ip_per_sec: args.conn_per_ip_per_sec,
            ..RateLimitConfig::default()
        },
        ..DirectoryConfig::default()
    };

    tokio::select! {
        result = run_directory(listener, config) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
