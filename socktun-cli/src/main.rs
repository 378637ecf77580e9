use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use socktun::{Credentials, LogSink, ProxyConfig, TunnelProxyServer, TunnelTarget};

#[derive(Debug, clap::Parser)]
#[command(name = "socktun", version)]
#[command(about = "Expose a remote WebSocket tunnel as a plain local TCP port.", long_about = None)]
struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Local port to listen on
    #[arg(short, long)]
    port: u16,

    /// Tunnel host name, e.g. ws.example.com
    #[arg(short, long)]
    target: String,

    /// Basic-auth user for the tunnel endpoint
    #[arg(short, long)]
    user: String,

    /// Basic-auth secret for the tunnel endpoint
    #[arg(long, env = "SOCKTUN_SECRET", hide_env_values = true)]
    secret: String,

    /// Treat the remote as an SSH tunnel (expects port 2222)
    #[arg(long)]
    ssh: bool,

    /// Seconds to wait for the remote to become ready
    #[arg(long, default_value_t = 240)]
    ready_timeout: u64,

    /// Seconds between readiness polls
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

fn init_logger_env(verbosity: &Verbosity) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .with_env_var("SOCKTUN_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

/// Prints proxy lifecycle lines straight to stdout.
struct StdoutSink;

impl LogSink for StdoutSink {
    fn append(&self, line: &str) {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_env(&cli.verbose);

    let target = TunnelTarget::new(&cli.target)
        .with_context(|| format!("Invalid tunnel host '{}'", cli.target))?;
    let credentials = Credentials::new(&cli.user, &cli.secret);

    let mut config = ProxyConfig::new(cli.port, cli.ssh);
    config.ready_timeout = Duration::from_secs(cli.ready_timeout);
    config.poll_interval = Duration::from_secs(cli.poll_interval);

    let server = TunnelProxyServer::new(config, target, credentials, Arc::new(StdoutSink));

    println!("Checking that {} is ready...", cli.target);
    server
        .start_proxy()
        .await
        .context("Failed to start tunnel proxy")?;

    let addr = server
        .local_addr()
        .context("Proxy reported no listening address")?;
    println!();
    println!("\u{2713} Tunnel proxy up!");
    println!("  Local:  {addr}");
    println!("  Remote: {}", cli.target);
    println!("\nPress Ctrl+C to stop the proxy.\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    println!("Shutting down...");
    server.dispose().await;

    Ok(())
}
