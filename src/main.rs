use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fraglet::config::Config;
use fraglet::proxy::Server;

#[derive(Debug, Parser)]
#[command(
    name = "fraglet",
    about = "Local SOCKS5/HTTP proxy that fragments TLS ClientHellos past DPI",
    version
)]
struct Cli {
    /// Path to the JSON configuration file. Missing file means defaults.
    #[arg(short, long, default_value = "config.json", env = "FRAGLET_CONFIG")]
    config: PathBuf,

    /// Override the configured listen address (ip:port).
    #[arg(long)]
    bind: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                error!("{err:#}");
                return ExitCode::from(1);
            }
        }
    } else {
        info!(path = %cli.config.display(), "no config file, using defaults");
        let mut config = Config::default();
        if let Err(err) = config.finalize() {
            error!("{err}");
            return ExitCode::from(1);
        }
        config
    };
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
        if let Err(err) = config.finalize() {
            error!("{err}");
            return ExitCode::from(1);
        }
    }

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(1);
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let handle = server.handle();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                interrupted.store(true, Ordering::SeqCst);
                handle.shutdown();
            }
        });
    }

    if let Err(err) = server.run().await {
        error!("{err:#}");
        return ExitCode::from(1);
    }
    if interrupted.load(Ordering::SeqCst) {
        return ExitCode::from(130);
    }
    ExitCode::SUCCESS
}
