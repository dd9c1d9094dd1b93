//! Main entry point for httproxy

use clap::Parser;
use httproxy::{cli::ServerArgs, init_logger, log_debug, log_error, log_info, proxy};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "httproxy")]
#[command(about = "A forward HTTP/HTTPS proxy with optional Basic auth and TLS listener")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(flatten)]
    server: ServerArgs,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logger(if cli.verbose { "debug" } else { cli.log_level.as_str() });

    let plan = match cli.server.plan() {
        Ok(plan) => plan,
        Err(e) => {
            log_error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    log_info!("Starting httproxy {}", env!("CARGO_PKG_VERSION"));
    log_debug!("Startup plan: {:?}", plan);

    match proxy::run(plan).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error!("{}", e);
            ExitCode::from(1)
        }
    }
}
