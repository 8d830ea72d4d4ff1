//! gadgetd binary: keeps this device's app container in sync with its desired state.

use clap::Parser;
use gadget::AgentConfig;
use gadgetd::{daemon, DaemonError, Overrides};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gadgetd", version, about = "Edge gadget daemon")]
struct Args {
    /// Config file (default: ./gadget.toml, then /etc/gadget/gadget.toml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Device id, overrides device.my_id
    #[arg(long = "my-id")]
    my_id: Option<String>,

    /// Token file name, overrides token.token_file
    #[arg(long = "token-file")]
    token_file: Option<String>,

    /// Protocol of app origins, overrides app.protocol
    #[arg(long = "app-protocol")]
    app_protocol: Option<String>,

    /// Domain suffix of app origins, overrides app.suffix
    #[arg(long = "app-suffix")]
    app_suffix: Option<String>,

    /// Read the desired state from this JSON file instead of the configured provider
    #[arg(long = "state-file")]
    state_file: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG (e.g. "info", "gadget=debug")
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    // --log-level, then RUST_LOG, then info
    let env_filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = match AgentConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gadgetd: {}", e);
            std::process::exit(1);
        }
    };
    Overrides {
        my_id: args.my_id,
        token_file: args.token_file,
        app_protocol: args.app_protocol,
        app_suffix: args.app_suffix,
        state_file: args.state_file,
    }
    .apply(&mut config);

    info!("gadgetd starting...");
    info!("Device: {}", config.device.my_id);
    info!("App origins: {}://<app>.{}", config.app.protocol, config.app.suffix);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("gadgetd: cannot start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result: anyhow::Result<()> = rt.block_on(async {
        daemon::run(config).await?;
        Ok(())
    });

    if let Err(e) = result {
        match e.downcast_ref::<DaemonError>() {
            Some(DaemonError::Fatal(fatal)) => {
                tracing::error!("gadgetd stopped on fatal error: {}", fatal)
            }
            _ => tracing::error!("gadgetd failed: {:#}", e),
        }
        std::process::exit(1);
    }
    info!("gadgetd exited cleanly");
}
