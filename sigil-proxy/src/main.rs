#![forbid(unsafe_code)]

use clap::Parser;
use sigil_proxy_lib::{load_from_path, RuntimeEnv, Supervisor};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-mode forward proxy (Signal tunnel / HTTP / SOCKS5)")]
struct Cli {
    /// Path to configuration JSON file
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let env = match RuntimeEnv::from_env() {
        Ok(env) => env,
        Err(err) => {
            error!(%err, "invalid environment configuration");
            std::process::exit(1);
        }
    };
    match load_from_path(&cli.config) {
        Ok(cfg) => {
            info!(mode = ?env.proxy_mode, listen = %cfg.listen, hosts = cfg.hosts.len(), "configuration loaded");
            if let Err(err) = Supervisor::new(cfg, env).run().await {
                error!(%err, "proxy exited with error");
                std::process::exit(1);
            }
        }
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
