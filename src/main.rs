//! Trickster server entry point
//!
//! Loads configuration, initializes logging and metrics, builds the
//! origin clients and caches, and serves until terminated.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use trickster::config::{Config, Flags};
use trickster::frontend::{self, ServerState};
use trickster::origin::ClientRegistry;

fn main() {
    let flags = Flags::parse();

    if flags.version {
        println!("trickster {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    // configuration errors are fatal before anything listens
    let mut config = match load_config(&flags) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load configuration: {e}");
            std::process::exit(1);
        }
    };
    config.apply_flags(&flags);

    init_logging(&config.logging.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("could not start runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(Arc::new(config)));
    std::process::exit(exit_code);
}

fn load_config(flags: &Flags) -> trickster::Result<Config> {
    match (&flags.config, &flags.origin_url) {
        (Some(path), _) => Config::from_file(path),
        (None, Some(origin_url)) => {
            let origin_type = flags.origin_type.as_deref().unwrap_or("prometheus");
            Config::from_origin_flags(origin_url, origin_type)
        }
        (None, None) => Err(trickster::TricksterError::Config(
            "no configuration: provide -config or -origin-url".to_string(),
        )),
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: Arc<Config>) -> i32 {
    info!(version = env!("CARGO_PKG_VERSION"), "trickster starting");

    let registry = ClientRegistry::default();
    let state = match ServerState::new(Arc::clone(&config), &registry) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, "could not build server state");
            return 1;
        }
    };
    state.start_cache_tasks();

    // metrics listener
    let metrics_addr = format!(
        "{}:{}",
        if config.metrics.listen_address.is_empty() {
            "0.0.0.0"
        } else {
            &config.metrics.listen_address
        },
        config.metrics.listen_port
    );
    match metrics_addr.parse() {
        Ok(addr) => {
            tokio::spawn(async move {
                if let Err(e) = trickster::metrics::serve(addr).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            });
        }
        Err(e) => {
            error!(error = %e, address = %metrics_addr, "invalid metrics address");
            return 1;
        }
    }

    if let Err(e) = frontend::serve(state).await {
        error!(error = %e, "frontend failed");
        return 1;
    }
    0
}
