//! esgate: entry point.
//!
//! Loads the gateway configuration and serves until Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ESGATE_CONFIG` | `esgate.toml` | Config file; TOML, YAML or JSON by extension. |
//! | `ESGATE_*` | *(none)* | Overrides of config keys, nested keys joined by `__`. |
//! | `RUST_LOG` | `esgate_gateway=info` | Log filter. |

use esgate_gateway::app;
use esgate_kernel::config::load_gateway_config;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    esgate_gateway::init_tracing();

    let path = std::env::var("ESGATE_CONFIG").unwrap_or_else(|_| "esgate.toml".to_string());
    let config = match load_gateway_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path, error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if config.disable_auth {
        warn!("authentication is DISABLED. Do not use this configuration in production.");
    }

    let gateway = match app::assemble(&config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "failed to build gateway");
            return ExitCode::FAILURE;
        }
    };

    if let Some(limiter) = gateway.rate_limiter.clone() {
        let period = Duration::from_secs(config.rate_limit.as_ref().map_or(60, |rl| rl.window_secs.max(1)));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }

    if let Err(e) = gateway.start().await {
        error!(error = %e, "failed to start gateway");
        gateway.coordinator.stop(config.shutdown_timeout()).await;
        return ExitCode::FAILURE;
    }
    info!(listen = %config.listen, "esgate is serving");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for Ctrl-C");
    }
    info!("shutting down");

    match gateway.stop(config.shutdown_timeout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            warn!(error = %e, "shutdown finished with errors");
            ExitCode::FAILURE
        }
    }
}
