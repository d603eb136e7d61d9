//! # Porter
//!
//! The main binary for building and running CNAB bundles.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 apps/porter (THE BINARY)                 │
//! │                                                          │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │    CLI      │   │   Logging    │   │   Signals    │   │
//! │  │   (clap)    │   │  (tracing)   │   │   (tokio)    │   │
//! │  └──────┬──────┘   └──────┬───────┘   └──────┬───────┘   │
//! │         └─────────────────┼──────────────────┘           │
//! │                           ▼                              │
//! │                   ┌───────────────┐                      │
//! │                   │  porter-core  │                      │
//! │                   └───────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! porter build
//! porter install mywordpress --param db-name=wordpress
//! porter invoke mywordpress --action status
//! porter uninstall mywordpress --delete
//! ```

use clap::Parser;
use porter::cli;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // PORTER_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("PORTER_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.debug {
        "porter=debug,porter_core=debug"
    } else {
        "porter=info,porter_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn(watch_interrupts(cancel.clone()));

    if let Err(e) = cli::execute(cli, cancel).await {
        tracing::error!("Error: {}", e);
        std::process::exit(cli::exit_code(&e));
    }
}

/// The first interrupt cancels the running command; the second exits.
async fn watch_interrupts(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("interrupt received, canceling; press Ctrl+C again to exit immediately");
    cancel.cancel();
    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(2);
    }
}
