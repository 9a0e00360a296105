// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kraken Agent

use clap::Parser;
use kraken_agent::Agent;
use kraken_agent::cli::{Cli, Commands};
use kraken_agent::install::{self, InstallOptions};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kraken_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Kraken Agent");

    match cli.command {
        Commands::CheckIntegrity => {
            println!("All is ok");
        }
        Commands::Install(args) => {
            let config = args.into_config();
            config.validate()?;
            install::install(InstallOptions::from_config(&config)).await?;
        }
        Commands::Run(args) => {
            let mut agent = Agent::new(args.into_config()).await?;
            let shutdown = agent.shutdown_handle();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutting down after the current job...");
                        shutdown.notify_one();
                    }
                    Err(e) => error!(error = %e, "Cannot listen for shutdown signal"),
                }
            });
            agent.run().await?;
        }
    }

    Ok(())
}
