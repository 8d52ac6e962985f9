// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! petflow - per-subject dataflow workflow runner

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use petflow::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "petflow=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    match cli.command {
        Commands::Run(args) => petflow::cli::run::run(&cli.config, args, cli.verbose).await,
        Commands::Validate => petflow::cli::validate::run(&cli.config, cli.verbose).await,
        Commands::Graph { format } => {
            petflow::cli::graph::run(&cli.config, format, cli.verbose).await
        }
        Commands::Cache { action } => {
            petflow::cli::cache::run(&cli.config, action, cli.verbose).await
        }
    }
}
