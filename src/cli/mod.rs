// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for petflow.

pub mod cache;
pub mod graph;
pub mod run;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use miette::Result;
use std::path::{Path, PathBuf};

use crate::config::{RunConfig, DEFAULT_CONFIG_FILE};
use crate::errors::{FlowError, RecoverySuggestion};

/// Per-subject, per-session workflow runner
#[derive(Parser, Debug)]
#[clap(
    name = "petflow",
    version,
    about = "Dataflow workflow engine for PET preprocessing",
    long_about = None,
    after_help = "Examples:\n\
        petflow validate                Check the configuration and workflow\n\
        petflow run --workers 4         Run every subject/session\n\
        petflow graph --format mermaid  Show the workflow graph\n\
        petflow cache stats             Inspect execution records\n\n\
        See 'petflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Run configuration file
    #[clap(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the workflow for every subject and session
    Run(RunArgs),

    /// Validate the configuration and workflow graph
    Validate,

    /// Show the workflow as a graph
    Graph {
        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Inspect and manage execution records
    Cache {
        #[clap(subcommand)]
        action: CacheAction,
    },
}

/// Options of the run command
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// BIDS dataset directory
    #[clap(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Working directory for node outputs and records
    #[clap(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Output directory for collected results
    #[clap(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Run instances processed in parallel
    #[clap(short, long)]
    pub workers: Option<usize>,

    /// Only these subjects (repeatable)
    #[clap(long = "subject", value_name = "ID")]
    pub subjects: Vec<String>,

    /// Only these sessions (repeatable)
    #[clap(long = "session", value_name = "ID")]
    pub sessions: Vec<String>,

    /// Ignore previous results and re-run every node
    #[clap(long)]
    pub no_cache: bool,

    /// Show what would be done
    #[clap(long)]
    pub dry_run: bool,
}

/// Record management actions
#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show record statistics
    Stats,

    /// List records
    List,

    /// Remove every record
    Clear {
        /// Skip confirmation
        #[clap(short, long)]
        yes: bool,
    },

    /// Remove the records of one node and its dependents, forcing them to re-run
    Invalidate {
        /// Node name
        node: String,

        /// Only this subject
        #[clap(long)]
        subject: Option<String>,

        /// Only this session
        #[clap(long)]
        session: Option<String>,
    },
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

/// Load the run configuration, pointing at the fix when it is missing
pub(crate) fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        return Err(miette::miette!(
            help = "Pass --config <file> or create petflow.yaml with a `workflow:` or `pet:` section",
            "Configuration file not found: {}",
            path.display()
        ));
    }

    Ok(RunConfig::load(path)?)
}

/// Print an error with its recovery suggestion, if any
pub(crate) fn print_error_with_suggestion(error: &FlowError) {
    eprintln!("  {} {}", "✗".red(), error);
    if let Some(suggestion) = RecoverySuggestion::for_error(error) {
        for line in suggestion.to_string().lines() {
            eprintln!("    {}", line.dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "petflow", "-c", "study.yaml", "run", "--workers", "4", "--subject", "01",
            "--subject", "02", "--no-cache",
        ]);

        assert_eq!(cli.config, PathBuf::from("study.yaml"));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.workers, Some(4));
                assert_eq!(args.subjects, vec!["01", "02"]);
                assert!(args.no_cache);
                assert!(!args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_graph_format() {
        let cli = Cli::parse_from(["petflow", "graph", "--format", "dot"]);
        assert!(matches!(cli.command, Commands::Graph { format: GraphFormat::Dot }));
    }
}
