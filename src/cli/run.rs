// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Run command - execute the workflow over every run instance

use colored::Colorize;
use miette::Result;
use std::path::Path;
use std::sync::Arc;

use super::{load_config, print_error_with_suggestion, RunArgs};
use crate::cache::{FilesystemRecordStore, NodeStatus};
use crate::collector::{CollectionReport, OutputCollector};
use crate::config::{ConfigOverrides, RunConfig};
use crate::errors::FlowError;
use crate::params::{BidsLayout, DatasetLayout, ParameterSpace, RunInstance, SESSION_KEY, SUBJECT_KEY};
use crate::pipeline::{GraphValidator, InstanceResult, PipelineExecutor};
use crate::resolver::Resolver;
use crate::utils::{create_spinner, format_duration, print_warning};

/// Run the workflow
pub async fn run(config_path: &Path, args: RunArgs, verbose: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.apply_overrides(ConfigOverrides {
        data_dir: args.data_dir.clone(),
        work_dir: args.work_dir.clone(),
        output_dir: args.output_dir.clone(),
        workers: args.workers,
    })?;

    // Validate the graph before anything touches the dataset
    let graph = config.build_graph()?;
    let validation = GraphValidator::validate(&graph);

    if !validation.is_valid() {
        eprintln!("{}", "Workflow validation failed:".red().bold());
        for error in &validation.errors {
            print_error_with_suggestion(error);
        }
        return Err(miette::miette!("Workflow graph is invalid"));
    }

    if !validation.warnings.is_empty() && verbose {
        eprintln!("{}", "Workflow warnings:".yellow().bold());
        for warning in &validation.warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }

    let graph = Arc::new(graph.validate()?);
    let paths = config.paths();

    let layout = BidsLayout::new(&paths.data_dir).map_err(|e| {
        print_error_with_suggestion(&e);
        e
    })?;
    let instances = select_instances(&config, &args, &layout)?;

    let executor = PipelineExecutor::with_default_executors();

    if !args.dry_run {
        let spinner = create_spinner("Checking required tools...");
        let missing = executor.check_tools(&graph).await;
        spinner.finish_and_clear();
        let missing = missing?;
        if !missing.is_empty() {
            eprintln!("{}", "Missing required tools:".red().bold());
            for node in &missing {
                eprintln!("  {} {}", "✗".red(), node);
            }
            return Err(miette::miette!(
                help = "Make sure FSL and FreeSurfer are installed and on PATH",
                "Required tools are not installed"
            ));
        }

        for dir in config.bootstrap_dirs() {
            std::fs::create_dir_all(&dir).map_err(|e| FlowError::FileWriteError {
                path: dir.clone(),
                error: e.to_string(),
            })?;
        }
    }

    let executor = if args.dry_run {
        executor
    } else {
        let store = FilesystemRecordStore::new(&paths.working_dir)?;
        executor.with_store(Arc::new(store))
    };
    executor.cancellation().cancel_on_ctrl_c();

    let mut options = config.execution_options();
    options.use_cache = options.use_cache && !args.no_cache;
    options.dry_run = args.dry_run;
    options.show_progress = !verbose;

    let resolver = Arc::new(Resolver::new(&paths.data_dir)?);
    let result = executor
        .execute(graph.clone(), instances, resolver, &paths.working_dir, &options)
        .await?;

    if args.dry_run {
        println!("{}", "Dry run complete. No nodes were executed.".dimmed());
        return Ok(());
    }

    let collector = OutputCollector::new(&paths.output_dir, config.execution.link_mode);
    let reports: Vec<CollectionReport> = result
        .instances
        .iter()
        .map(|instance| collector.collect_result(instance, &graph.graph().outputs))
        .collect();

    print_summary(&result.instances, &reports);
    print_failures(&result.instances, &reports, verbose);

    let failed = result.failed_instances();
    let incomplete = reports.iter().filter(|r| !r.is_complete()).count();

    println!();
    if failed > 0 {
        return Err(miette::miette!(
            "{} of {} run instances failed ({})",
            failed,
            result.instances.len(),
            format_duration(result.duration)
        ));
    }
    if incomplete > 0 {
        return Err(miette::miette!(
            "{} run instances have outputs that could not be collected",
            incomplete
        ));
    }

    println!(
        "{} {} run instances in {}; outputs in {}",
        "✓ Completed".green().bold(),
        result.instances.len(),
        format_duration(result.duration),
        paths.output_dir.display()
    );

    Ok(())
}

/// Discover run instances and apply the iteration filters
fn select_instances(
    config: &RunConfig,
    args: &RunArgs,
    layout: &BidsLayout,
) -> Result<Vec<RunInstance>> {
    let mut space = ParameterSpace::discover(layout)?;

    let subjects = (!args.subjects.is_empty())
        .then(|| args.subjects.clone())
        .or_else(|| config.iteration.subjects.clone());
    let sessions = (!args.sessions.is_empty())
        .then(|| args.sessions.clone())
        .or_else(|| config.iteration.sessions.clone());

    if let Some(subjects) = subjects {
        space.restrict(SUBJECT_KEY, &subjects)?;
    }
    if let Some(sessions) = sessions {
        space.restrict(SESSION_KEY, &sessions)?;
    }

    let mut instances: Vec<RunInstance> = space.expand().collect();

    if config.iteration.skip_missing_sessions {
        let before = instances.len();
        instances.retain(|instance| layout.has_session(instance));
        let skipped = before - instances.len();
        if skipped > 0 {
            print_warning(&format!("Skipping {} subject/session pairs without data", skipped));
        }
    }

    if instances.is_empty() {
        return Err(FlowError::EmptyParameterSpace {
            reason: "no subject/session pair has data".into(),
        }
        .into());
    }

    Ok(instances)
}

/// Print one row per run instance
fn print_summary(results: &[InstanceResult], reports: &[CollectionReport]) {
    let width = results
        .iter()
        .map(|r| r.instance.to_string().len())
        .max()
        .unwrap_or(0)
        .max("Instance".len());

    println!();
    println!("{}", "Summary".bold());
    println!(
        "  {:<width$}  {:<9}  {:>4}  {:>6}  {:>6}  {:>9}  {:>8}",
        "Instance", "Status", "Ran", "Cached", "Failed", "Collected", "Time",
        width = width
    );
    println!("  {}", "─".repeat(width + 56));

    for (result, report) in results.iter().zip(reports) {
        let status = if result.was_cancelled() {
            format!("{:<9}", "cancelled").yellow()
        } else if result.success() {
            format!("{:<9}", "ok").green()
        } else {
            format!("{:<9}", "failed").red()
        };

        println!(
            "  {:<width$}  {}  {:>4}  {:>6}  {:>6}  {:>9}  {:>8}",
            result.instance.to_string(),
            status,
            result.count(NodeStatus::Succeeded),
            result.count(NodeStatus::Cached),
            result.count(NodeStatus::Failed),
            report.collected.len(),
            format_duration(result.duration),
            width = width
        );
    }
}

/// Print the cause of each failure
fn print_failures(results: &[InstanceResult], reports: &[CollectionReport], verbose: bool) {
    for (result, report) in results.iter().zip(reports) {
        let failures: Vec<_> = result.root_failures().collect();
        if failures.is_empty() && report.is_complete() {
            continue;
        }

        eprintln!();
        eprintln!("{}", format!("Run instance {} failed:", result.instance).red().bold());

        for record in failures {
            let Some(error) = &record.error else { continue };
            eprintln!("  {} {} ({}): {}", "✗".red(), record.node.bold(), error.kind, error.message);
            if verbose {
                if let Some(command) = &record.command {
                    eprintln!("    {}", command.dimmed());
                }
            }
        }

        let downstream = result
            .records
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
            .count()
            - result.root_failures().count();
        if downstream > 0 {
            eprintln!("    {}", format!("{} downstream nodes not run", downstream).dimmed());
        }

        for (binding, error) in &report.errors {
            eprintln!("  {} output {}: {}", "⚠".yellow(), binding, error);
        }
    }
}
