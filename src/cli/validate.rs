// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Validate command - check configuration, graph, dataset and tools

use colored::Colorize;
use miette::Result;
use std::path::Path;

use super::{load_config, print_error_with_suggestion};
use crate::params::{BidsLayout, ParameterSpace};
use crate::pipeline::{GraphValidator, PipelineExecutor};
use crate::utils::{create_spinner, print_error, print_section, print_success, print_warning};

/// Run the validate command
pub async fn run(config_path: &Path, verbose: bool) -> Result<()> {
    println!("{}", "Validating workflow...".bold());
    println!();

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            print_error("Failed to load configuration");
            println!();
            return Err(e);
        }
    };
    print_success("Configuration is valid");

    let graph = config.build_graph()?;
    let validation = GraphValidator::validate(&graph);

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            print_error_with_suggestion(error);
        }
        println!();
        return Err(miette::miette!("Workflow validation failed"));
    }
    print_success(&format!(
        "Workflow '{}' is a valid graph of {} nodes",
        graph.name,
        graph.nodes.len()
    ));

    let validated = graph.validate()?;
    let mut warnings = validation.warnings;

    // A missing dataset or tool only matters at run time
    let paths = config.paths();
    match BidsLayout::new(&paths.data_dir).and_then(|layout| ParameterSpace::discover(&layout)) {
        Ok(space) => print_success(&format!(
            "Dataset {} has {} subject/session pairs",
            paths.data_dir.display(),
            space.len()
        )),
        Err(e) => warnings.push(e.to_string()),
    }

    let spinner = create_spinner("Checking required tools...");
    let missing = PipelineExecutor::with_default_executors()
        .check_tools(&validated)
        .await;
    spinner.finish_and_clear();
    let missing = missing?;
    for node in missing {
        warnings.push(format!("Tool for node '{}' is not available", node));
    }

    if !warnings.is_empty() {
        print_section("Warnings");
        for warning in &warnings {
            print_warning(warning);
        }
    }

    if verbose {
        let dag = validated.dag();
        print_section("Workflow summary");
        println!("  Name: {}", validated.graph().name);
        for idx in dag.topological_order() {
            let node = validated.node(idx);
            let deps: Vec<&str> = dag.predecessors(idx).into_iter().map(|d| dag.name(d)).collect();
            let deps = if deps.is_empty() {
                String::new()
            } else {
                format!(" [depends: {}]", deps.join(", "))
            };
            println!("    - {} ({}){}", node.name, node.action_kind(), deps.dimmed());
        }
        println!("  Outputs: {}", validated.graph().outputs.len());
    }

    println!();
    if warnings.is_empty() {
        println!("{}", "Workflow is valid!".green().bold());
    } else {
        println!("{}", "Workflow is valid but has warnings.".yellow().bold());
    }

    Ok(())
}
