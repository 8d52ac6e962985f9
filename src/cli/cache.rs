// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Cache command - inspect and manage execution records

use colored::Colorize;
use miette::Result;
use std::io::{self, Write};
use std::path::Path;

use super::{load_config, CacheAction};
use crate::cache::{FilesystemRecordStore, RecordStore};
use crate::params::{SESSION_KEY, SUBJECT_KEY};
use crate::utils::{format_age, print_header, status_symbol};

/// Run the cache command
pub async fn run(config_path: &Path, action: CacheAction, _verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let working_dir = config.paths().working_dir;
    let store = FilesystemRecordStore::new(&working_dir)?;

    match action {
        CacheAction::Stats => {
            let stats = store.stats().await?;

            print_header("Execution Records");
            println!("  Location:  {}", working_dir.display());
            println!("  Records:   {}", stats.entries);
            println!("  Succeeded: {}", stats.succeeded);
            println!("  Failed:    {}", stats.failed);
            println!("  Size:      {}", stats.formatted_size());

            if let Some(oldest) = stats.oldest_entry {
                if let Ok(duration) = oldest.elapsed() {
                    println!("  Oldest:    {} ago", format_age(duration));
                }
            }

            if let Some(newest) = stats.newest_entry {
                if let Ok(duration) = newest.elapsed() {
                    println!("  Newest:    {} ago", format_age(duration));
                }
            }

            Ok(())
        }

        CacheAction::List => {
            let records = store.list_records().await?;

            print_header("Execution Records");
            if records.is_empty() {
                println!("{}", "  No records.".dimmed());
                return Ok(());
            }

            let mut current = None;
            for record in &records {
                let instance = record.instance.to_string();
                if current.as_ref() != Some(&instance) {
                    println!();
                    println!("{}", instance.bold());
                    current = Some(instance);
                }

                let key: String = record.cache_key.chars().take(12).collect();
                let error = record
                    .error
                    .as_ref()
                    .map(|e| format!(" ({})", e.kind))
                    .unwrap_or_default();
                println!(
                    "  {} {:<28} {}{}",
                    status_symbol(record.status),
                    record.node,
                    key.dimmed(),
                    error.red()
                );
            }

            Ok(())
        }

        CacheAction::Clear { yes } => {
            let stats = store.stats().await?;

            if stats.entries == 0 {
                println!("{}", "No records to clear.".dimmed());
                return Ok(());
            }

            if !yes {
                print!("Clear {} execution records? [y/N] ", stats.entries);
                io::stdout().flush().ok();

                let mut input = String::new();
                io::stdin().read_line(&mut input).ok();

                if !input.trim().eq_ignore_ascii_case("y") {
                    println!("{}", "Cancelled.".dimmed());
                    return Ok(());
                }
            }

            store.clear().await?;
            println!("{}", "Records cleared; every node will re-run.".green());

            Ok(())
        }

        CacheAction::Invalidate {
            node,
            subject,
            session,
        } => {
            // Downstream records keep keys derived from this node's key, so they go too
            let validated = config.build_graph()?.validate()?;
            let Some(mut targets) = validated.dag().dependents(&node) else {
                return Err(miette::miette!(
                    help = "Run `petflow graph` to list the nodes of this workflow",
                    "Unknown node '{}'",
                    node
                ));
            };
            targets.push(node.clone());

            let matches = |value: Option<&str>, filter: &Option<String>| match filter {
                Some(wanted) => value == Some(wanted.as_str()),
                None => true,
            };

            let mut removed = 0;
            for record in store.list_records().await? {
                if targets.contains(&record.node)
                    && matches(record.instance.get(SUBJECT_KEY), &subject)
                    && matches(record.instance.get(SESSION_KEY), &session)
                {
                    store.invalidate(&record.instance, &record.node).await?;
                    removed += 1;
                }
            }

            if removed == 0 {
                println!("{}", format!("No records found for node '{}'.", node).dimmed());
            } else {
                println!(
                    "{}",
                    format!(
                        "Removed {} records of '{}' and its dependents; they will re-run.",
                        removed, node
                    )
                    .green()
                );
            }

            Ok(())
        }
    }
}
