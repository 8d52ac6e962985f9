// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Terminal color utilities
//!
//! Provides consistent color schemes across the CLI.

use colored::{ColoredString, Colorize};

use crate::cache::NodeStatus;

/// Symbol shown next to a node in listings
pub fn status_symbol(status: NodeStatus) -> ColoredString {
    match status {
        NodeStatus::Succeeded => "✓".green(),
        NodeStatus::Cached => "↺".cyan(),
        NodeStatus::Failed => "✗".red(),
        NodeStatus::Running => "▶".blue(),
        NodeStatus::Pending => "○".dimmed(),
    }
}

/// Print a styled header
pub fn print_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "═".repeat(title.chars().count().max(40)));
}

/// Print a styled section
pub fn print_section(title: &str) {
    println!();
    println!("{}:", title.bold());
}

/// Print a success check
pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

/// Print an error cross
pub fn print_error(msg: &str) {
    println!("  {} {}", "✗".red(), msg);
}

/// Print a warning
pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠".yellow(), msg);
}
