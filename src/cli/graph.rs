// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Graph command - visualize the workflow

use miette::Result;
use std::path::Path;

use super::{load_config, GraphFormat};

/// Run the graph command
pub async fn run(config_path: &Path, format: GraphFormat, _verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let validated = config.build_graph()?.validate()?;
    let dag = validated.dag();

    let output = match format {
        GraphFormat::Text => dag.to_text(validated.graph()),
        GraphFormat::Dot => dag.to_dot(),
        GraphFormat::Mermaid => dag.to_mermaid(validated.graph()),
    };

    println!("{}", output);

    Ok(())
}
