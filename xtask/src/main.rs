//! Build automation tasks for gpipe
//!
//! This tool provides various automation tasks for the gpipe project, including:
//! - Generating CLI documentation from source code
//! - Future build-related tasks

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for gpipe", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate CLI documentation in markdown format
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    // Generate markdown from clap definitions
    let markdown = clap_markdown::help_markdown::<gpipe_cli::Cli>();

    // Create markdown content with frontmatter
    let content = format!(
        r#"---
title: CLI Reference
description: Complete command reference for the gpipe CLI
---

# gpipe CLI Reference

This documentation is auto-generated from the CLI source code. Last updated: {}.

## Overview

gpipe runs staged ETL pipelines from a YAML or JSON definition. Stages are
barriers: every task in a stage settles before the next stage starts. The
execution mode decides whether anything is made durable.

## Installation

### From Source

```bash
git clone https://github.com/gpipe-dev/gpipe.git
cd gpipe
cargo install --path crates/gpipe-cli
```

## Quick Start

```bash
# Rehearse a pipeline (DRY_RUN is the default mode)
gpipe pipeline.yaml

# Preview the plan without running anything
gpipe pipeline.yaml --plan-only

# Exercise the full write path, rolling every batch back
gpipe pipeline.yaml --mode NON_COMMIT --database-url $DATABASE_URL

# Run for real
gpipe pipeline.yaml --mode COMMIT --database-url $DATABASE_URL

# Resume a failed run from where it stopped
gpipe pipeline.yaml --mode COMMIT --resume-at Load.Variants \
  --resume-checkpoint line=150000
```

## Flags

{}

## Environment Variables

- `DATABASE_URL` - Postgres connection string (same as `--database-url`)
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE` - logging setup
- `RUST_LOG` - per-module filter directives (e.g., `gpipe_engine=debug`)

## Pipeline Definitions

A pipeline is ordered stages of tasks:

```yaml
params:
  data_dir: /data/incoming

stages:
  - name: Verify
    tasks:
      - name: InputPresent
        type: VALIDATION
        params:
          check: file_exists
          file: "${{data_dir}}/variants.jsonl"

  - name: Load
    parallel_mode: THREAD
    max_concurrency: 4
    tasks:
      - name: Variants
        type: PLUGIN
        plugin: jsonl-loader
        params:
          file: "${{data_dir}}/variants.jsonl"
          table: variants

  - name: Wrap
    tasks:
      - name: Announce
        type: NOTIFY
        message: "run ${{run_id}} finished"
```

`${{key}}` placeholders in task params, shell commands, file paths, and
notify messages resolve against pipeline `params`, `--param` overrides, and
the engine-provided `run_id` and `mode`.

---

*This documentation is automatically generated from the CLI source code. To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    // Create output directory if it doesn't exist
    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    // Write the markdown file
    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("✅ Generated CLI documentation at: {}", file_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Review the generated documentation");
    println!("  2. Commit it to version control");
    println!("  3. Add a CI check to ensure docs stay in sync");

    Ok(())
}
