//! gpipe - Main entry point

use clap::Parser;
use gpipe_cli::Cli;
use gpipe_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // Pick up DATABASE_URL and LOG_* from a local .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Handle markdown help generation
    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    // Environment supplies the baseline, flags override what they name
    let mut log_config = LogConfig::from_env().unwrap_or_default();
    log_config.log_file_prefix = "gpipe".to_string();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    if let Some(path) = &cli.log_file {
        log_config.log_file = Some(path.clone());
        if log_config.output == LogOutput::Console {
            log_config.output = LogOutput::Both;
        }
    }

    // Initialize logging (ignore errors as the CLI should work without logging)
    let _ = init_logging(&log_config);

    match gpipe_cli::run::execute(&cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Run failed");
            eprintln!("Error: {e}");
            process::exit(1);
        },
    }
}
