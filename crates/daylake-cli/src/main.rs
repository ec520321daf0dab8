use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "logs/daylake.log";

#[derive(Debug, Parser)]
#[command(name = "daylake")]
#[command(about = "Download daily JSON over HTTP and convert new data to Parquet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data for the last N days, ending yesterday.
    #[arg(
        long,
        global = true,
        default_value_t = 7,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    days: u32,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, deduplicate and stage each date, then convert staged files to Parquet.
    Extract,
    /// Create the metadata table if it is missing.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_path = std::env::var("DAYLAKE_LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_FILE));
    let (file_layer, log_error) = match open_log_file(&log_path) {
        Ok(file) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(err) => (None, Some(err)),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("daylake=info,info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    if let Some(err) = log_error {
        warn!(path = %log_path.display(), error = %err, "file logging disabled");
    }

    let cli = Cli::parse();

    let outcome = match cli.command.unwrap_or(Commands::Extract) {
        Commands::Extract => daylake_sync::run_once_from_env(cli.days).await.map(|summary| {
            println!(
                "extract complete: range={}..={} requested={} staged={} converted={} conversion_failures={}",
                summary.start,
                summary.end,
                summary.requested_dates,
                summary.staged.len(),
                summary.converted,
                summary.conversion_failures
            );
        }),
        Commands::Migrate => daylake_sync::migrate_from_env().await.map(|()| {
            println!("migrate complete: metadata_tbl ready");
        }),
    };

    if let Err(err) = &outcome {
        error!(error = %format!("{err:#}"), "run failed");
    }
    outcome
}

/// Append-mode log file, creating its directory if needed.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_file_is_created_with_its_directory_and_appended() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("logs/daylake.log");

        writeln!(open_log_file(&path).expect("open"), "first").expect("write");
        writeln!(open_log_file(&path).expect("reopen"), "second").expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn days_must_be_positive() {
        assert!(Cli::try_parse_from(["daylake", "extract", "--days", "0"]).is_err());
        let cli = Cli::try_parse_from(["daylake", "--days", "3"]).expect("parse");
        assert_eq!(cli.days, 3);
        assert!(cli.command.is_none());
    }
}
