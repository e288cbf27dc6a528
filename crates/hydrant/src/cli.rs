//! CLI argument parsing
//!
//! `hydrant [config_path] [input_path]`; with no input path the tool
//! consumes standard input until EOF.

use clap::Parser;
use std::path::PathBuf;

/// Hydrant - high-throughput streaming ingestion into PostgreSQL
///
/// Reads an opaque byte stream from a file or standard input and ships
/// it to the database in batched COPY transactions over a self-healing
/// connection pool.
#[derive(Parser, Debug)]
#[command(name = "hydrant")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a YAML config file; HYDRANT_DB_URL / HYDRANT_BATCH_SIZE
    /// are consulted when omitted
    pub config: Option<PathBuf>,

    /// Input file; standard input is consumed when omitted
    pub input: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}
