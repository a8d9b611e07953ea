//! Command-line definitions for the `synapse` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run workflows and correlate events.
#[derive(Parser)]
#[command(name = "synapse", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (overridden by SYNAPSE_CONFIG).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Export spans through OpenTelemetry, in addition to the config setting.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the instance runner and the correlator until Ctrl+C.
    Run {
        /// Directory of workflow definitions published on startup.
        #[arg(short, long)]
        workflows: Option<PathBuf>,

        /// Newline-delimited CloudEvents to ingest (`-` for stdin).
        #[arg(short, long)]
        events: Option<String>,

        /// Use the default SQLite database when none is configured.
        #[arg(long)]
        persist: bool,
    },

    /// Parse and validate workflow definition files.
    Validate {
        /// Files or directories to check.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}
