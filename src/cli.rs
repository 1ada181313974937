//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tunnel-pilot - supervise ephemeral OpenVPN endpoints with automatic failover
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log at debug level (RUST_LOG still applies otherwise)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Connect and probe timeout in seconds, overriding the config file
    #[arg(long, global = true, env = "TUNNEL_PILOT_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Read the catalog from a local feed file instead of the mirrors
    #[arg(long, global = true, value_name = "FILE")]
    pub catalog_file: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch the endpoint catalog and print it, fastest first
    List {
        /// Show at most this many endpoints
        #[arg(short, long, default_value_t = 25)]
        limit: usize,
        /// Only show endpoints from this country
        #[arg(short, long)]
        country: Option<String>,
    },
    /// Probe one endpoint by name, or every endpoint with --all
    Probe {
        /// Endpoint name as shown by `list`
        #[arg(required_unless_present = "all")]
        name: Option<String>,
        /// Probe the whole catalog
        #[arg(long, conflicts_with = "name")]
        all: bool,
        /// Parallel probes for --all (each gets its own interface)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
    /// Connect to the named endpoint, or the fastest eligible one, until Ctrl-C
    Connect {
        /// Endpoint name as shown by `list`
        name: Option<String>,
    },
    /// Keep a tunnel up, failing over across the catalog, until Ctrl-C
    Auto,
    /// Never select endpoints from this country
    Block {
        country: String,
    },
    /// Allow endpoints from this country again
    Unblock {
        country: String,
    },
    /// Print the effective configuration
    Config,
    /// Check that the tunnel engine and data directories are usable
    Doctor,
}
