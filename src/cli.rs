use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Search and download tracks from a peer share", long_about = None)]
pub struct Cli {
    #[clap(long, global = true, help = "Read settings from a JSON file (never written)")]
    pub config: Option<PathBuf>,
    #[clap(short, long, global = true, help = "Write debug logs to ~/.dj-tools/logs")]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// How to reach the peer network.
#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    #[clap(long, help = "Serve this directory as the peer share")]
    pub mirror: PathBuf,
    #[clap(short, long, help = "Username (or DJ_TOOLS_USERNAME)")]
    pub username: Option<String>,
    #[clap(short, long, help = "Password (or DJ_TOOLS_PASSWORD)")]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "List ranked candidates for a query", display_order = 1)]
    Search {
        #[clap(flatten)]
        peer: PeerArgs,
        #[clap(num_args = 1.., required = true, help = "Search words")]
        query: Vec<String>,
        #[clap(long = "search-ms", help = "How long to collect results (default 2000)")]
        search_ms: Option<u64>,
        #[clap(long, help = "Accept any bitrate, not only 320kbps")]
        any_bitrate: bool,
    },
    #[clap(about = "Download the best match for every query", display_order = 2)]
    Download {
        #[clap(flatten)]
        peer: PeerArgs,
        #[clap(short, long, help = "File with one query per line ('#' starts a comment)")]
        queries: Option<PathBuf>,
        #[clap(long, conflicts_with = "queries", help = "JSON array of exact items to fetch")]
        items: Option<PathBuf>,
        #[clap(short = 'c', long = "concurrency", help = "Concurrent downloads (default 6)")]
        concurrency: Option<usize>,
        #[clap(long = "max-time", help = "Per-attempt deadline in seconds (default 120)")]
        max_time: Option<u64>,
        #[clap(long = "expire-retries", help = "Retries after a deadline expiry (default 2)")]
        expire_retries: Option<u32>,
        #[clap(long = "fail-retries", help = "Retries after a failed attempt (default 2)")]
        fail_retries: Option<u32>,
        #[clap(long = "out", help = "Base directory for session folders (default: cwd)")]
        out: Option<PathBuf>,
        #[clap(long, help = "Burn the folder to disc afterwards")]
        burn: bool,
        #[clap(long, help = "Open the folder afterwards")]
        open: bool,
        #[clap(long, help = "Delete the folder afterwards")]
        discard: bool,
        #[clap(long, help = "Print the summary as JSON")]
        json: bool,
        #[clap(long, help = "Hide per-download spinners")]
        quiet: bool,
    },
    #[clap(about = "Check that the credentials can connect", display_order = 3)]
    Check {
        #[clap(flatten)]
        peer: PeerArgs,
    },
}
