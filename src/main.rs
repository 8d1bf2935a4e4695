mod chunk;
mod cli;
mod commands;
mod connection;
mod downloader;
mod error;
mod limiter;
mod protocol;
mod source;
mod state;
mod transport;
mod utils;
mod writer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::ResumeMode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable multi-connection downloader for HTTP, HTTPS and FTP", long_about = None)]
struct Args {
    /// URL of the file to download
    #[arg(index = 1)]
    url: String,

    /// Directory to save the downloaded file
    #[arg(short = 'd', long = "download-dir", default_value = ".")]
    download_dir: PathBuf,

    /// Output file name (defaults to the name in the URL)
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Number of concurrent connections (defaults to number of logical CPUs)
    #[arg(short = 'n', long)]
    connections: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Seconds a connection may go without data before it is reopened
    #[arg(short = 't', long, default_value_t = 10)]
    timeout: u64,

    /// Consecutive retries per part before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Resume behaviour when a previous run left state behind
    #[arg(long, value_enum, default_value = "auto")]
    resume: ResumeMode,

    /// HTTP proxy address (ip:port), plain HTTP only
    #[arg(long)]
    proxy: Option<SocketAddr>,

    /// FTP user name (defaults to anonymous)
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// FTP password
    #[arg(short = 'p', long)]
    password: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let opts = commands::RunOptions {
        url: args.url,
        output_dir: args.download_dir,
        file_name: args.output,
        connections: args.connections.unwrap_or_else(num_cpus::get).max(1),
        resume: args.resume,
        rate_limit: args.rate_limit.filter(|limit| *limit > 0),
        timeout: Duration::from_secs(args.timeout.max(1)),
        retries: args.retries,
        proxy: args.proxy,
        user: args.user,
        password: args.password,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(opts))
}
