//! blocktree - content-addressed encrypted block devices
//!
//! Usage:
//!   blocktree import <input> <unlock-key> <repo-key> <target-dir>
//!   blocktree connect <device> <intro-url>
//!
//! `import` serializes a byte device into a directory of opaque chunks and
//! prints the intro line `<hex-address>#<percent-encoded-unlock-key>`.
//! `connect` attaches an imported image to a kernel NBD device, read-only.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod connect;
mod import;
mod introurl;
mod sparse;

#[derive(Parser)]
#[command(name = "blocktree")]
#[command(about = "Content-addressed encrypted block devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a byte device into a chunk directory
    Import {
        /// Input file, or - for standard input
        input: String,
        /// Unlock key encrypting the intro chunk
        unlock_key: String,
        /// Repository key deriving all chunk keys
        repo_key: String,
        /// Directory receiving the chunk files
        target: PathBuf,
        /// Leaf span exponent; leaves hold 2^N bytes
        #[arg(long, default_value_t = 18)]
        chunk_size: u32,
        /// Block size advertised to the kernel
        #[arg(long, default_value_t = 4096)]
        block_size: u32,
        /// Store chunk bodies without compression
        #[arg(long)]
        uncompressed: bool,
    },
    /// Attach an imported image to an NBD device
    Connect {
        /// NBD device node, e.g. /dev/nbd0
        device: PathBuf,
        /// Intro URL: <base>/<64-hex-address>#<unlock-key>
        url: String,
        /// Chunk cache capacity in entries
        #[arg(long, default_value_t = 32)]
        cache_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Import {
            input,
            unlock_key,
            repo_key,
            target,
            chunk_size,
            block_size,
            uncompressed,
        } => {
            import::run(import::ImportArgs {
                input,
                unlock_key,
                repo_key,
                target,
                chunk_size,
                block_size,
                uncompressed,
            })
            .await
        }
        Commands::Connect {
            device,
            url,
            cache_size,
        } => {
            connect::run(connect::ConnectArgs {
                device,
                url,
                cache_size,
            })
            .await
        }
    }
}
