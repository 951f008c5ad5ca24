//! The `import` driver: sparse source -> tree writer -> chunk directory.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::info;

use blocktree_core::{to_hex, TreeWriter, WriterConfig};
use blocktree_fs::FsStore;

use crate::sparse::{Section, SparseInput};

const COPY_BUFFER: usize = 256 * 1024;

/// Log a progress line roughly every 64 MiB of input.
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

pub struct ImportArgs {
    pub input: String,
    pub unlock_key: String,
    pub repo_key: String,
    pub target: PathBuf,
    pub chunk_size: u32,
    pub block_size: u32,
    pub uncompressed: bool,
}

struct Progress {
    consumed: u64,
    next_report: u64,
}

impl Progress {
    fn new() -> Progress {
        Progress {
            consumed: 0,
            next_report: PROGRESS_STEP,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.consumed += bytes;
        if self.consumed >= self.next_report {
            info!(consumed = self.consumed, "importing");
            self.next_report = self.consumed + PROGRESS_STEP;
        }
    }
}

pub async fn run(args: ImportArgs) -> Result<()> {
    let store = Arc::new(
        FsStore::new(&args.target)
            .with_context(|| format!("opening chunk directory {}", args.target.display()))?,
    );
    let config = WriterConfig {
        chunk_size_log2: args.chunk_size,
        block_size: args.block_size,
        compress: !args.uncompressed,
    };
    let mut writer = TreeWriter::new(
        store,
        config,
        args.repo_key.as_bytes(),
        args.unlock_key.as_bytes(),
    )?;
    let mut progress = Progress::new();

    if args.input == "-" {
        copy_stream(std::io::stdin().lock(), &mut writer, &mut progress, None).await?;
    } else {
        let file = File::open(&args.input)
            .with_context(|| format!("opening input {}", args.input))?;
        let mut source = SparseInput::new(file)?;
        while let Some(section) = source.next_section()? {
            match section {
                Section::Hole(zeros) => {
                    writer.write_zeros(zeros).await?;
                    progress.advance(zeros);
                }
                Section::Data(limit) => {
                    copy_stream(&mut source, &mut writer, &mut progress, limit).await?;
                }
            }
        }
    }

    let outcome = writer.finish().await?;
    info!(
        total_size = outcome.total_size,
        layers = outcome.layers,
        unique_chunks = outcome.stats.unique_chunks,
        unique_bytes = outcome.stats.unique_bytes,
        reused_chunks = outcome.stats.reused_chunks,
        reused_bytes = outcome.stats.reused_bytes,
        "import complete"
    );

    println!(
        "{}#{}",
        to_hex(&outcome.intro_address),
        utf8_percent_encode(&args.unlock_key, NON_ALPHANUMERIC)
    );
    Ok(())
}

/// Copy `limit` bytes (or everything, when unbounded) from `source` into
/// the writer.
async fn copy_stream<R: Read>(
    mut source: R,
    writer: &mut TreeWriter<FsStore>,
    progress: &mut Progress,
    limit: Option<u64>,
) -> Result<()> {
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut remaining = limit;

    loop {
        let want = match remaining {
            Some(0) => break,
            Some(n) => (n as usize).min(buffer.len()),
            None => buffer.len(),
        };
        let got = source.read(&mut buffer[..want])?;
        if got == 0 {
            if remaining.is_some() {
                bail!("input ended inside a data section");
            }
            break;
        }
        writer.write(&buffer[..got]).await?;
        progress.advance(got as u64);
        if let Some(n) = remaining.as_mut() {
            *n -= got as u64;
        }
    }
    Ok(())
}
