//! The `connect` driver: intro URL -> reader -> kernel NBD device.

use std::io::{IsTerminal, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use blocktree_core::{BlobStore, ChunkReader, MemoryCache};
use blocktree_fs::FsStore;
use blocktree_http::HttpStore;
use blocktree_nbd::{serve, NbdDevice};

use crate::introurl::{self, BaseKind};

pub struct ConnectArgs {
    pub device: PathBuf,
    pub url: String,
    pub cache_size: usize,
}

fn prompt_unlock_key() -> Result<Vec<u8>> {
    if !std::io::stdin().is_terminal() {
        bail!("intro URL carries no unlock key and standard input is not a terminal");
    }
    eprint!("Unlock key: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let key = line.trim_end_matches(['\r', '\n']);
    if key.is_empty() {
        bail!("unlock key must not be empty");
    }
    Ok(key.as_bytes().to_vec())
}

pub async fn run(args: ConnectArgs) -> Result<()> {
    let intro = introurl::parse(&args.url)?;
    let unlock_key = match intro.unlock_key.clone() {
        Some(key) => key,
        None => prompt_unlock_key()?,
    };

    let store: Arc<dyn BlobStore> = match intro.kind {
        BaseKind::Http => Arc::new(HttpStore::new(&intro.base)?),
        BaseKind::Directory => Arc::new(
            FsStore::new(&intro.base)
                .with_context(|| format!("opening chunk directory {}", intro.base))?,
        ),
    };
    let cache = Arc::new(MemoryCache::new(args.cache_size));
    let reader = ChunkReader::open(store, cache, intro.address, &unlock_key).await?;

    let block_size = reader.block_size();
    let blocks = reader.total_size() / block_size as u64;
    info!(
        total_size = reader.total_size(),
        block_size,
        blocks,
        device = %args.device.display(),
        "serving image"
    );
    if reader.total_size() % block_size as u64 != 0 {
        warn!("device size is not a whole number of blocks; the tail is not exported");
    }

    let device = Arc::new(
        NbdDevice::open(&args.device)
            .with_context(|| format!("opening NBD device {}", args.device.display()))?,
    );
    let (kernel_end, server_end) = std::os::unix::net::UnixStream::pair()?;

    device.set_block_size(block_size)?;
    device.set_block_count(blocks)?;
    device.set_read_only()?;
    device.set_socket(kernel_end.as_raw_fd())?;

    // The kernel blocks inside NBD_DO_IT until the device disconnects.
    let kernel_worker = {
        let device = device.clone();
        tokio::task::spawn_blocking(move || {
            let result = device.run();
            device.shutdown();
            result
        })
    };

    server_end.set_nonblocking(true)?;
    let mut stream = tokio::net::UnixStream::from_std(server_end)?;

    let outcome = tokio::select! {
        result = serve(&mut stream, &reader) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, disconnecting device");
            Ok(())
        }
    };

    // Tear the device down on every exit path; a second disconnect after a
    // clean one simply errors and is ignored.
    let _ = device.disconnect();
    drop(stream);
    drop(kernel_end);
    match kernel_worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("NBD_DO_IT returned: {}", e),
        Err(e) => warn!("device worker panicked: {}", e),
    }

    outcome?;
    info!("device disconnected");
    Ok(())
}
