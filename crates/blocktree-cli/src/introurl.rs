//! Intro URL parsing.
//!
//! `<base>/<64-hex-intro-address>#<percent-encoded-unlock-key>` — the base
//! is either an HTTP(S) URL or a local chunk directory, and the fragment
//! carries the unlock key. A missing fragment is allowed here; the caller
//! decides whether it can prompt for the key instead.

use anyhow::{bail, Context, Result};
use percent_encoding::percent_decode_str;

use blocktree_core::types::{from_hex, Address};

/// Where the chunks of a parsed intro URL live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKind {
    Http,
    Directory,
}

/// A parsed intro URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroUrl {
    pub base: String,
    pub kind: BaseKind,
    pub address: Address,
    pub unlock_key: Option<Vec<u8>>,
}

pub fn parse(url: &str) -> Result<IntroUrl> {
    let (location, fragment) = match url.split_once('#') {
        Some((location, fragment)) => (location, Some(fragment)),
        None => (url, None),
    };

    let (base, hex_name) = match location.rsplit_once('/') {
        Some((base, hex_name)) => (base.to_string(), hex_name),
        // A bare address resolves against the current directory.
        None => (".".to_string(), location),
    };

    if hex_name.len() != 64 {
        bail!("intro address must be 64 hex characters, got {}", hex_name.len());
    }
    let address = from_hex(hex_name).context("intro address is not valid hex")?;

    let unlock_key = match fragment {
        Some("") | None => None,
        Some(fragment) => Some(percent_decode_str(fragment).collect::<Vec<u8>>()),
    };

    let kind = if base.starts_with("http://") || base.starts_with("https://") {
        BaseKind::Http
    } else {
        BaseKind::Directory
    };

    Ok(IntroUrl {
        base,
        kind,
        address,
        unlock_key,
    })
}
