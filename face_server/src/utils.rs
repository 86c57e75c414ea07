//! Utility functions
//!
use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
///
/// The content is written next to `filepath` first and moved into place once complete, so an
/// interrupted download never leaves a truncated file behind.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    let partial = filepath.with_extension("part");
    tokio::fs::write(&partial, &content)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    tokio::fs::rename(&partial, filepath)
        .await
        .with_context(|| format!("moving {} into place", filepath.display()))?;

    log::info!("Downloaded {} ({} bytes)", url, content.len());

    Ok(())
}
