use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tokio::io::AsyncWriteExt;

use crate::cli::BuildArgs;
use crate::storage::{StoragePaths, file_present_nonempty};

const DEFAULT_SOURCE_NAME: &str = "utilization.csv";

/// Resolves `--source` to a local extract, downloading it into the source
/// directory when it is a URL.
pub async fn ensure_source(paths: &StoragePaths, opts: &BuildArgs) -> anyhow::Result<PathBuf> {
    let source = opts.source.trim();
    if !is_remote(source) {
        let local = PathBuf::from(source);
        if !file_present_nonempty(&local) {
            return Err(anyhow!(
                "Source extract not found or empty at {}",
                local.display()
            ));
        }
        return Ok(local);
    }

    paths.ensure_dirs().context("create data directories")?;
    let dest = paths.source_file(&file_name_from_url(source));
    tracing::info!("Source will be stored at {}", dest.display());

    if !opts.force_download && file_present_nonempty(&dest) {
        tracing::info!("Reusing downloaded extract {}", dest.display());
        return Ok(dest);
    }
    if opts.offline {
        return Err(anyhow!(
            "Missing source extract at {} (run without --offline to download from {}).",
            dest.display(),
            source
        ));
    }
    ensure_download(source, &dest, opts.force_download).await?;
    Ok(dest)
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Last path segment of `url`, without query or fragment.
fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or(DEFAULT_SOURCE_NAME)
        .to_string()
}

async fn ensure_download(url: &str, dest: &Path, force: bool) -> anyhow::Result<()> {
    if !force && file_present_nonempty(dest) {
        return Ok(());
    }

    let tmp = tmp_path(dest);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    tracing::info!("Downloading {} -> {}", url, dest.display());

    let client = reqwest::Client::new();
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;

    if !resp.status().is_success() {
        return Err(anyhow!("Download failed ({}): {}", resp.status(), url));
    }

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    use futures_util::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("read body chunk from {url}"))?;
        downloaded += chunk.len() as u64;
        file.write_all(&chunk).await?;

        if downloaded % (25 * 1024 * 1024) < chunk.len() as u64 {
            tracing::info!("... downloaded {} MB", downloaded / (1024 * 1024));
        }
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;

    Ok(())
}

fn tmp_path(dest: &Path) -> PathBuf {
    let fname = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{fname}.part"))
}
