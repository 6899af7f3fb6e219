//! The HTTP transfer loop: HEAD sizing, byte-range resume, streaming
//! writes with cancel/pause polling on every chunk.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::progress::DownloadProgress;
use crate::{DownloadError, Result};

/// How long the transfer loop sleeps between pause re-checks.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Remote file metadata obtained without downloading.
#[derive(Debug, Clone, Copy)]
pub struct RemoteFileInfo {
    pub total_bytes: u64,
}

/// Fetch the remote file size via HEAD.
pub async fn get_url_file_info(client: &Client, url: &str) -> Result<RemoteFileInfo> {
    let response = client.head(url).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let total_bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if total_bytes == 0 {
        return Err(DownloadError::MissingContentLength(url.to_string()));
    }

    Ok(RemoteFileInfo { total_bytes })
}

/// What to do with a local file before transferring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// No usable partial data; write from byte zero.
    StartFresh,
    /// Append starting at `offset`.
    Resume { offset: u64 },
    /// Local file already matches the remote length.
    AlreadyComplete { size: u64 },
}

/// Decide whether a local file can be resumed against the remote length.
///
/// Resumable iff the file exists, is non-empty and strictly shorter than
/// the remote. A longer local file is treated as corrupt and rewritten.
pub fn resume_action(local_size: Option<u64>, remote_total: u64) -> ResumeAction {
    match local_size {
        None | Some(0) => ResumeAction::StartFresh,
        Some(size) if size < remote_total => ResumeAction::Resume { offset: size },
        Some(size) if size == remote_total => ResumeAction::AlreadyComplete { size },
        Some(size) => {
            tracing::warn!(
                local_bytes = size,
                remote_bytes = remote_total,
                "Local file is larger than expected, restarting from scratch"
            );
            ResumeAction::StartFresh
        }
    }
}

fn local_file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Outcome of a transfer that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { total_bytes: u64 },
    AlreadyComplete { total_bytes: u64 },
    Cancelled,
}

/// Run the transfer for `progress`, resuming a partial file if possible.
///
/// The loop polls `progress.cancelled` on every chunk and honors
/// `progress.paused` by sleeping in short ticks. Progress fields are
/// updated through the record; partial data stays on disk whatever
/// happens.
pub async fn run_transfer(client: &Client, progress: &DownloadProgress) -> Result<TransferOutcome> {
    let url = progress.url.as_str();
    let info = get_url_file_info(client, url).await?;
    let total = info.total_bytes;

    let mut offset = match resume_action(local_file_size(&progress.local_path), total) {
        ResumeAction::AlreadyComplete { size } => {
            progress.mark_complete_bytes(size);
            return Ok(TransferOutcome::AlreadyComplete { total_bytes: size });
        }
        ResumeAction::Resume { offset } => {
            tracing::info!(
                model_id = %progress.model_id,
                offset,
                total,
                "Resuming partial download"
            );
            offset
        }
        ResumeAction::StartFresh => 0,
    };

    if let Some(parent) = progress.local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(header::RANGE, format!("bytes={offset}-"));
    }
    let response = request.send().await?;

    let status = response.status();
    if !(status.is_success() || status == StatusCode::PARTIAL_CONTENT) {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    // A 200 to a ranged request means the server ignored the range;
    // restart from byte zero rather than appending a duplicate prefix.
    if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
        tracing::warn!(
            model_id = %progress.model_id,
            "Server does not support byte ranges, restarting download"
        );
        offset = 0;
    }

    let mut file = if offset > 0 {
        OpenOptions::new()
            .append(true)
            .open(&progress.local_path)
            .await?
    } else {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&progress.local_path)
            .await?
    };

    let mut downloaded = offset;
    let mut last_milestone = 0u32;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;

        if progress.is_cancelled() {
            file.flush().await?;
            return Ok(TransferOutcome::Cancelled);
        }

        while progress.is_paused() && !progress.is_cancelled() {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
        if progress.is_cancelled() {
            file.flush().await?;
            return Ok(TransferOutcome::Cancelled);
        }

        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        let percentage = downloaded as f64 / total as f64 * 100.0;
        progress.record_progress(downloaded, total, percentage);

        // Log milestones only at each additional 10% to avoid flooding
        let milestone = (percentage / 10.0) as u32 * 10;
        if milestone != last_milestone && milestone > 0 {
            last_milestone = milestone;
            tracing::info!(
                model_id = %progress.model_id,
                milestone,
                downloaded,
                total,
                "Download progress"
            );
        }
    }

    file.flush().await?;

    if downloaded < total {
        return Err(DownloadError::Incomplete {
            expected: total,
            got: downloaded,
        });
    }

    Ok(TransferOutcome::Completed { total_bytes: total })
}
