/*!
Concurrent model download management.

Each download runs on its own worker task and is tracked by a shared
progress record with cancel and pause flags the transfer loop polls.
Downloads started with engine-creation parameters hand off to the engine
coordinator (through the [`EngineDirectory`] seam) once the file is on
disk. Partial files are kept on cancellation or failure and resumed with
HTTP byte-range requests on the next attempt.
*/

use thiserror::Error;

pub mod manager;
pub mod progress;
pub mod transfer;
pub mod urls;

pub use manager::{DownloadManager, DownloadManagerConfig, EngineDirectory};
pub use progress::{DownloadProgress, DownloadStatus, EngineCreationParams, ProgressSnapshot};
pub use transfer::{resume_action, RemoteFileInfo, ResumeAction, TransferOutcome};
pub use urls::{extract_filename_from_url, generate_download_path, is_valid_url};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Remote reports no content length for {0}")]
    MissingContentLength(String),

    #[error("Transfer ended early: expected {expected} bytes, wrote {got}")]
    Incomplete { expected: u64, got: u64 },
}

pub type Result<T> = std::result::Result<T, DownloadError>;
