//! Shared progress records for in-flight and recently finished downloads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kolosal_inference::LoadingParameters;

/// Parameters for the engine created once a download completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCreationParams {
    pub model_id: String,
    pub load_immediately: bool,
    pub main_gpu_id: i32,
    pub load_params: LoadingParameters,
    /// Backend to bind; `None` lets the coordinator pick its default.
    pub backend_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Completed,
    AlreadyComplete,
    Failed,
    Cancelled,
    CreatingEngine,
    EngineCreated,
    EngineCreationFailed,
    EngineAlreadyExists,
}

impl DownloadStatus {
    /// Terminal records can be purged and restarted; active ones cannot.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::Downloading | Self::Paused | Self::CreatingEngine
        )
    }

    /// States from which a cancel request is honored.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::Paused | Self::CreatingEngine
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::AlreadyComplete => "already_complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::CreatingEngine => "creating_engine",
            Self::EngineCreated => "engine_created",
            Self::EngineCreationFailed => "engine_creation_failed",
            Self::EngineAlreadyExists => "engine_already_exists",
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    status: DownloadStatus,
    total_bytes: u64,
    downloaded_bytes: u64,
    percentage: f64,
    error_message: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

/// One download's live state.
///
/// The atomic flags are polled by the transfer loop on every progress
/// tick; everything else is updated under the record's mutex and read
/// through [`DownloadProgress::snapshot`].
#[derive(Debug)]
pub struct DownloadProgress {
    pub model_id: String,
    pub url: String,
    pub local_path: PathBuf,
    pub engine_params: Option<EngineCreationParams>,
    pub cancelled: AtomicBool,
    pub paused: AtomicBool,
    state: Mutex<ProgressState>,
}

impl DownloadProgress {
    pub fn new(model_id: &str, url: &str, local_path: PathBuf) -> Self {
        Self::with_engine_params(model_id, url, local_path, None)
    }

    pub fn with_engine_params(
        model_id: &str,
        url: &str,
        local_path: PathBuf,
        engine_params: Option<EngineCreationParams>,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            url: url.to_string(),
            local_path,
            engine_params,
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(ProgressState {
                status: DownloadStatus::Downloading,
                total_bytes: 0,
                downloaded_bytes: 0,
                percentage: 0.0,
                error_message: None,
                start_time: Utc::now(),
                end_time: None,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: DownloadStatus) {
        self.state.lock().status = status;
    }

    /// Record a progress tick, clamping anomalous percentages.
    pub fn record_progress(&self, downloaded: u64, total: u64, percentage: f64) {
        let percentage = sanitize_percentage(&self.model_id, percentage);
        let mut state = self.state.lock();
        state.downloaded_bytes = downloaded;
        state.total_bytes = total;
        state.percentage = percentage;
    }

    /// Transition into a terminal state, stamping the end time.
    pub fn finish(&self, status: DownloadStatus, error_message: Option<String>) {
        let mut state = self.state.lock();
        state.status = status;
        state.error_message = error_message;
        state.end_time = Some(Utc::now());
    }

    /// Mark the file as fully present on disk.
    pub fn mark_complete_bytes(&self, total: u64) {
        let mut state = self.state.lock();
        state.total_bytes = total;
        state.downloaded_bytes = total;
        state.percentage = 100.0;
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().end_time
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        let now = Utc::now();
        let elapsed_end = state.end_time.unwrap_or(now);
        let elapsed_seconds = (elapsed_end - state.start_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let download_speed_bps = if elapsed_seconds > 0.0 {
            state.downloaded_bytes as f64 / elapsed_seconds
        } else {
            0.0
        };
        let estimated_remaining_seconds = if download_speed_bps > 0.0
            && state.total_bytes > state.downloaded_bytes
        {
            Some((state.total_bytes - state.downloaded_bytes) as f64 / download_speed_bps)
        } else {
            None
        };

        ProgressSnapshot {
            model_id: self.model_id.clone(),
            url: self.url.clone(),
            local_path: self.local_path.to_string_lossy().to_string(),
            status: state.status,
            total_bytes: state.total_bytes,
            downloaded_bytes: state.downloaded_bytes,
            percentage: state.percentage,
            download_speed_bps,
            elapsed_seconds,
            estimated_remaining_seconds,
            error_message: state.error_message.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            engine_params: self.engine_params.clone(),
        }
    }
}

/// Clamp a reported percentage into [0, 100], rejecting NaN/Inf.
fn sanitize_percentage(model_id: &str, percentage: f64) -> f64 {
    if percentage.is_nan() || percentage.is_infinite() {
        tracing::warn!(
            model_id,
            percentage,
            "Invalid percentage value, clamping to valid range"
        );
        return 0.0;
    }
    if !(0.0..=100.0).contains(&percentage) {
        tracing::warn!(
            model_id,
            percentage,
            "Invalid percentage value, clamping to valid range"
        );
        return percentage.clamp(0.0, 100.0);
    }
    percentage
}

/// Point-in-time copy of a download's state, as exposed over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub model_id: String,
    pub url: String,
    pub local_path: String,
    pub status: DownloadStatus,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub percentage: f64,
    pub download_speed_bps: f64,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_params: Option<EngineCreationParams>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_clamped_to_valid_range() {
        let progress = DownloadProgress::new("m", "https://x/m.gguf", PathBuf::from("/tmp/m"));
        progress.record_progress(10, 100, 150.0);
        assert_eq!(progress.snapshot().percentage, 100.0);
        progress.record_progress(10, 100, -3.0);
        assert_eq!(progress.snapshot().percentage, 0.0);
    }

    #[test]
    fn nan_and_inf_percentages_are_rejected() {
        let progress = DownloadProgress::new("m", "https://x/m.gguf", PathBuf::from("/tmp/m"));
        progress.record_progress(10, 100, f64::NAN);
        assert_eq!(progress.snapshot().percentage, 0.0);
        progress.record_progress(10, 100, f64::INFINITY);
        assert_eq!(progress.snapshot().percentage, 0.0);
        progress.record_progress(10, 100, f64::NEG_INFINITY);
        assert_eq!(progress.snapshot().percentage, 0.0);
    }

    #[test]
    fn finish_stamps_end_time_after_start() {
        let progress = DownloadProgress::new("m", "https://x/m.gguf", PathBuf::from("/tmp/m"));
        progress.finish(DownloadStatus::Completed, None);
        let snap = progress.snapshot();
        assert!(snap.end_time.unwrap() >= snap.start_time);
    }

    #[test]
    fn terminal_states_match_cancellable_states() {
        use DownloadStatus::*;
        for status in [
            Downloading,
            Paused,
            Completed,
            AlreadyComplete,
            Failed,
            Cancelled,
            CreatingEngine,
            EngineCreated,
            EngineCreationFailed,
            EngineAlreadyExists,
        ] {
            assert_eq!(status.is_terminal(), !status.is_cancellable());
        }
    }

    #[test]
    fn status_strings_use_snake_case() {
        assert_eq!(DownloadStatus::EngineAlreadyExists.as_str(), "engine_already_exists");
        let json = serde_json::to_string(&DownloadStatus::AlreadyComplete).unwrap();
        assert_eq!(json, "\"already_complete\"");
    }
}
