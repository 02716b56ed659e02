use tracing::info;

use crate::utils::unix_to_datetime;

/// Snapshot sent after every ingested chunk. Progress is measured in blocks,
/// since chunks differ wildly in how many logs they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    pub blocks_consumed: u64,
    pub total_blocks: u64,
    /// timestamp of the newest log seen so far
    pub current_timestamp: Option<u64>,
    pub candidate_count: usize,
}

impl ScanProgress {
    pub fn percent(&self) -> f64 {
        if self.total_blocks == 0 {
            return 100.0;
        }
        self.blocks_consumed as f64 * 100.0 / self.total_blocks as f64
    }
}

/// Observer for long scans. Implementations must not influence the scan.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &ScanProgress);
}

/// Logs every update at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, progress: &ScanProgress) {
        let at = progress
            .current_timestamp
            .map(|ts| unix_to_datetime(ts).to_rfc3339())
            .unwrap_or_else(|| "-".to_string());

        info!(
            target: "vault_ingest::progress",
            blocks = progress.blocks_consumed,
            total = progress.total_blocks,
            candidates = progress.candidate_count,
            %at,
            "scanned {:.1}%",
            progress.percent()
        );
    }
}

/// Default reporter; drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _: &ScanProgress) {}
}
