//! Progress sink: the collaborator interface a host UI implements to
//! observe a running job. The core never renders anything itself.

/// Implemented by callers that want live feedback from a backup or
/// restore job. A no-op default is provided so tests and simple
/// callers don't need to stub every method.
pub trait ProgressSink: Send + Sync {
    fn on_file_start(&self, _relative_path: &str) {}
    fn on_file_processed(&self, _relative_path: &str, _bytes: u64) {}
    fn on_file_error(&self, _relative_path: &str, _message: &str) {}
    fn on_file_skipped(&self, _relative_path: &str) {}
    fn on_progress(&self, _files_done: u64, _files_total: u64, _bytes_done: u64, _bytes_total: u64) {}
}

/// A sink that does nothing; the default for callers with no UI to
/// drive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {}
