use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProgressStatus {
    /// A model file download is starting.
    Initiate,
    /// Bytes are arriving for a file.
    Download,
    /// Generic percentage update.
    Progress,
    /// A file finished downloading.
    Done,
    /// Pipeline construction is underway.
    Loading,
    /// Pipeline construction finished.
    Ready,
    /// The image source is being resolved.
    Fetching,
    /// Image bytes are being decoded.
    Decoding,
    /// Inference is running.
    Processing,
    Error,
}

/// Incremental status object relayed to whoever waits on a task or on
/// pool initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Percentage, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl ProgressEvent {
    pub fn new(status: ProgressStatus) -> Self {
        Self {
            status,
            message: None,
            progress: None,
            file: None,
            loaded: None,
            total: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress.clamp(0.0, 100.0));
        self
    }

    /// Byte-level download update; `progress` is derived when the total is known.
    pub fn download(file: impl Into<String>, loaded: u64, total: Option<u64>) -> Self {
        let mut event = Self::new(ProgressStatus::Download).with_file(file);
        event.loaded = Some(loaded);
        event.total = total;
        if let Some(total) = total.filter(|t| *t > 0) {
            event = event.with_progress(loaded as f32 * 100.0 / total as f32);
        }
        event
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ProgressStatus::Error).with_message(message)
    }
}

/// Channel halves carrying progress to a task handle or the init sink.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Callback used by pipeline loaders and image sources to publish progress
/// without knowing where it is routed.
#[derive(Clone)]
pub struct ProgressReporter(Arc<dyn Fn(ProgressEvent) + Send + Sync>);

impl ProgressReporter {
    pub fn new(f: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}

impl From<ProgressSender> for ProgressReporter {
    fn from(tx: ProgressSender) -> Self {
        Self::new(move |event| {
            let _ = tx.send(event);
        })
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}
