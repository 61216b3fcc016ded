use chrono::{DateTime, Utc};
use futures_util::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::rembg::{Cutout, ImageSource, ProgressEvent, ProgressReceiver, ProgressSender, RemovalOptions};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work item payload: where to read the image and how to shape the alpha.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub source: ImageSource,
    pub options: RemovalOptions,
}

impl ImageRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            options: RemovalOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RemovalOptions) -> Self {
        self.options = options;
        self
    }
}

impl From<ImageSource> for ImageRequest {
    fn from(source: ImageSource) -> Self {
        Self::new(source)
    }
}

impl FromStr for ImageRequest {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self::new(s.parse()?))
    }
}

/// Owned by the coordinator from submission until it settles. Settling
/// consumes the task, so its result is delivered at most once, and dropping
/// it closes the progress stream.
pub(crate) struct Task {
    pub id: TaskId,
    pub request: ImageRequest,
    pub submitted_at: DateTime<Utc>,
    progress: ProgressSender,
    result: oneshot::Sender<Result<Cutout>>,
}

impl Task {
    pub fn new(request: ImageRequest) -> (Self, TaskHandle) {
        let id = TaskId::generate();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();

        let task = Self {
            id: id.clone(),
            request,
            submitted_at: Utc::now(),
            progress: progress_tx,
            result: result_tx,
        };
        let handle = TaskHandle {
            id,
            progress: progress_rx,
            result: result_rx,
        };
        (task, handle)
    }

    pub fn report(&self, event: ProgressEvent) {
        let _ = self.progress.send(event);
    }

    pub fn resolve(self, cutout: Cutout) {
        let _ = self.result.send(Ok(cutout));
    }

    pub fn reject(self, error: PoolError) {
        let _ = self.result.send(Err(error));
    }

    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.submitted_at)
            .num_milliseconds()
    }
}

/// Caller side of a submitted task.
///
/// Awaiting the handle yields the result. Polling it as a [`Stream`] yields
/// the task's progress events; the stream ends once the task has settled.
pub struct TaskHandle {
    id: TaskId,
    progress: ProgressReceiver,
    result: oneshot::Receiver<Result<Cutout>>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub async fn next_progress(&mut self) -> Option<ProgressEvent> {
        self.progress.recv().await
    }

    /// Drains progress into `on_progress`, then returns the result.
    pub async fn wait_with_progress(
        mut self,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<Cutout> {
        while let Some(event) = self.progress.recv().await {
            on_progress(event);
        }
        self.await
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Future for TaskHandle {
    type Output = Result<Cutout>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the coordinator is gone without settling us.
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(PoolError::terminated())))
    }
}

impl Stream for TaskHandle {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.progress.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::rembg::ProgressStatus;
    use futures_util::StreamExt;

    fn request() -> ImageRequest {
        ImageSource::from(vec![0u8]).into()
    }

    #[tokio::test]
    async fn progress_stream_ends_when_task_settles() {
        let (task, mut handle) = Task::new(request());
        task.report(ProgressEvent::new(ProgressStatus::Processing));
        task.resolve(Cutout {
            width: 0,
            height: 0,
            image_data: Vec::new(),
        });

        assert_eq!(handle.next().await.unwrap().status, ProgressStatus::Processing);
        assert!(handle.next().await.is_none());
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn dropped_task_reads_as_terminated() {
        let (task, handle) = Task::new(request());
        drop(task);
        let err = handle.await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PoolTerminated);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }
}
