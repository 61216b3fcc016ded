use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{ErrorKind, PoolError, Result};
use crate::rembg::{Cutout, Pipeline, PipelineLoader, ProgressEvent, ProgressReporter, ProgressStatus};
use crate::workers::protocol::{Directive, Event, UnitId, UnitMessage};
use crate::workers::task::ImageRequest;

/// Shared by every unit the pool spawns.
pub(crate) struct UnitContext {
    pub loader: Arc<dyn PipelineLoader>,
    pub client: Client,
    pub processor_config: Option<PathBuf>,
}

pub(crate) struct UnitHandle {
    pub id: UnitId,
    pub inbox: mpsc::UnboundedSender<Directive>,
    abort: AbortHandle,
}

impl UnitHandle {
    pub fn send(&self, directive: Directive) -> bool {
        self.inbox.send(directive).is_ok()
    }

    pub fn kill(&self) {
        self.abort.abort();
    }
}

/// Spawn a unit plus a supervisor that reports abnormal exits as faults.
pub(crate) fn spawn_unit(
    id: UnitId,
    ctx: Arc<UnitContext>,
    events: mpsc::UnboundedSender<Event>,
) -> UnitHandle {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(unit_loop(id, ctx, inbox_rx, events.clone()));
    let abort = worker.abort_handle();

    tokio::spawn(async move {
        let error = match worker.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(e) if e.is_cancelled() => return,
            Err(e) => PoolError::with_kind(ErrorKind::UnitFault, "unit_panicked").push_std(e),
        };
        let _ = events.send(Event::Fault { unit: id, error });
    });

    UnitHandle {
        id,
        inbox: inbox_tx,
        abort,
    }
}

/// Returns when the inbox closes. An `Err` means the unit is unusable.
async fn unit_loop(
    id: UnitId,
    ctx: Arc<UnitContext>,
    mut inbox: mpsc::UnboundedReceiver<Directive>,
    events: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let pipeline: OnceCell<Arc<Pipeline>> = OnceCell::new();
    let emit = |message: UnitMessage| {
        let _ = events.send(Event::Unit { unit: id, message });
    };
    let progress = {
        let events = events.clone();
        ProgressReporter::new(move |event| {
            let _ = events.send(Event::Unit {
                unit: id,
                message: UnitMessage::Progress(event),
            });
        })
    };

    while let Some(directive) = inbox.recv().await {
        match directive {
            Directive::Init => match ensure_pipeline(&pipeline, &ctx, &progress).await {
                Ok((_, true)) => {
                    progress.report(ProgressEvent::new(ProgressStatus::Ready));
                    emit(UnitMessage::Ready);
                }
                Ok((_, false)) => {}
                Err(e) => {
                    warn!(unit = %id, error = %e, "pipeline construction failed");
                    emit(UnitMessage::Error(e));
                }
            },
            Directive::Run { task_id, request } => {
                debug!(unit = %id, task = %task_id, source = ?request.source, "task started");
                match run_task(&pipeline, &ctx, &progress, &request).await {
                    Ok(cutout) => emit(UnitMessage::Complete(cutout)),
                    Err(e) if e.kind == ErrorKind::UnitFault => return Err(e),
                    Err(e) => emit(UnitMessage::Error(e)),
                }
            }
        }
    }

    Ok(())
}

/// Builds the pipeline at most once. The flag is true only for the call that
/// actually constructed it; failures are not cached.
async fn ensure_pipeline(
    cell: &OnceCell<Arc<Pipeline>>,
    ctx: &UnitContext,
    progress: &ProgressReporter,
) -> Result<(Arc<Pipeline>, bool)> {
    let mut built = false;
    let flag = &mut built;
    let pipeline = cell
        .get_or_try_init(|| async move {
            *flag = true;
            Pipeline::load(ctx.loader.as_ref(), ctx.processor_config.as_deref(), progress)
                .await
                .map(Arc::new)
        })
        .await?;
    Ok((pipeline.clone(), built))
}

async fn run_task(
    cell: &OnceCell<Arc<Pipeline>>,
    ctx: &UnitContext,
    progress: &ProgressReporter,
    request: &ImageRequest,
) -> Result<Cutout> {
    progress.report(ProgressEvent::new(ProgressStatus::Processing).with_message("Preparing"));
    let (pipeline, _) = ensure_pipeline(cell, ctx, progress).await?;

    let bytes = request.source.load(&ctx.client, progress).await?;
    progress.report(ProgressEvent::new(ProgressStatus::Decoding).with_file(request.source.label()));

    let options = request.options;
    let job = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| PoolError::new("image_decode_failed").push_std(e))?;
        pipeline.run(&image, &options)
    })
    .await;

    match job {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            Err(PoolError::with_kind(ErrorKind::UnitFault, "inference_panicked").push_std(e))
        }
        Err(e) => Err(e.into()),
    }
}
