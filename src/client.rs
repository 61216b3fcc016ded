use futures_util::{StreamExt, stream::FuturesOrdered};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::rembg::{Cutout, PipelineLoader, ProgressEvent, ProgressSender};
use crate::workers::{ImageRequest, Pool, PoolStats, TaskHandle};

/// Submission API over a [`Pool`]. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Remover {
    pool: Pool,
}

impl Remover {
    pub fn new(config: PoolConfig, loader: Arc<dyn PipelineLoader>) -> Result<Self> {
        Ok(Self::from_pool(Pool::new(config, loader)?))
    }

    pub fn from_env(loader: Arc<dyn PipelineLoader>) -> Result<Self> {
        Self::new(PoolConfig::from_env()?, loader)
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Remove the background of one image.
    pub async fn process_image(&self, request: impl Into<ImageRequest>) -> Result<Cutout> {
        self.pool.submit(request).await
    }

    /// Same as [`Remover::process_image`], forwarding the task's progress.
    pub async fn process_image_with_progress(
        &self,
        request: impl Into<ImageRequest>,
        on_progress: impl FnMut(ProgressEvent),
    ) -> Result<Cutout> {
        self.pool.submit(request).wait_with_progress(on_progress).await
    }

    pub fn submit(&self, request: impl Into<ImageRequest>) -> TaskHandle {
        self.pool.submit(request)
    }

    /// Process many images with at most `concurrency` of them in flight.
    /// One failure does not affect the others; results keep input order.
    pub async fn process_batch<I>(&self, requests: I, concurrency: usize) -> Vec<Result<Cutout>>
    where
        I: IntoIterator,
        I::Item: Into<ImageRequest>,
    {
        let sem = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut ordered = FuturesOrdered::new();

        for request in requests {
            let request = request.into();
            let sem = sem.clone();
            let pool = self.pool.clone();
            ordered.push_back(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| PoolError::new("batch_semaphore_closed").push_std(e))?;
                pool.submit(request).await
            });
        }

        let mut out = Vec::with_capacity(ordered.len());
        while let Some(item) = ordered.next().await {
            out.push(item);
        }
        debug!(
            total = out.len(),
            failed = out.iter().filter(|r| r.is_err()).count(),
            "batch finished"
        );
        out
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn initialize(&self, progress: Option<ProgressSender>) {
        self.pool.initialize(progress);
    }

    pub async fn terminate(&self) {
        self.pool.terminate().await;
    }
}
