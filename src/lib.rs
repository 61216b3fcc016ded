//! Background removal on a pool of execution units.
//!
//! A [`Pool`] owns a fixed set of units, each lazily building one inference
//! [`Pipeline`] from an injected [`PipelineLoader`]. Submitted images are
//! dispatched strictly in submission order to whichever unit is free. Units
//! that crash are replaced after a delay; the task they held is rejected.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn run(loader: Arc<dyn rembg_pool::PipelineLoader>) -> rembg_pool::Result<()> {
//! let remover = rembg_pool::Remover::from_env(loader)?;
//! let cutout = remover.process_image("https://example.com/cat.jpg".parse::<rembg_pool::ImageRequest>()?).await?;
//! std::fs::write("cat.png", cutout.encode_png()?)?;
//! remover.terminate().await;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod client;
pub mod config;
pub mod error;
pub mod rembg;
pub mod workers;

pub use client::Remover;
pub use config::PoolConfig;
pub use error::{ErrorKind, PoolError, Result};
pub use rembg::{
    Cutout, ImageSource, MattingModel, Pipeline, PipelineLoader, ProgressEvent, ProgressStatus,
    RemovalOptions,
};
pub use workers::{ImageRequest, Pool, PoolStats, TaskHandle, TaskId, UnitId};
