use async_trait::async_trait;
use image::DynamicImage;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ErrorKind, PoolError, Result};
use crate::rembg::cutout::Cutout;
use crate::rembg::processor::{ImageProcessor, Mask, ModelInput, RemovalOptions};
use crate::rembg::progress::{ProgressEvent, ProgressReporter, ProgressStatus};

/// Segmentation model predicting a foreground mask. Called from the blocking
/// pool, one image at a time per execution unit.
pub trait MattingModel: Send + Sync + 'static {
    fn predict(&self, input: &ModelInput) -> Result<Mask>;
}

/// Builds the two halves of a pipeline. Implementations may download weights
/// and should report progress while doing so.
#[async_trait]
pub trait PipelineLoader: Send + Sync + 'static {
    async fn load_model(&self, progress: &ProgressReporter) -> Result<Arc<dyn MattingModel>>;

    async fn load_processor(
        &self,
        config: Option<&Path>,
        _progress: &ProgressReporter,
    ) -> Result<ImageProcessor> {
        match config {
            Some(path) => ImageProcessor::from_file(path).await,
            None => Ok(ImageProcessor::default()),
        }
    }
}

pub struct Pipeline {
    model: Arc<dyn MattingModel>,
    processor: ImageProcessor,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(model: Arc<dyn MattingModel>, processor: ImageProcessor) -> Self {
        Self { model, processor }
    }

    /// Load model then processor. The error key names the phase that failed.
    pub async fn load(
        loader: &dyn PipelineLoader,
        processor_config: Option<&Path>,
        progress: &ProgressReporter,
    ) -> Result<Self> {
        progress.report(ProgressEvent::new(ProgressStatus::Loading).with_message("Loading model"));
        let model = loader.load_model(progress).await.map_err(|e| {
            PoolError::with_kind(ErrorKind::Initialization, "model_load_failed").push_any(e)
        })?;

        progress.report(
            ProgressEvent::new(ProgressStatus::Loading).with_message("Loading processor"),
        );
        let processor = loader
            .load_processor(processor_config, progress)
            .await
            .map_err(|e| {
                PoolError::with_kind(ErrorKind::Initialization, "processor_load_failed").push_any(e)
            })?;

        Ok(Self::new(model, processor))
    }

    pub fn processor(&self) -> &ImageProcessor {
        &self.processor
    }

    /// CPU-bound; run on the blocking pool.
    pub fn run(&self, image: &DynamicImage, options: &RemovalOptions) -> Result<Cutout> {
        let input = self.processor.preprocess(image);
        let mask = self
            .model
            .predict(&input)
            .map_err(|e| PoolError::new("inference_failed").push_any(e))?;
        self.processor.postprocess(image, &mask, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;

    struct Constant(f32);

    impl MattingModel for Constant {
        fn predict(&self, input: &ModelInput) -> Result<Mask> {
            Ok(Mask {
                width: input.width,
                height: input.height,
                data: vec![self.0; (input.width * input.height) as usize],
            })
        }
    }

    struct Loader {
        fail_model: bool,
    }

    #[async_trait]
    impl PipelineLoader for Loader {
        async fn load_model(&self, _: &ProgressReporter) -> Result<Arc<dyn MattingModel>> {
            if self.fail_model {
                return Err(PoolError::new("weights_missing"));
            }
            Ok(Arc::new(Constant(0.5)))
        }
    }

    #[tokio::test]
    async fn model_failure_is_named() {
        let err = Pipeline::load(&Loader { fail_model: true }, None, &ProgressReporter::noop())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Initialization);
        assert_eq!(err.key, "model_load_failed");
        assert!(err.message().contains("weights_missing"));
    }

    #[tokio::test]
    async fn processor_failure_is_named() {
        let missing = PathBuf::from("/no/such/preprocessor_config.json");
        let err = Pipeline::load(
            &Loader { fail_model: false },
            Some(&missing),
            &ProgressReporter::noop(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.key, "processor_load_failed");
    }

    #[tokio::test]
    async fn runs_end_to_end() {
        let pipeline = Pipeline::load(&Loader { fail_model: false }, None, &ProgressReporter::noop())
            .await
            .unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 3, Rgb([9, 9, 9])));

        let cutout = pipeline.run(&img, &RemovalOptions::default()).unwrap();
        assert_eq!((cutout.width, cutout.height), (6, 3));
        assert!(cutout.image_data.chunks_exact(4).all(|px| px[3] == 128));
    }
}
