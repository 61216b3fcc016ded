pub mod cutout;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod source;

pub use cutout::Cutout;
pub use pipeline::{MattingModel, Pipeline, PipelineLoader};
pub use processor::{ImageProcessor, Mask, ModelInput, ProcessorConfig, RemovalOptions, Size};
pub use progress::{ProgressEvent, ProgressReceiver, ProgressReporter, ProgressSender, ProgressStatus};
pub use source::ImageSource;
