#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use rembg_pool::rembg::{ImageProcessor, Mask, ModelInput, ProcessorConfig, ProgressReporter};
use rembg_pool::{
    ImageRequest, ImageSource, MattingModel, PipelineLoader, PoolConfig, PoolError, PoolStats,
    ProgressEvent, Remover, Result,
};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(10);

/// Blocks inference per tag until the test lets it through.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    released: HashSet<u32>,
    open: bool,
}

impl Gate {
    pub fn release(&self, tag: u32) {
        self.state.lock().unwrap().released.insert(tag);
        self.changed.notify_all();
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    fn wait(&self, tag: u32) {
        let mut state = self.state.lock().unwrap();
        while !state.open && !state.released.contains(&tag) {
            state = self.changed.wait(state).unwrap();
        }
    }
}

/// Tags each image by its width: an image built with [`image`] for tag `n`
/// is `n` pixels wide, and the processor never resizes.
pub struct GatedModel {
    gate: Arc<Gate>,
    started: mpsc::UnboundedSender<u32>,
    panic_on: HashSet<u32>,
}

impl MattingModel for GatedModel {
    fn predict(&self, input: &ModelInput) -> Result<Mask> {
        let tag = input.width;
        let _ = self.started.send(tag);
        if self.panic_on.contains(&tag) {
            panic!("model crashed on image {}", tag);
        }
        self.gate.wait(tag);
        Ok(Mask {
            width: input.width,
            height: input.height,
            data: vec![1.0; (input.width * input.height) as usize],
        })
    }
}

pub struct FakeLoader {
    model: Arc<GatedModel>,
    pub model_loads: AtomicUsize,
    pub fail_model: AtomicBool,
    pub fail_processor: AtomicBool,
}

#[async_trait]
impl PipelineLoader for FakeLoader {
    async fn load_model(&self, progress: &ProgressReporter) -> Result<Arc<dyn MattingModel>> {
        self.model_loads.fetch_add(1, Ordering::SeqCst);
        progress.report(ProgressEvent::download("model.onnx", 512, Some(1024)));
        progress.report(ProgressEvent::download("model.onnx", 1024, Some(1024)));
        if self.fail_model.load(Ordering::SeqCst) {
            return Err(PoolError::new("weights_missing"));
        }
        Ok(self.model.clone())
    }

    async fn load_processor(
        &self,
        _config: Option<&Path>,
        _progress: &ProgressReporter,
    ) -> Result<ImageProcessor> {
        if self.fail_processor.load(Ordering::SeqCst) {
            return Err(PoolError::new("config_unreadable"));
        }
        ImageProcessor::new(ProcessorConfig {
            do_resize: false,
            ..Default::default()
        })
    }
}

pub struct Fixture {
    pub remover: Remover,
    pub gate: Arc<Gate>,
    pub loader: Arc<FakeLoader>,
    started: mpsc::UnboundedReceiver<u32>,
    violations: Arc<Mutex<Vec<PoolStats>>>,
}

impl Fixture {
    pub fn new(units: usize) -> Self {
        Self::build(units, HashSet::new())
    }

    pub fn panicking_on(units: usize, tags: &[u32]) -> Self {
        Self::build(units, tags.iter().copied().collect())
    }

    fn build(units: usize, panic_on: HashSet<u32>) -> Self {
        let gate = Arc::new(Gate::default());
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let loader = Arc::new(FakeLoader {
            model: Arc::new(GatedModel {
                gate: gate.clone(),
                started: started_tx,
                panic_on,
            }),
            model_loads: AtomicUsize::new(0),
            fail_model: AtomicBool::new(false),
            fail_processor: AtomicBool::new(false),
        });

        let config = PoolConfig::default()
            .with_max_workers(units)
            .with_parallelism(units)
            .with_restart_delay(Duration::from_millis(50));
        let remover = Remover::new(config, loader.clone()).unwrap();

        let violations = Arc::new(Mutex::new(Vec::new()));
        let mut stats = remover.pool().watch_stats();
        let seen = violations.clone();
        tokio::spawn(async move {
            while stats.changed().await.is_ok() {
                let s = *stats.borrow_and_update();
                let consistent = s.ready_workers + s.active_tasks <= s.total_workers
                    && (s.queued_tasks == 0 || s.ready_workers == 0);
                if !consistent {
                    seen.lock().unwrap().push(s);
                }
            }
        });

        Self {
            remover,
            gate,
            loader,
            started: started_rx,
            violations,
        }
    }

    /// Next image to reach the model, in the order units picked them up.
    pub async fn next_started(&mut self) -> u32 {
        tokio::time::timeout(WAIT, self.started.recv())
            .await
            .expect("no task reached the model")
            .expect("model dropped")
    }

    pub async fn wait_stats(&self, what: &str, pred: impl Fn(&PoolStats) -> bool) -> PoolStats {
        let mut rx = self.remover.pool().watch_stats();
        let found = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}: {:?}", what, self.remover.stats()))
            .map(|s| *s);
        found.expect("pool stopped publishing stats")
    }

    pub async fn ready(&self, units: usize) {
        self.wait_stats("all units ready", |s| {
            !s.is_initializing && s.ready_workers == units && s.total_workers == units
        })
        .await;
    }

    pub fn assert_consistent(&self) {
        let violations = self.violations.lock().unwrap();
        assert!(violations.is_empty(), "inconsistent stats published: {:?}", *violations);
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        // Blocked inference would otherwise hold the runtime open.
        self.gate.open();
    }
}

/// `tag` pixels wide, one pixel high, PNG encoded.
pub fn png(tag: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(tag, 1, Rgb([200, 100, 50]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn image(tag: u32) -> ImageRequest {
    ImageSource::from(png(tag)).into()
}
