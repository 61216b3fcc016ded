use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ErrorKind, PoolError, Result};
use crate::rembg::cutout::Cutout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Preprocessor settings, in the layout of a `preprocessor_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub do_resize: bool,
    pub size: Size,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: Size {
                width: 1024,
                height: 1024,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [1.0, 1.0, 1.0],
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.do_resize && (self.size.width == 0 || self.size.height == 0) {
            return Err(PoolError::with_kind(ErrorKind::Initialization, "invalid_processor_config")
                .push_str("size must be non-zero"));
        }
        if self.do_normalize && self.image_std.iter().any(|s| *s == 0.0) {
            return Err(PoolError::with_kind(ErrorKind::Initialization, "invalid_processor_config")
                .push_str("image_std must be non-zero"));
        }
        Ok(())
    }
}

/// Post-processing applied to the predicted mask before it becomes alpha.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalOptions {
    /// Mask values below this become fully transparent. 0 keeps soft alpha.
    pub threshold: u8,
    /// Hard edges: alpha is either 0 or 255.
    pub binary: bool,
}

impl RemovalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_binary_mode(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn alpha(&self, mask: u8) -> u8 {
        if self.binary {
            let cut = if self.threshold == 0 { 128 } else { self.threshold };
            if mask >= cut { 255 } else { 0 }
        } else if mask < self.threshold {
            0
        } else {
            mask
        }
    }
}

/// Planar CHW float tensor fed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// Model output: one foreground probability per pixel, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Mask {
    fn to_gray(&self) -> Result<GrayImage> {
        let expected = self.width as usize * self.height as usize;
        if expected == 0 || self.data.len() != expected {
            return Err(PoolError::new("mask_shape_mismatch").push_str(format!(
                "{}x{} mask with {} values",
                self.width,
                self.height,
                self.data.len()
            )));
        }

        let stride = self.width as usize;
        Ok(GrayImage::from_fn(self.width, self.height, |x, y| {
            let v = self.data[y as usize * stride + x as usize];
            Luma([(v.clamp(0.0, 1.0) * 255.0).round() as u8])
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageProcessor {
    config: ProcessorConfig,
}

impl ImageProcessor {
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let config: ProcessorConfig = serde_json::from_slice(&raw)?;
        Self::new(config)
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn preprocess(&self, image: &DynamicImage) -> ModelInput {
        let cfg = &self.config;
        let mut rgb = image.to_rgb8();
        if cfg.do_resize && rgb.dimensions() != (cfg.size.width, cfg.size.height) {
            rgb = imageops::resize(&rgb, cfg.size.width, cfg.size.height, FilterType::Triangle);
        }

        let (width, height) = rgb.dimensions();
        let plane = width as usize * height as usize;
        let mut data = vec![0.0f32; plane * 3];

        for (i, px) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let mut v = px[c] as f32;
                if cfg.do_rescale {
                    v *= cfg.rescale_factor;
                }
                if cfg.do_normalize {
                    v = (v - cfg.image_mean[c]) / cfg.image_std[c];
                }
                data[c * plane + i] = v;
            }
        }

        ModelInput { width, height, data }
    }

    /// Scale the mask back to the source size and apply it as alpha.
    pub fn postprocess(
        &self,
        image: &DynamicImage,
        mask: &Mask,
        options: &RemovalOptions,
    ) -> Result<Cutout> {
        let (width, height) = image.dimensions();
        let mut gray = mask.to_gray()?;
        if gray.dimensions() != (width, height) {
            gray = imageops::resize(&gray, width, height, FilterType::Triangle);
        }

        let mut rgba = image.to_rgba8();
        for (px, m) in rgba.pixels_mut().zip(gray.pixels()) {
            px[3] = options.alpha(m[0]);
        }

        Ok(Cutout::from(rgba))
    }
}
