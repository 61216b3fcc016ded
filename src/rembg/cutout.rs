use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use std::fmt;
use std::io::Cursor;

use crate::error::{PoolError, Result};

/// Result of one background removal: RGBA8 pixels whose alpha channel is the
/// predicted foreground mask.
#[derive(Clone, PartialEq, Eq)]
pub struct Cutout {
    pub width: u32,
    pub height: u32,
    pub image_data: Vec<u8>,
}

impl fmt::Debug for Cutout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cutout")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("image_data", &format_args!("{} bytes", self.image_data.len()))
            .finish()
    }
}

impl From<RgbaImage> for Cutout {
    fn from(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            image_data: image.into_raw(),
        }
    }
}

impl Cutout {
    pub fn to_image(&self) -> Result<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.image_data.clone()).ok_or_else(|| {
            PoolError::new("cutout_size_mismatch").push_str(format!(
                "{}x{} needs {} bytes, have {}",
                self.width,
                self.height,
                self.width as usize * self.height as usize * 4,
                self.image_data.len()
            ))
        })
    }

    /// Alpha channel as a grayscale mask.
    pub fn mask(&self) -> Result<GrayImage> {
        let alpha: Vec<u8> = self.image_data.chunks_exact(4).map(|px| px[3]).collect();
        GrayImage::from_raw(self.width, self.height, alpha)
            .ok_or_else(|| PoolError::new("cutout_size_mismatch"))
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(self.to_image()?)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| PoolError::new("png_encode_failed").push_std(e))?;
        Ok(buf)
    }

    pub fn encode_mask_png(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(self.mask()?)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| PoolError::new("mask_encode_failed").push_std(e))?;
        Ok(buf)
    }
}
