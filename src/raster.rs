use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use image::{GrayImage, ImageFormat};

use crate::frames::Frame;
use crate::window::DisplayWindow;

static NEXT_RASTER_ID: AtomicU64 = AtomicU64::new(1);

fn next_raster_id() -> u64 {
    NEXT_RASTER_ID.fetch_add(1, Ordering::Relaxed)
}

/// 8-bit grayscale rendering of one frame under one window.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pub id: u64,
    pub frame_index: usize,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
    pub window: Option<DisplayWindow>,
    /// Cleared when the raster came from an origin the viewer may not read back.
    pub export_allowed: bool,
    pub frame_count_total: Option<usize>,
    /// (row, column) spacing of the source pixels, when known.
    pub pixel_spacing: Option<(f32, f32)>,
    /// Cine rate declared by the source.
    pub recommended_fps: Option<f32>,
}

impl RasterImage {
    pub fn new(frame_index: usize, width: usize, height: usize, pixels: Vec<u8>) -> Self {
        Self {
            id: next_raster_id(),
            frame_index,
            width,
            height,
            pixels,
            window: None,
            export_allowed: true,
            frame_count_total: None,
            pixel_spacing: None,
            recommended_fps: None,
        }
    }

    pub fn size(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    pub fn with_frame_count_total(mut self, frame_count_total: Option<usize>) -> Self {
        self.frame_count_total = frame_count_total;
        self
    }

    pub fn with_export_allowed(mut self, export_allowed: bool) -> Self {
        self.export_allowed = export_allowed;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RasterOptions {
    /// MONOCHROME1: low intensities render bright.
    pub invert: bool,
}

pub fn rasterize(frame: &Frame, window: DisplayWindow) -> RasterImage {
    rasterize_with(frame, window, RasterOptions::default())
}

pub fn rasterize_with(frame: &Frame, window: DisplayWindow, options: RasterOptions) -> RasterImage {
    let low = window.low();
    let width = window.width();

    let mut pixels = Vec::with_capacity(frame.len());
    for value in frame.values() {
        let normalized = ((value - low) / width).clamp(0.0, 1.0);
        let mut gray = (normalized * 255.0).round() as u8;
        if options.invert {
            gray = 255 - gray;
        }
        pixels.push(gray);
    }

    let mut raster = RasterImage::new(frame.index, frame.width, frame.height, pixels);
    raster.window = Some(window);
    raster
}

pub fn encode_png(raster: &RasterImage) -> Result<Vec<u8>> {
    let gray = GrayImage::from_raw(
        u32::try_from(raster.width).context("Raster width does not fit in u32")?,
        u32::try_from(raster.height).context("Raster height does not fit in u32")?,
        raster.pixels.clone(),
    )
    .context("Raster pixel count does not match its dimensions")?;

    let mut out = Cursor::new(Vec::new());
    gray.write_to(&mut out, ImageFormat::Png)
        .context("Could not encode raster as PNG")?;
    Ok(out.into_inner())
}

/// Decodes any supported raster encoding into grayscale.
pub fn decode_png(bytes: &[u8], frame_index: usize) -> Result<RasterImage> {
    let decoded = image::load_from_memory(bytes).context("Could not decode raster bytes")?;
    let gray = decoded.to_luma8();
    let (width, height) = gray.dimensions();
    Ok(RasterImage::new(
        frame_index,
        width as usize,
        height as usize,
        gray.into_raw(),
    ))
}
