use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::debug;
use thiserror::Error;

use crate::dicom::{load_multiframe, DicomSeries};
use crate::frames::decode_frame;
use crate::raster::{encode_png, rasterize_with, RasterOptions};
use crate::window::{
    estimate_series_window, estimate_window_with_cap, select_window, DisplayWindow, WindowMode,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub path: PathBuf,
    pub frame_index: usize,
    pub window: Option<DisplayWindow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameResponse {
    pub png: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub frame_count_total: usize,
    pub window: DisplayWindow,
    pub pixel_spacing: Option<(f32, f32)>,
    pub recommended_fps: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameServiceError {
    #[error("{0} not found")]
    NotFound(PathBuf),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

type SeriesLoader = dyn Fn(&Path) -> Result<DicomSeries> + Send + Sync;
type SeriesCache = Arc<Mutex<HashMap<PathBuf, Arc<DicomSeries>>>>;

/// Rasterizes frames of raw multi-frame files on demand.
pub struct FrameService {
    loader: Box<SeriesLoader>,
    cache: SeriesCache,
    window_mode: WindowMode,
    sample_cap: usize,
}

impl FrameService {
    pub fn new(window_mode: WindowMode, sample_cap: usize) -> Self {
        Self::with_loader(window_mode, sample_cap, load_multiframe)
    }

    pub fn with_loader<F>(window_mode: WindowMode, sample_cap: usize, loader: F) -> Self
    where
        F: Fn(&Path) -> Result<DicomSeries> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            cache: Arc::new(Mutex::new(HashMap::new())),
            window_mode,
            sample_cap,
        }
    }

    pub fn serve(&self, request: &FrameRequest) -> Result<FrameResponse, FrameServiceError> {
        let series = self.series(&request.path)?;
        let frame_count_total = series
            .buffer
            .frame_count()
            .map_err(|err| FrameServiceError::DecodeFailed(err.to_string()))?;
        let frame = decode_frame(&series.buffer, request.frame_index)
            .map_err(|err| FrameServiceError::DecodeFailed(err.to_string()))?;

        let window = select_window(request.window, series.declared_window, || {
            match self.window_mode {
                WindowMode::PerFrame => estimate_window_with_cap(&frame, self.sample_cap),
                WindowMode::PerSeries => estimate_series_window(&series.buffer, self.sample_cap),
            }
        });
        let raster = rasterize_with(
            &frame,
            window,
            RasterOptions {
                invert: series.invert,
            },
        );
        let png = encode_png(&raster)
            .map_err(|err| FrameServiceError::DecodeFailed(format!("{err:#}")))?;

        Ok(FrameResponse {
            png,
            width: raster.width,
            height: raster.height,
            frame_count_total,
            window,
            pixel_spacing: series.pixel_spacing,
            recommended_fps: series.recommended_cine_fps,
        })
    }

    fn series(&self, path: &Path) -> Result<Arc<DicomSeries>, FrameServiceError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(series) = cache.get(path) {
                return Ok(Arc::clone(series));
            }
        }

        if !path.exists() {
            return Err(FrameServiceError::NotFound(path.to_path_buf()));
        }
        let series = Arc::new(
            (self.loader)(path).map_err(|err| FrameServiceError::DecodeFailed(format!("{err:#}")))?,
        );
        let buffer = &series.buffer;
        let rescale = buffer.rescale();
        debug!(
            "Cached {}x{} {}-bit {} series for {}{}",
            buffer.width,
            buffer.height,
            buffer.bits_allocated,
            if buffer.signed { "signed" } else { "unsigned" },
            path.display(),
            if rescale.is_identity() {
                String::new()
            } else {
                format!(" (rescale {} x + {})", rescale.slope, rescale.intercept)
            }
        );
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), Arc::clone(&series));
        }
        Ok(series)
    }
}
