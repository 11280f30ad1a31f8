use std::sync::OnceLock;
use std::time::Duration;

use log::warn;

use crate::playback::{clamp_fps, MAX_CINE_FPS, MIN_CINE_FPS};
use crate::render::DEFAULT_CINE_FPS;
use crate::window::{WindowMode, DEFAULT_SAMPLE_CAP};

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone, PartialEq)]
pub struct ViewerConfig {
    /// Budget for each candidate attempt.
    pub load_timeout: Duration,
    pub default_fps: f32,
    pub window_sample_cap: usize,
    pub window_mode: WindowMode,
    /// Directory root or `http(s)://` base URL for study frames.
    pub source: Option<String>,
    /// Origin whose rasters may be read back for export.
    pub export_origin: Option<String>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            default_fps: DEFAULT_CINE_FPS,
            window_sample_cap: DEFAULT_SAMPLE_CAP,
            window_mode: WindowMode::PerFrame,
            source: None,
            export_origin: None,
        }
    }
}

impl ViewerConfig {
    /// Process-wide configuration read once from the environment.
    pub fn from_env() -> &'static ViewerConfig {
        static CONFIG: OnceLock<ViewerConfig> = OnceLock::new();
        CONFIG.get_or_init(|| Self::from_lookup(|key| std::env::var(key).ok()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("STACKVIEW_LOAD_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.load_timeout = Duration::from_millis(ms),
                _ => warn!("Ignoring STACKVIEW_LOAD_TIMEOUT_MS={raw:?}: expected milliseconds > 0"),
            }
        }

        if let Some(raw) = lookup("STACKVIEW_CINE_FPS") {
            match raw.trim().parse::<f32>() {
                Ok(fps) if fps.is_finite() && fps > 0.0 => {
                    if !(MIN_CINE_FPS..=MAX_CINE_FPS).contains(&fps) {
                        warn!("STACKVIEW_CINE_FPS={fps} clamped to [{MIN_CINE_FPS}, {MAX_CINE_FPS}]");
                    }
                    config.default_fps = clamp_fps(fps);
                }
                _ => warn!("Ignoring STACKVIEW_CINE_FPS={raw:?}: expected frames per second"),
            }
        }

        if let Some(raw) = lookup("STACKVIEW_WINDOW_SAMPLES") {
            match raw.trim().parse::<usize>() {
                Ok(cap) if cap > 0 => config.window_sample_cap = cap,
                _ => warn!("Ignoring STACKVIEW_WINDOW_SAMPLES={raw:?}: expected a positive count"),
            }
        }

        if let Some(raw) = lookup("STACKVIEW_WINDOW_MODE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "frame" | "per-frame" => config.window_mode = WindowMode::PerFrame,
                "series" | "per-series" => config.window_mode = WindowMode::PerSeries,
                _ => warn!("Ignoring STACKVIEW_WINDOW_MODE={raw:?}: expected frame or series"),
            }
        }

        config.source = lookup("STACKVIEW_SOURCE")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        config.export_origin = lookup("STACKVIEW_EXPORT_ORIGIN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        config
    }
}

pub fn is_http_source(source: &str) -> bool {
    let lower = source.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
