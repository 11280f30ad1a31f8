//! Multi-frame grayscale study viewer: decode, window, rasterize, resolve
//! frame sources, and drive view transforms and cine playback.

pub mod app;
pub mod config;
pub mod dicom;
pub mod error;
pub mod frames;
pub mod launch;
pub mod loader;
pub mod playback;
pub mod raster;
pub mod render;
pub mod service;
pub mod source;
pub mod viewer;
pub mod window;
