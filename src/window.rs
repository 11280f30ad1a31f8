use egui::Vec2;

use crate::frames::{Frame, MultiFrameBuffer};

pub const DEFAULT_SAMPLE_CAP: usize = 10_000;
pub const MIN_WINDOW_WIDTH: f32 = 1.0;

/// Intensity range mapped to the visible 0..=255 band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayWindow {
    width: f32,
    center: f32,
}

impl DisplayWindow {
    pub fn new(width: f32, center: f32) -> Self {
        let width = if width.is_finite() {
            width.max(MIN_WINDOW_WIDTH)
        } else {
            MIN_WINDOW_WIDTH
        };
        Self { width, center }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn center(&self) -> f32 {
        self.center
    }

    pub fn low(&self) -> f32 {
        self.center - self.width / 2.0
    }

    pub fn high(&self) -> f32 {
        self.center + self.width / 2.0
    }

    fn from_range(min: f32, max: f32) -> Self {
        let mut width = max - min;
        if !(width > 0.0) {
            width = MIN_WINDOW_WIDTH;
        }
        Self::new(width, min + width / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowMode {
    #[default]
    PerFrame,
    PerSeries,
}

pub fn estimate_window(frame: &Frame) -> DisplayWindow {
    estimate_window_with_cap(frame, DEFAULT_SAMPLE_CAP)
}

pub fn estimate_window_with_cap(frame: &Frame, cap: usize) -> DisplayWindow {
    let stride = sample_stride(frame.len(), cap);
    let sampled = (0..frame.len())
        .step_by(stride)
        .map(|i| frame.value_at(i));
    window_over(sampled)
}

/// Same estimate over a strided sample spanning every frame of the buffer.
pub fn estimate_series_window(buffer: &MultiFrameBuffer, cap: usize) -> DisplayWindow {
    let rescale = buffer.rescale();
    let samples = buffer.samples();
    let stride = sample_stride(samples.len(), cap);
    window_over(
        samples
            .iter()
            .step_by(stride)
            .map(|&stored| rescale.apply(stored)),
    )
}

fn sample_stride(len: usize, cap: usize) -> usize {
    let cap = cap.max(1);
    len.div_ceil(cap).max(1)
}

fn window_over(values: impl Iterator<Item = f32>) -> DisplayWindow {
    let (min, max) = values
        .filter(|value| value.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), value| {
            (min.min(value), max.max(value))
        });
    if min > max {
        return DisplayWindow::new(MIN_WINDOW_WIDTH, 0.0);
    }
    DisplayWindow::from_range(min, max)
}

/// Picks the window for a frame: operator override, then the window declared by
/// the source file, then the auto estimate.
pub fn select_window(
    override_window: Option<DisplayWindow>,
    declared: Option<DisplayWindow>,
    auto: impl FnOnce() -> DisplayWindow,
) -> DisplayWindow {
    override_window.or(declared).unwrap_or_else(auto)
}

/// Applies a window/level drag: horizontal motion widens, upward motion raises
/// the center. Returns `None` when nothing changed.
pub fn adjust_by_drag(window: DisplayWindow, drag: Vec2, value_span: f32) -> Option<DisplayWindow> {
    if drag == Vec2::ZERO {
        return None;
    }

    let sensitivity = (value_span.abs() / 512.0).clamp(0.25, 256.0);
    let center = window.center() - drag.y * sensitivity;
    let width = (window.width() + drag.x * sensitivity).max(MIN_WINDOW_WIDTH);
    let adjusted = DisplayWindow::new(width, center);

    let changed = (adjusted.center() - window.center()).abs() > f32::EPSILON
        || (adjusted.width() - window.width()).abs() > f32::EPSILON;
    changed.then_some(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{decode_frame, Rescale};

    #[test]
    fn window_covers_observed_range() {
        let frame = Frame::new(0, 3, 1, vec![-1000, 0, 3000]);
        let window = estimate_window(&frame);
        assert_eq!(window.width(), 4000.0);
        assert_eq!(window.center(), 1000.0);
        assert_eq!(window.low(), -1000.0);
        assert_eq!(window.high(), 3000.0);
    }

    #[test]
    fn uniform_frame_gets_minimum_width() {
        let frame = Frame::new(0, 2, 2, vec![42; 4]);
        let window = estimate_window(&frame);
        assert_eq!(window.width(), MIN_WINDOW_WIDTH);
        assert_eq!(window.center(), 42.5);
    }

    #[test]
    fn estimate_is_deterministic() {
        let samples = (0..300 * 300).map(|i| (i * 7919 % 65_521) as i32).collect();
        let frame = Frame::new(0, 300, 300, samples);
        let first = estimate_window(&frame);
        for _ in 0..5 {
            assert_eq!(estimate_window(&frame), first);
        }
    }

    #[test]
    fn sampling_cap_bounds_stride() {
        assert_eq!(sample_stride(90_000, 10_000), 9);
        assert_eq!(sample_stride(100, 10_000), 1);
        assert_eq!(sample_stride(10_001, 10_000), 2);
        assert_eq!(sample_stride(5, 0), 5);
    }

    #[test]
    fn estimate_uses_rescaled_values() {
        let frame = Frame::new(0, 2, 1, vec![0, 2000]).with_rescale(Rescale::new(1.0, -1024.0));
        let window = estimate_window(&frame);
        assert_eq!(window.low(), -1024.0);
        assert_eq!(window.high(), 976.0);
    }

    #[test]
    fn series_window_spans_all_frames() {
        let buffer = MultiFrameBuffer::from_samples(2, 1, 16, false, vec![10, 20, 500, 900]);
        let frame_window = estimate_window(&decode_frame(&buffer, 0).expect("frame 0"));
        let series_window = estimate_series_window(&buffer, DEFAULT_SAMPLE_CAP);
        assert_eq!(frame_window.high(), 20.0);
        assert_eq!(series_window.low(), 10.0);
        assert_eq!(series_window.high(), 900.0);
    }

    #[test]
    fn window_width_is_never_below_minimum() {
        assert_eq!(DisplayWindow::new(0.0, 5.0).width(), MIN_WINDOW_WIDTH);
        assert_eq!(DisplayWindow::new(-20.0, 5.0).width(), MIN_WINDOW_WIDTH);
        assert_eq!(DisplayWindow::new(f32::NAN, 5.0).width(), MIN_WINDOW_WIDTH);
    }

    #[test]
    fn override_beats_declared_beats_auto() {
        let auto = || DisplayWindow::new(10.0, 5.0);
        let declared = Some(DisplayWindow::new(400.0, 40.0));
        let operator = Some(DisplayWindow::new(1500.0, -600.0));
        assert_eq!(select_window(operator, declared, auto), operator.unwrap());
        assert_eq!(select_window(None, declared, auto), declared.unwrap());
        assert_eq!(select_window(None, None, auto), auto());
    }

    #[test]
    fn drag_adjusts_width_and_center() {
        let window = DisplayWindow::new(400.0, 40.0);
        let adjusted =
            adjust_by_drag(window, Vec2::new(10.0, -4.0), 4096.0).expect("drag should change");
        assert_eq!(adjusted.width(), 480.0);
        assert_eq!(adjusted.center(), 72.0);
        assert!(adjust_by_drag(window, Vec2::ZERO, 4096.0).is_none());

        let narrowed =
            adjust_by_drag(window, Vec2::new(-10_000.0, 0.0), 4096.0).expect("width shrinks");
        assert_eq!(narrowed.width(), MIN_WINDOW_WIDTH);
    }
}
