use egui::{pos2, vec2, Pos2, Vec2};

use crate::error::ViewerError;
use crate::raster::RasterImage;

pub const MIN_ZOOM: f32 = 0.1;
pub const MAX_ZOOM: f32 = 10.0;
pub const ZOOM_STEP: f32 = 1.2;
pub const DEFAULT_CINE_FPS: f32 = 24.0;

/// Per-viewer visual and navigation state.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    zoom: f32,
    rotation_degrees: i32,
    pub pan: Vec2,
    pub current_frame: usize,
    pub frame_count: usize,
    pub is_playing: bool,
    pub frames_per_second: f32,
    /// (row spacing, column spacing) in millimetres.
    pub pixel_spacing: Option<(f32, f32)>,
}

impl Default for RenderState {
    fn default() -> Self {
        Self::new(DEFAULT_CINE_FPS)
    }
}

impl RenderState {
    pub fn new(frames_per_second: f32) -> Self {
        Self {
            zoom: 1.0,
            rotation_degrees: 0,
            pan: Vec2::ZERO,
            current_frame: 0,
            frame_count: 0,
            is_playing: false,
            frames_per_second,
            pixel_spacing: None,
        }
    }

    /// Back to defaults for a new study. The playback rate survives.
    pub fn reset(&mut self) {
        *self = Self::new(self.frames_per_second);
    }

    /// Resets only the view transform.
    pub fn reset_view(&mut self) {
        self.zoom = 1.0;
        self.rotation_degrees = 0;
        self.pan = Vec2::ZERO;
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn set_zoom(&mut self, zoom: f32) {
        self.zoom = if zoom.is_finite() {
            zoom.clamp(MIN_ZOOM, MAX_ZOOM)
        } else {
            1.0
        };
    }

    pub fn apply_wheel_zoom(&mut self, notches: f32) {
        self.set_zoom(self.zoom * ZOOM_STEP.powf(notches));
    }

    pub fn rotation_degrees(&self) -> i32 {
        self.rotation_degrees
    }

    pub fn rotate_by(&mut self, delta_degrees: i32) {
        self.rotation_degrees = (self.rotation_degrees + delta_degrees).rem_euclid(360);
    }

    /// Pre-rotation draw size of an image, corrected for anisotropic pixels.
    pub fn draw_size(&self, image_size: Vec2) -> Vec2 {
        match self.pixel_spacing {
            Some((row, column)) if row > 0.0 && column > 0.0 => {
                vec2(image_size.x, image_size.y * (row / column))
            }
            _ => image_size,
        }
    }
}

fn sin_cos_degrees(degrees: i32) -> (f32, f32) {
    match degrees.rem_euclid(360) {
        0 => (0.0, 1.0),
        90 => (1.0, 0.0),
        180 => (0.0, -1.0),
        270 => (-1.0, 0.0),
        other => (other as f32).to_radians().sin_cos(),
    }
}

pub fn rotated_bounding_box(size: Vec2, degrees: i32) -> Vec2 {
    let (sin, cos) = sin_cos_degrees(degrees);
    vec2(
        (size.x * cos).abs() + (size.y * sin).abs(),
        (size.x * sin).abs() + (size.y * cos).abs(),
    )
}

/// Maps image pixels onto a surface: translate to centre plus pan, rotate,
/// then scale, with the image centred on the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawPlan {
    pub center: Pos2,
    pub image_size: Vec2,
    /// Surface units per image pixel along each image axis.
    pub pixel_scale: Vec2,
    /// Extent of the rotated image on the surface.
    pub bounding_box: Vec2,
    sin: f32,
    cos: f32,
}

impl DrawPlan {
    pub fn compute(surface_size: Vec2, image_size: Vec2, state: &RenderState) -> Option<Self> {
        if image_size.x <= 0.0 || image_size.y <= 0.0 {
            return None;
        }
        if surface_size.x <= 0.0 || surface_size.y <= 0.0 {
            return None;
        }

        let draw_size = state.draw_size(image_size);
        let unit_box = rotated_bounding_box(draw_size, state.rotation_degrees());
        let fit = (surface_size.x / unit_box.x).min(surface_size.y / unit_box.y);
        let scale = fit * state.zoom();
        let (sin, cos) = sin_cos_degrees(state.rotation_degrees());

        Some(Self {
            center: pos2(surface_size.x / 2.0, surface_size.y / 2.0) + state.pan,
            image_size,
            pixel_scale: draw_size / image_size * scale,
            bounding_box: unit_box * scale,
            sin,
            cos,
        })
    }

    fn rotate(&self, v: Vec2) -> Vec2 {
        vec2(v.x * self.cos - v.y * self.sin, v.x * self.sin + v.y * self.cos)
    }

    fn unrotate(&self, v: Vec2) -> Vec2 {
        vec2(v.x * self.cos + v.y * self.sin, -v.x * self.sin + v.y * self.cos)
    }

    /// `point` in image pixel coordinates, origin at the top-left corner.
    pub fn image_to_surface(&self, point: Vec2) -> Pos2 {
        self.center + self.rotate((point - self.image_size / 2.0) * self.pixel_scale)
    }

    pub fn surface_to_image(&self, point: Pos2) -> Vec2 {
        self.unrotate(point - self.center) / self.pixel_scale + self.image_size / 2.0
    }

    /// Top-left, top-right, bottom-right, bottom-left of the image on the surface.
    pub fn corners(&self) -> [Pos2; 4] {
        let Vec2 { x: w, y: h } = self.image_size;
        [
            self.image_to_surface(vec2(0.0, 0.0)),
            self.image_to_surface(vec2(w, 0.0)),
            self.image_to_surface(vec2(w, h)),
            self.image_to_surface(vec2(0.0, h)),
        ]
    }
}

pub trait RenderSurface {
    fn size(&self) -> Vec2;
    fn clear(&mut self);
    fn draw_image(&mut self, image: &RasterImage, plan: &DrawPlan);
}

pub fn draw<S: RenderSurface + ?Sized>(
    surface: &mut S,
    image: &RasterImage,
    state: &RenderState,
) -> Option<DrawPlan> {
    surface.clear();
    let image_size = vec2(image.width as f32, image.height as f32);
    let plan = DrawPlan::compute(surface.size(), image_size, state)?;
    surface.draw_image(image, &plan);
    Some(plan)
}

/// Offscreen 8-bit grayscale surface.
#[derive(Debug, Clone)]
pub struct PixelSurface {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
    tainted: bool,
}

impl PixelSurface {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
            tainted: false,
        }
    }

    pub fn dimensions(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn read_pixels(&self) -> Result<&[u8], ViewerError> {
        if self.tainted {
            return Err(ViewerError::ExportRestricted(
                "the displayed frame was served from an origin that does not allow pixel export"
                    .to_string(),
            ));
        }
        Ok(&self.pixels)
    }
}

impl RenderSurface for PixelSurface {
    fn size(&self) -> Vec2 {
        vec2(self.width as f32, self.height as f32)
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
    }

    fn draw_image(&mut self, image: &RasterImage, plan: &DrawPlan) {
        if !image.export_allowed {
            self.tainted = true;
        }

        for y in 0..self.height {
            for x in 0..self.width {
                let source = plan.surface_to_image(pos2(x as f32 + 0.5, y as f32 + 0.5));
                if source.x < 0.0 || source.y < 0.0 {
                    continue;
                }
                let (ix, iy) = (source.x.floor() as usize, source.y.floor() as usize);
                if ix < image.width && iy < image.height {
                    self.pixels[y * self.width + x] = image.pixel(ix, iy);
                }
            }
        }
    }
}

/// Drag-to-pan with move events coalesced into one pending offset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PanGesture {
    drag_start: Option<Vec2>,
    pending: Option<Vec2>,
}

impl PanGesture {
    pub fn pointer_down(&mut self, pos: Pos2, current_pan: Vec2) {
        self.drag_start = Some(pos.to_vec2() - current_pan);
    }

    pub fn pointer_move(&mut self, pos: Pos2) {
        if let Some(start) = self.drag_start {
            self.pending = Some(pos.to_vec2() - start);
        }
    }

    pub fn pointer_up(&mut self) {
        self.drag_start = None;
    }

    pub fn is_dragging(&self) -> bool {
        self.drag_start.is_some()
    }

    /// The latest pan offset since the previous refresh, if any.
    pub fn take_pending(&mut self) -> Option<Vec2> {
        self.pending.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WheelAction {
    Zoom(f32),
    StepFrames(i32),
}

impl WheelAction {
    /// Positive notches scroll away from the user: zoom in, or step back a frame.
    pub fn from_wheel(notches: f32, modifier: bool) -> Option<Self> {
        if !notches.is_finite() || notches == 0.0 {
            return None;
        }
        if modifier {
            let steps = notches.round() as i32;
            return (steps != 0).then_some(WheelAction::StepFrames(-steps));
        }
        Some(WheelAction::Zoom(notches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Vec2, b: Vec2) {
        assert!((a - b).length() < 1e-3, "{a:?} != {b:?}");
    }

    #[test]
    fn four_quarter_turns_restore_rotation_and_box() {
        let mut state = RenderState::default();
        state.rotate_by(30);
        let size = vec2(512.0, 256.0);
        let original = rotated_bounding_box(size, state.rotation_degrees());
        for _ in 0..4 {
            state.rotate_by(90);
        }
        assert_eq!(state.rotation_degrees(), 30);
        assert_close(rotated_bounding_box(size, state.rotation_degrees()), original);
    }

    #[test]
    fn rotation_is_normalized() {
        let mut state = RenderState::default();
        state.rotate_by(-90);
        assert_eq!(state.rotation_degrees(), 270);
        state.rotate_by(810);
        assert_eq!(state.rotation_degrees(), 0);
    }

    #[test]
    fn bounding_box_swaps_for_quarter_turns() {
        let size = vec2(400.0, 100.0);
        assert_eq!(rotated_bounding_box(size, 90), vec2(100.0, 400.0));
        assert_eq!(rotated_bounding_box(size, 270), vec2(100.0, 400.0));
        assert_eq!(rotated_bounding_box(size, 180), size);
        let diagonal = rotated_bounding_box(vec2(100.0, 100.0), 45);
        assert_close(diagonal, vec2(141.421, 141.421));
    }

    #[test]
    fn zoom_stays_clamped() {
        let mut state = RenderState::default();
        for _ in 0..100 {
            state.apply_wheel_zoom(1.0);
        }
        assert_eq!(state.zoom(), MAX_ZOOM);
        for _ in 0..200 {
            state.apply_wheel_zoom(-1.0);
        }
        assert_eq!(state.zoom(), MIN_ZOOM);
        state.set_zoom(f32::NAN);
        assert_eq!(state.zoom(), 1.0);
    }

    #[test]
    fn wheel_zoom_is_multiplicative() {
        let mut state = RenderState::default();
        state.apply_wheel_zoom(2.0);
        assert!((state.zoom() - 1.44).abs() < 1e-5);
    }

    #[test]
    fn reset_keeps_playback_rate() {
        let mut state = RenderState::new(12.0);
        state.set_zoom(3.0);
        state.rotate_by(90);
        state.pan = vec2(5.0, 5.0);
        state.current_frame = 7;
        state.is_playing = true;
        state.reset();
        assert_eq!(state, RenderState::new(12.0));
    }

    #[test]
    fn quarter_turn_fits_without_clipping() {
        let mut state = RenderState::default();
        state.rotate_by(90);
        let surface = vec2(200.0, 100.0);
        let plan = DrawPlan::compute(surface, vec2(100.0, 50.0), &state).expect("plan");
        assert_close(plan.bounding_box, vec2(50.0, 100.0));
        for corner in plan.corners() {
            assert!(corner.x >= -1e-3 && corner.x <= surface.x + 1e-3);
            assert!(corner.y >= -1e-3 && corner.y <= surface.y + 1e-3);
        }
    }

    #[test]
    fn surface_mapping_inverts_image_mapping() {
        let mut state = RenderState::default();
        state.rotate_by(37);
        state.set_zoom(1.7);
        state.pan = vec2(12.0, -8.0);
        let plan = DrawPlan::compute(vec2(640.0, 480.0), vec2(300.0, 200.0), &state).expect("plan");
        let point = vec2(21.5, 180.25);
        assert_close(plan.surface_to_image(plan.image_to_surface(point)), point);
    }

    #[test]
    fn pixel_spacing_stretches_draw_height() {
        let mut state = RenderState::default();
        state.pixel_spacing = Some((2.0, 1.0));
        let plan = DrawPlan::compute(vec2(100.0, 100.0), vec2(100.0, 25.0), &state).expect("plan");
        assert_close(plan.bounding_box, vec2(100.0, 50.0));
    }

    #[test]
    fn empty_image_has_no_plan() {
        let state = RenderState::default();
        assert!(DrawPlan::compute(vec2(10.0, 10.0), vec2(0.0, 4.0), &state).is_none());
    }

    #[test]
    fn pixel_surface_draws_rotated_image() {
        let image = RasterImage::new(0, 2, 1, vec![10, 200]);
        let mut surface = PixelSurface::new(2, 1);
        let mut state = RenderState::default();
        draw(&mut surface, &image, &state).expect("drawn");
        assert_eq!(surface.read_pixels().expect("readable"), &[10, 200]);

        state.rotate_by(180);
        draw(&mut surface, &image, &state).expect("drawn");
        assert_eq!(surface.read_pixels().expect("readable"), &[200, 10]);
    }

    #[test]
    fn restricted_raster_taints_readback_only() {
        let image = RasterImage::new(0, 1, 1, vec![77]).with_export_allowed(false);
        let mut surface = PixelSurface::new(1, 1);
        assert!(draw(&mut surface, &image, &RenderState::default()).is_some());
        assert!(surface.is_tainted());
        assert!(matches!(
            surface.read_pixels(),
            Err(ViewerError::ExportRestricted(_))
        ));
    }

    #[test]
    fn pan_moves_coalesce_into_latest_offset() {
        let mut gesture = PanGesture::default();
        gesture.pointer_down(pos2(100.0, 100.0), vec2(10.0, 0.0));
        gesture.pointer_move(pos2(105.0, 100.0));
        gesture.pointer_move(pos2(120.0, 90.0));
        assert_eq!(gesture.take_pending(), Some(vec2(30.0, -10.0)));
        assert_eq!(gesture.take_pending(), None);

        gesture.pointer_up();
        gesture.pointer_move(pos2(0.0, 0.0));
        assert_eq!(gesture.take_pending(), None);
        assert!(!gesture.is_dragging());
    }

    #[test]
    fn wheel_modifier_selects_frame_step() {
        assert_eq!(WheelAction::from_wheel(1.0, false), Some(WheelAction::Zoom(1.0)));
        assert_eq!(WheelAction::from_wheel(1.0, true), Some(WheelAction::StepFrames(-1)));
        assert_eq!(WheelAction::from_wheel(-2.0, true), Some(WheelAction::StepFrames(2)));
        assert_eq!(WheelAction::from_wheel(0.2, true), None);
        assert_eq!(WheelAction::from_wheel(0.0, false), None);
    }
}
