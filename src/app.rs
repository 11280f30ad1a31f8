use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use eframe::egui::{
    self, epaint::Vertex, Color32, ColorImage, Mesh, Pos2, Sense, Shape, TextureHandle,
    TextureOptions, Vec2,
};
use log::{error, info};

use crate::config::{is_http_source, ViewerConfig};
use crate::launch::{LaunchOptions, LaunchRequest};
use crate::loader::ThreadedLoader;
use crate::playback::{PlaybackPhase, SystemClock, ViewerKey, MAX_CINE_FPS, MIN_CINE_FPS};
use crate::raster::RasterImage;
use crate::render::{DrawPlan, RenderSurface, ZOOM_STEP};
use crate::service::FrameService;
use crate::source::{FrameFetcher, HttpFetcher, ImageSourceResolver, LocalFetcher, StudyRef};
use crate::viewer::{Viewer, ViewerEvent, ViewerStatus};
use crate::window::adjust_by_drag;

const APP_TITLE: &str = "StackView";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const WHEEL_PIXELS_PER_NOTCH: f32 = 50.0;

/// Render surface backed by an egui texture and a textured quad.
pub struct EguiSurface {
    ctx: egui::Context,
    size: Vec2,
    texture: Option<(u64, TextureHandle)>,
    mesh: Option<Mesh>,
}

impl EguiSurface {
    pub fn new(ctx: egui::Context) -> Self {
        Self {
            ctx,
            size: Vec2::ZERO,
            texture: None,
            mesh: None,
        }
    }

    /// Returns true when the size changed.
    pub fn resize(&mut self, size: Vec2) -> bool {
        if (size - self.size).length() < 0.5 {
            return false;
        }
        self.size = size;
        true
    }

    pub fn paint(&self, painter: &egui::Painter, origin: Pos2) {
        if let Some(mesh) = self.mesh.as_ref() {
            let mut mesh = mesh.clone();
            mesh.translate(origin.to_vec2());
            painter.add(Shape::mesh(mesh));
        }
    }

    fn texture_for(&mut self, image: &RasterImage) -> egui::TextureId {
        if let Some((id, texture)) = self.texture.as_ref() {
            if *id == image.id {
                return texture.id();
            }
        }

        let color_image = ColorImage::from_gray(image.size(), &image.pixels);
        match self.texture.as_mut() {
            Some((id, texture)) => {
                texture.set(color_image, TextureOptions::LINEAR);
                *id = image.id;
                texture.id()
            }
            None => {
                let texture =
                    self.ctx
                        .load_texture("stackview-frame", color_image, TextureOptions::LINEAR);
                let texture_id = texture.id();
                self.texture = Some((image.id, texture));
                texture_id
            }
        }
    }
}

impl RenderSurface for EguiSurface {
    fn size(&self) -> Vec2 {
        self.size
    }

    fn clear(&mut self) {
        self.mesh = None;
    }

    fn draw_image(&mut self, image: &RasterImage, plan: &DrawPlan) {
        let mut mesh = Mesh::with_texture(self.texture_for(image));
        let uvs = [
            egui::pos2(0.0, 0.0),
            egui::pos2(1.0, 0.0),
            egui::pos2(1.0, 1.0),
            egui::pos2(0.0, 1.0),
        ];
        for (pos, uv) in plan.corners().into_iter().zip(uvs) {
            mesh.vertices.push(Vertex {
                pos,
                uv,
                color: Color32::WHITE,
            });
        }
        mesh.add_triangle(0, 1, 2);
        mesh.add_triangle(0, 2, 3);
        self.mesh = Some(mesh);
    }
}

type AppViewer = Viewer<EguiSurface, ThreadedLoader, SystemClock>;

pub struct StackViewApp {
    config: ViewerConfig,
    viewer: Option<AppViewer>,
    pending_launch_request: Option<LaunchRequest>,
    pending_seek: Option<usize>,
    status_line: String,
    frame_scroll_accum: f32,
}

impl StackViewApp {
    pub fn new(
        config: ViewerConfig,
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
    ) -> Self {
        Self {
            config,
            viewer: None,
            pending_launch_request: initial_request,
            pending_seek: None,
            status_line: initial_status.unwrap_or_default(),
            frame_scroll_accum: 0.0,
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line_base = egui::Color32::from_gray(28);
        visuals.panel_fill = egui::Color32::BLACK;
        visuals.window_fill = egui::Color32::BLACK;
        visuals.extreme_bg_color = egui::Color32::BLACK;
        visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, line_base);
        ctx.set_visuals(visuals);
    }

    fn handle_launch_request(&mut self, request: LaunchRequest, ctx: &egui::Context) {
        let options = request.options().clone();
        let opened = match request {
            LaunchRequest::LocalFile { path, .. } => local_study(&path)
                .and_then(|(root, study)| self.open_study(&root.to_string_lossy(), study, &options, ctx)),
            LaunchRequest::Study { source, study, .. } => source
                .or_else(|| self.config.source.clone())
                .context("No frame source: pass --source or set STACKVIEW_SOURCE")
                .and_then(|source| self.open_study(&source, study, &options, ctx)),
        };

        if let Err(err) = opened {
            error!("Could not open study: {err:#}");
            self.status_line = format!("Could not open study: {err:#}");
        }
    }

    fn build_resolver(&self, source: &str) -> anyhow::Result<ImageSourceResolver> {
        let fetcher: Box<dyn FrameFetcher> = if is_http_source(source) {
            Box::new(HttpFetcher::new(source, self.config.export_origin.clone())?)
        } else {
            let root = PathBuf::from(source);
            if !root.is_dir() {
                bail!("Frame source {} is not a directory", root.display());
            }
            Box::new(LocalFetcher::new(
                root,
                FrameService::new(self.config.window_mode, self.config.window_sample_cap),
            ))
        };
        Ok(ImageSourceResolver::new(fetcher, self.config.load_timeout))
    }

    fn open_study(
        &mut self,
        source: &str,
        study: StudyRef,
        options: &LaunchOptions,
        ctx: &egui::Context,
    ) -> anyhow::Result<()> {
        let resolver = self.build_resolver(source)?;
        let loader = ThreadedLoader::spawn(Arc::new(resolver))?;

        if let Some(mut previous) = self.viewer.take() {
            previous.dispose();
        }

        let fps = options.fps.unwrap_or(self.config.default_fps);
        let mut viewer = Viewer::new(loader, SystemClock, fps);
        viewer.follow_source_fps(options.fps.is_none());
        let repaint_ctx = ctx.clone();
        viewer.subscribe(move |event| {
            if let ViewerEvent::Phase(PlaybackPhase::Playing) = event {
                info!("Cine playback started");
            }
            repaint_ctx.request_repaint();
        });
        viewer.mount(EguiSurface::new(ctx.clone()));
        viewer.set_study(study.clone());
        if options.window.is_some() {
            viewer.set_window(options.window);
        }

        self.viewer = Some(viewer);
        self.pending_seek = options.frame;
        self.frame_scroll_accum = 0.0;
        self.status_line = format!("Opened {} from {source}", study.study_id);
        Ok(())
    }

    fn open_dicom(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("DICOM", &["dcm"])
            .pick_file()
        {
            self.pending_launch_request = Some(LaunchRequest::LocalFile {
                path,
                options: LaunchOptions::default(),
            });
        }
    }

    fn export_png(&mut self) {
        let Some(viewer) = self.viewer.as_ref() else {
            return;
        };
        let png = match viewer.export_png() {
            Ok(png) => png,
            Err(err) => {
                self.status_line = err.to_string();
                return;
            }
        };

        let study_id = viewer
            .study()
            .map(|study| study.study_id.clone())
            .unwrap_or_else(|| "frame".to_string());
        let file_name = format!(
            "{}_frame_{:04}.png",
            study_id,
            viewer.render_state().current_frame
        );
        let Some(path) = rfd::FileDialog::new()
            .add_filter("PNG", &["png"])
            .set_file_name(file_name)
            .save_file()
        else {
            return;
        };

        self.status_line = match fs::write(&path, png) {
            Ok(()) => format!("Exported {}", path.display()),
            Err(err) => format!("Could not write {}: {err}", path.display()),
        };
    }

    fn handle_keys(&mut self, ctx: &egui::Context) {
        if ctx.wants_keyboard_input() {
            return;
        }
        let Some(viewer) = self.viewer.as_mut() else {
            return;
        };

        let (keys, rotate) = ctx.input(|input| {
            let mut keys = Vec::new();
            if input.key_pressed(egui::Key::ArrowLeft) {
                keys.push(ViewerKey::Left);
            }
            if input.key_pressed(egui::Key::ArrowRight) {
                keys.push(ViewerKey::Right);
            }
            if input.key_pressed(egui::Key::Home) {
                keys.push(ViewerKey::Home);
            }
            if input.key_pressed(egui::Key::End) {
                keys.push(ViewerKey::End);
            }
            if input.key_pressed(egui::Key::Space) || input.key_pressed(egui::Key::C) {
                keys.push(ViewerKey::Space);
            }
            (keys, input.key_pressed(egui::Key::R))
        });

        for key in keys {
            viewer.key(key);
        }
        if rotate {
            viewer.rotate(90);
        }
    }

    fn frame_step_from_scroll(scroll_accum: &mut f32, scroll: f32) -> i32 {
        const DEAD_ZONE: f32 = 0.5;
        const PIXELS_PER_FRAME_STEP: f32 = 30.0;

        if scroll.abs() <= DEAD_ZONE {
            return 0;
        }
        // Drop the residual when the scroll direction reverses.
        if *scroll_accum != 0.0 && scroll.signum() != scroll_accum.signum() {
            *scroll_accum = 0.0;
        }
        *scroll_accum += scroll;

        let steps = (*scroll_accum / PIXELS_PER_FRAME_STEP).trunc() as i32;
        *scroll_accum -= steps as f32 * PIXELS_PER_FRAME_STEP;
        -steps
    }

    fn dominant_scroll_axis(raw_scroll: Vec2, smooth_scroll: Vec2) -> f32 {
        let delta = if smooth_scroll != Vec2::ZERO {
            smooth_scroll
        } else {
            raw_scroll
        };
        if delta.y.abs() >= delta.x.abs() {
            delta.y
        } else {
            delta.x
        }
    }

    fn show_canvas(&mut self, ui: &mut egui::Ui) {
        let Some(viewer) = self.viewer.as_mut() else {
            ui.centered_and_justified(|ui| {
                ui.label("Open a DICOM file, or launch with --source and --study.");
            });
            return;
        };

        let available = ui.available_size();
        let (canvas_rect, response) = ui.allocate_exact_size(available, Sense::click_and_drag());
        if let Some(surface) = viewer.surface_mut() {
            if surface.resize(canvas_rect.size()) {
                viewer.request_redraw();
            }
        }

        if response.double_clicked() {
            viewer.reset_view();
        }

        let (modifiers, pointer_delta, zoom_delta, raw_scroll, smooth_scroll) = ui.input(|input| {
            (
                input.modifiers,
                input.pointer.delta(),
                input.zoom_delta(),
                input.raw_scroll_delta,
                input.smooth_scroll_delta,
            )
        });

        if modifiers.shift && response.dragged() {
            let base = viewer
                .window_override()
                .or_else(|| viewer.current_image().and_then(|image| image.window));
            if let Some(base) = base {
                if let Some(window) = adjust_by_drag(base, pointer_delta, base.width()) {
                    viewer.set_window(Some(window));
                }
            }
        } else {
            let to_local = |pos: Pos2| pos - canvas_rect.min.to_vec2();
            if response.drag_started() {
                if let Some(pos) = response.interact_pointer_pos() {
                    viewer.pointer_down(to_local(pos));
                }
            }
            if response.dragged() {
                if let Some(pos) = response.interact_pointer_pos() {
                    viewer.pointer_move(to_local(pos));
                }
            }
        }
        if response.drag_stopped() {
            viewer.pointer_up();
        }

        if response.hovered() {
            let scroll = Self::dominant_scroll_axis(raw_scroll, smooth_scroll);
            if modifiers.shift {
                let step = Self::frame_step_from_scroll(&mut self.frame_scroll_accum, scroll);
                if step != 0 {
                    viewer.wheel(-(step as f32), true);
                }
            } else if (zoom_delta - 1.0).abs() > f32::EPSILON {
                viewer.wheel(zoom_delta.ln() / ZOOM_STEP.ln(), false);
            } else if scroll.abs() > 0.5 {
                viewer.wheel(scroll / WHEEL_PIXELS_PER_NOTCH, false);
            }
        }

        viewer.on_refresh();

        let painter = ui.painter_at(canvas_rect);
        match viewer.status() {
            ViewerStatus::Failed(err) => {
                painter.text(
                    canvas_rect.center(),
                    egui::Align2::CENTER_CENTER,
                    err.to_string(),
                    egui::FontId::proportional(16.0),
                    Color32::LIGHT_RED,
                );
            }
            ViewerStatus::Loading if viewer.current_image().is_none() => {
                painter.text(
                    canvas_rect.center(),
                    egui::Align2::CENTER_CENTER,
                    "Loading frame...",
                    egui::FontId::proportional(16.0),
                    ui.visuals().text_color(),
                );
            }
            _ => {
                if let Some(surface) = viewer.surface() {
                    surface.paint(&painter, canvas_rect.min);
                }
            }
        }
    }

    fn apply_pending_seek(&mut self) {
        let Some(viewer) = self.viewer.as_mut() else {
            return;
        };
        let Some(frame) = self.pending_seek else {
            return;
        };
        match viewer.status() {
            ViewerStatus::Failed(_) => self.pending_seek = None,
            _ if matches!(
                viewer.playback_phase(),
                PlaybackPhase::Paused | PlaybackPhase::Playing
            ) =>
            {
                viewer.seek(frame);
                self.pending_seek = None;
            }
            _ => {}
        }
    }

    fn viewer_status_text(viewer: &AppViewer) -> String {
        let state = viewer.render_state();
        let study = viewer
            .study()
            .map(|study| study.study_id.as_str())
            .unwrap_or_default();
        match viewer.status() {
            ViewerStatus::Empty => String::new(),
            ViewerStatus::Loading => format!("{study}: loading frame {}", state.current_frame + 1),
            ViewerStatus::Showing => {
                let source = viewer
                    .current_candidate()
                    .map(|candidate| candidate.to_string())
                    .unwrap_or_default();
                format!(
                    "{study}: frame {}/{}  zoom {:.2}  rotation {}°  {source}",
                    state.current_frame + 1,
                    state.frame_count.max(1),
                    state.zoom(),
                    state.rotation_degrees()
                )
            }
            ViewerStatus::Failed(err) => err.to_string(),
        }
    }
}

impl Drop for StackViewApp {
    fn drop(&mut self) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.dispose();
        }
    }
}

impl eframe::App for StackViewApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_black_background(ctx);

        if let Some(request) = self.pending_launch_request.take() {
            self.handle_launch_request(request, ctx);
        }
        self.handle_keys(ctx);

        let mut open_clicked = false;
        let mut export_clicked = false;
        let mut rotate_by = 0;
        let mut reset_view = false;
        let mut reset_window = false;
        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(format!("{APP_TITLE} v{APP_VERSION}"));
                ui.separator();
                open_clicked = ui.button("Open DICOM").clicked();
                let has_viewer = self.viewer.is_some();
                ui.add_enabled_ui(has_viewer, |ui| {
                    export_clicked = ui.button("Export PNG").clicked();
                    if ui.button("⟲").on_hover_text("Rotate left").clicked() {
                        rotate_by = -90;
                    }
                    if ui.button("⟳").on_hover_text("Rotate right (R)").clicked() {
                        rotate_by = 90;
                    }
                    reset_view = ui
                        .button("Reset View")
                        .on_hover_text("Double-click the image")
                        .clicked();
                    reset_window = ui
                        .button("Reset Window")
                        .on_hover_text("Shift+drag adjusts window/level")
                        .clicked();
                });
            });
        });

        let mut toggle_clicked = false;
        let mut seek_to = None;
        let mut new_fps = None;
        let mut retry_clicked = false;
        egui::TopBottomPanel::bottom("playback").show(ctx, |ui| {
            if let Some(viewer) = self.viewer.as_ref() {
                let state = viewer.render_state();
                ui.add_enabled_ui(viewer.navigation_enabled(), |ui| {
                    ui.horizontal(|ui| {
                        let label = if state.is_playing {
                            "Pause (Space)"
                        } else {
                            "Play (Space)"
                        };
                        toggle_clicked = ui.button(label).clicked();

                        let mut frame = state.current_frame as u32;
                        let max_frame = state.frame_count.saturating_sub(1) as u32;
                        if ui
                            .add(egui::Slider::new(&mut frame, 0..=max_frame).text("Frame"))
                            .changed()
                        {
                            seek_to = Some(frame as usize);
                        }

                        let mut fps = state.frames_per_second;
                        if ui
                            .add(
                                egui::Slider::new(&mut fps, MIN_CINE_FPS..=MAX_CINE_FPS)
                                    .text("Cine FPS"),
                            )
                            .changed()
                        {
                            new_fps = Some(fps);
                        }
                    });
                });

                ui.label(Self::viewer_status_text(viewer));
                if let ViewerStatus::Failed(err) = viewer.status() {
                    if err.is_retryable() {
                        retry_clicked = ui.button("Retry").clicked();
                    }
                    let attempts = viewer.attempted_candidates();
                    egui::CollapsingHeader::new(format!("Attempted sources ({})", attempts.len()))
                        .show(ui, |ui| {
                            for attempt in attempts {
                                ui.monospace(attempt.to_string());
                            }
                        });
                }
            }
            if !self.status_line.is_empty() {
                ui.label(&self.status_line);
            }
        });

        if open_clicked {
            self.open_dicom();
        }
        if export_clicked {
            self.export_png();
        }
        if let Some(viewer) = self.viewer.as_mut() {
            if rotate_by != 0 {
                viewer.rotate(rotate_by);
            }
            if reset_view {
                viewer.reset_view();
            }
            if reset_window {
                viewer.set_window(None);
            }
            if toggle_clicked {
                viewer.toggle_playback();
            }
            if let Some(frame) = seek_to {
                viewer.seek(frame);
            }
            if let Some(fps) = new_fps {
                viewer.set_fps(fps);
            }
            if retry_clicked {
                viewer.retry();
            }
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(Color32::BLACK))
            .show(ctx, |ui| self.show_canvas(ui));

        self.apply_pending_seek();

        if let Some(viewer) = self.viewer.as_ref() {
            if let Some(wait) = viewer.next_tick_in() {
                ctx.request_repaint_after(wait.max(Duration::from_millis(1)));
            } else if viewer.is_loading() {
                ctx.request_repaint_after(Duration::from_millis(16));
            }
        }
    }
}

/// Source root and study reference for a single DICOM file on disk.
fn local_study(path: &Path) -> anyhow::Result<(PathBuf, StudyRef)> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} does not name a file", path.display()))?;
    let stem = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name);
    let root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((root, StudyRef::new(stem).with_canonical_name(name)))
}
