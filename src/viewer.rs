use egui::Pos2;
use log::{info, warn};

use crate::error::{FailedAttempt, ViewerError};
use crate::loader::{LoadDispatcher, LoadResponse, LoadTracker};
use crate::playback::{clamp_fps, Clock, PlaybackController, PlaybackPhase, ViewerKey};
use crate::raster::{encode_png, RasterImage};
use crate::render::{self, PanGesture, PixelSurface, RenderState, RenderSurface, WheelAction};
use crate::source::{ImageSourceCandidate, ResolvedFrame, StudyRef};
use crate::window::DisplayWindow;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerStatus {
    Empty,
    Loading,
    Showing,
    Failed(ViewerError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    State(RenderState),
    Phase(PlaybackPhase),
    Status(ViewerStatus),
}

type Subscriber = Box<dyn FnMut(&ViewerEvent)>;

/// One viewer instance: owns its render state, playback and in-flight load.
pub struct Viewer<S: RenderSurface, D: LoadDispatcher, C: Clock> {
    surface: Option<S>,
    dispatcher: D,
    playback: PlaybackController<C>,
    state: RenderState,
    tracker: LoadTracker,
    pan: PanGesture,
    study: Option<StudyRef>,
    window_override: Option<DisplayWindow>,
    current: Option<RasterImage>,
    current_candidate: Option<ImageSourceCandidate>,
    attempted: Vec<FailedAttempt>,
    status: ViewerStatus,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: SubscriptionId,
    needs_redraw: bool,
    follow_source_fps: bool,
    disposed: bool,
}

impl<S: RenderSurface, D: LoadDispatcher, C: Clock> Viewer<S, D, C> {
    pub fn new(dispatcher: D, clock: C, frames_per_second: f32) -> Self {
        Self {
            surface: None,
            dispatcher,
            playback: PlaybackController::new(clock),
            state: RenderState::new(clamp_fps(frames_per_second)),
            tracker: LoadTracker::new(),
            pan: PanGesture::default(),
            study: None,
            window_override: None,
            current: None,
            current_candidate: None,
            attempted: Vec::new(),
            status: ViewerStatus::Empty,
            subscribers: Vec::new(),
            next_subscription: 1,
            needs_redraw: false,
            follow_source_fps: false,
            disposed: false,
        }
    }

    pub fn mount(&mut self, surface: S) {
        if self.disposed {
            return;
        }
        self.surface = Some(surface);
        self.needs_redraw = true;
        self.redraw();
    }

    pub fn surface(&self) -> Option<&S> {
        self.surface.as_ref()
    }

    pub fn surface_mut(&mut self) -> Option<&mut S> {
        self.surface.as_mut()
    }

    pub fn render_state(&self) -> &RenderState {
        &self.state
    }

    pub fn status(&self) -> &ViewerStatus {
        &self.status
    }

    pub fn playback_phase(&self) -> PlaybackPhase {
        self.playback.phase()
    }

    pub fn navigation_enabled(&self) -> bool {
        self.playback.navigation_enabled(&self.state)
    }

    pub fn study(&self) -> Option<&StudyRef> {
        self.study.as_ref()
    }

    pub fn current_image(&self) -> Option<&RasterImage> {
        self.current.as_ref()
    }

    pub fn current_candidate(&self) -> Option<&ImageSourceCandidate> {
        self.current_candidate.as_ref()
    }

    /// Failed attempts from the most recent resolution.
    pub fn attempted_candidates(&self) -> &[FailedAttempt] {
        &self.attempted
    }

    pub fn window_override(&self) -> Option<DisplayWindow> {
        self.window_override
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&ViewerEvent) + 'static) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        if !self.disposed {
            self.subscribers.push((id, Box::new(callback)));
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(subscription, _)| *subscription != id);
        self.subscribers.len() != before
    }

    pub fn set_study(&mut self, study: StudyRef) {
        if self.disposed || self.study.as_ref() == Some(&study) {
            return;
        }
        info!("Opening study {}", study.study_id);
        self.observe(|viewer| {
            viewer.playback.reset(&mut viewer.state);
            viewer.state.reset();
            viewer.state.frame_count = study.frame_count.unwrap_or(0);
            viewer.pan = PanGesture::default();
            viewer.window_override = None;
            viewer.current = None;
            viewer.current_candidate = None;
            viewer.attempted.clear();
            viewer.study = Some(study);
            viewer.status = ViewerStatus::Loading;
            viewer.needs_redraw = true;
            viewer.request_frame(0);
            viewer.redraw();
        });
    }

    /// When enabled, a cine rate declared by the first frame's source replaces
    /// the configured rate for that study.
    pub fn follow_source_fps(&mut self, enabled: bool) {
        self.follow_source_fps = enabled;
    }

    /// Marks the surface dirty, e.g. after it was resized.
    pub fn request_redraw(&mut self) {
        self.needs_redraw = true;
    }

    pub fn key(&mut self, key: ViewerKey) {
        self.observe(|viewer| {
            if let Some(index) = viewer.playback.handle_key(&mut viewer.state, key) {
                viewer.request_frame(index);
            }
        });
    }

    pub fn seek(&mut self, index: usize) {
        self.observe(|viewer| {
            if let Some(index) = viewer.playback.seek(&mut viewer.state, index) {
                viewer.request_frame(index);
            }
        });
    }

    pub fn toggle_playback(&mut self) {
        self.key(ViewerKey::Space);
    }

    pub fn set_fps(&mut self, fps: f32) {
        self.observe(|viewer| viewer.playback.set_fps(&mut viewer.state, fps));
    }

    pub fn wheel(&mut self, notches: f32, modifier: bool) {
        self.observe(|viewer| match WheelAction::from_wheel(notches, modifier) {
            Some(WheelAction::Zoom(notches)) => {
                viewer.state.apply_wheel_zoom(notches);
                viewer.needs_redraw = true;
            }
            Some(WheelAction::StepFrames(delta)) => {
                if let Some(index) = viewer.playback.step(&mut viewer.state, delta as isize) {
                    viewer.request_frame(index);
                }
            }
            None => {}
        });
    }

    pub fn pointer_down(&mut self, pos: Pos2) {
        if !self.disposed {
            self.pan.pointer_down(pos, self.state.pan);
        }
    }

    pub fn pointer_move(&mut self, pos: Pos2) {
        if !self.disposed {
            self.pan.pointer_move(pos);
        }
    }

    pub fn pointer_up(&mut self) {
        self.pan.pointer_up();
    }

    pub fn rotate(&mut self, delta_degrees: i32) {
        self.observe(|viewer| {
            viewer.state.rotate_by(delta_degrees);
            viewer.needs_redraw = true;
        });
    }

    pub fn reset_view(&mut self) {
        self.observe(|viewer| {
            viewer.state.reset_view();
            viewer.needs_redraw = true;
        });
    }

    /// Operator window override. Reloads the current frame.
    pub fn set_window(&mut self, window: Option<DisplayWindow>) {
        if self.disposed || self.window_override == window {
            return;
        }
        self.window_override = window;
        if self.study.is_some() {
            self.observe(|viewer| {
                if !matches!(viewer.status, ViewerStatus::Showing) {
                    viewer.status = ViewerStatus::Loading;
                }
                viewer.request_frame(viewer.state.current_frame);
            });
        }
    }

    /// Re-runs resolution from the top of the candidate list after a failure.
    pub fn retry(&mut self) -> bool {
        let retryable = matches!(&self.status, ViewerStatus::Failed(err) if err.is_retryable());
        if self.disposed || !retryable || self.study.is_none() {
            return false;
        }
        self.observe(|viewer| {
            viewer.status = ViewerStatus::Loading;
            viewer.request_frame(viewer.state.current_frame);
        });
        true
    }

    /// Called once per display refresh: applies the coalesced pan, advances
    /// cine, consumes load responses and redraws when needed.
    pub fn on_refresh(&mut self) {
        self.observe(|viewer| {
            if let Some(pan) = viewer.pan.take_pending() {
                viewer.state.pan = pan;
                viewer.needs_redraw = true;
            }
            if let Some(index) = viewer.playback.tick(&mut viewer.state) {
                viewer.request_frame(index);
            }
            while let Some(response) = viewer.dispatcher.poll() {
                viewer.handle_response(response);
            }
            viewer.redraw();
        });
    }

    pub fn next_tick_in(&self) -> Option<std::time::Duration> {
        self.playback.next_tick_in(&self.state)
    }

    pub fn is_loading(&self) -> bool {
        self.tracker.is_pending()
    }

    /// Renders the current view offscreen and encodes it as PNG.
    pub fn export_png(&self) -> Result<Vec<u8>, ViewerError> {
        let image = self.current.as_ref().ok_or(ViewerError::NoFrameDisplayed)?;
        let [width, height] = match self.surface.as_ref() {
            Some(surface) => {
                let size = surface.size();
                [size.x.round().max(1.0) as usize, size.y.round().max(1.0) as usize]
            }
            None => image.size(),
        };

        let mut offscreen = PixelSurface::new(width, height);
        render::draw(&mut offscreen, image, &self.state);
        let pixels = offscreen.read_pixels()?;
        let exported = RasterImage::new(image.frame_index, width, height, pixels.to_vec());
        encode_png(&exported).map_err(|err| ViewerError::ExportFailed(format!("{err:#}")))
    }

    /// Stops cine and any outstanding load, then releases the surface. Every
    /// later call is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.playback.dispose(&mut self.state);
        self.dispatcher.cancel();
        self.tracker.clear();
        self.emit(ViewerEvent::Phase(PlaybackPhase::Disposed));
        self.subscribers.clear();
        self.surface = None;
        self.current = None;
        self.disposed = true;
    }

    fn request_frame(&mut self, frame_index: usize) {
        let Some(study) = self.study.as_ref() else {
            return;
        };
        if let Some(request) = self.tracker.request(study, frame_index, self.window_override) {
            self.dispatcher.dispatch(request);
        }
    }

    fn handle_response(&mut self, response: LoadResponse) {
        let completion = self.tracker.complete(response);
        if let Some(next) = completion.next {
            self.dispatcher.dispatch(next);
        }
        // Stale responses were logged by the tracker and never reach the user.
        let Ok(response) = completion.outcome else {
            return;
        };
        match response.result {
            Ok(resolved) => self.show(resolved),
            Err(err) => self.fail(err),
        }
    }

    fn show(&mut self, resolved: ResolvedFrame) {
        let frame_count = resolved
            .raster
            .frame_count_total
            .or_else(|| self.study.as_ref().and_then(|study| study.frame_count))
            .unwrap_or(self.state.frame_count)
            .max(1);

        if self.playback.phase() == PlaybackPhase::Idle {
            if self.playback.mark_ready(&mut self.state, frame_count) {
                self.emit(ViewerEvent::Phase(PlaybackPhase::Ready));
            }
            if let Some(fps) = resolved.raster.recommended_fps.filter(|_| self.follow_source_fps) {
                info!("Using the source's cine rate of {fps:.1} fps");
                self.playback.set_fps(&mut self.state, fps);
            }
        } else {
            self.playback.set_frame_count(&mut self.state, frame_count);
        }

        if resolved.raster.pixel_spacing.is_some() {
            self.state.pixel_spacing = resolved.raster.pixel_spacing;
        }
        self.attempted = resolved.failed_attempts;
        self.current_candidate = Some(resolved.candidate);
        self.current = Some(resolved.raster);
        self.status = ViewerStatus::Showing;
        self.needs_redraw = true;
    }

    fn fail(&mut self, err: ViewerError) {
        warn!("Frame {} failed to load: {err}", self.state.current_frame);
        self.attempted = err.attempts().to_vec();
        self.current = None;
        self.current_candidate = None;
        self.status = ViewerStatus::Failed(err);
        self.needs_redraw = true;
    }

    fn redraw(&mut self) {
        if !self.needs_redraw {
            return;
        }
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        match self.current.as_ref() {
            Some(image) => {
                render::draw(surface, image, &self.state);
            }
            None => surface.clear(),
        }
        self.needs_redraw = false;
    }

    /// Runs `change` and notifies subscribers of what it changed.
    fn observe(&mut self, change: impl FnOnce(&mut Self)) {
        if self.disposed {
            return;
        }
        let state = self.state.clone();
        let phase = self.playback.phase();
        let status = self.status.clone();

        change(self);

        if self.playback.phase() != phase {
            self.emit(ViewerEvent::Phase(self.playback.phase()));
        }
        if self.status != status {
            self.emit(ViewerEvent::Status(self.status.clone()));
        }
        if self.state != state {
            self.emit(ViewerEvent::State(self.state.clone()));
        }
    }

    fn emit(&mut self, event: ViewerEvent) {
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(&event);
        }
    }
}
