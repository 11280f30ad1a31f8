use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::render::RenderState;

pub const MIN_CINE_FPS: f32 = 1.0;
pub const MAX_CINE_FPS: f32 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Ready,
    Paused,
    Playing,
    Disposed,
}

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        match self.now.lock() {
            Ok(mut now) => *now += by,
            Err(poisoned) => *poisoned.into_inner() += by,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerKey {
    Left,
    Right,
    Home,
    End,
    Space,
}

pub fn clamp_fps(fps: f32) -> f32 {
    if fps.is_finite() {
        fps.clamp(MIN_CINE_FPS, MAX_CINE_FPS)
    } else {
        MIN_CINE_FPS
    }
}

fn frame_interval(fps: f32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(clamp_fps(fps)))
}

/// Drives the current frame index through manual steps, seeks and cine.
///
/// Every operation takes the viewer's `RenderState`; the controller itself only
/// holds the phase and the cine timer. Operations that need a new frame loaded
/// return its index.
#[derive(Debug)]
pub struct PlaybackController<C: Clock> {
    clock: C,
    phase: PlaybackPhase,
    /// Last cine advance; `None` whenever the timer is stopped.
    last_advance: Option<Instant>,
}

impl<C: Clock> PlaybackController<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            phase: PlaybackPhase::Idle,
            last_advance: None,
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn is_disposed(&self) -> bool {
        self.phase == PlaybackPhase::Disposed
    }

    fn is_active(&self) -> bool {
        matches!(self.phase, PlaybackPhase::Paused | PlaybackPhase::Playing)
    }

    /// Frame count and first raster are known. Passes through `Ready` and
    /// settles in `Paused`.
    pub fn mark_ready(&mut self, state: &mut RenderState, frame_count: usize) -> bool {
        if self.phase != PlaybackPhase::Idle {
            return false;
        }
        self.phase = PlaybackPhase::Ready;
        self.set_frame_count(state, frame_count);
        debug!("Playback ready with {} frames", state.frame_count);
        self.phase = PlaybackPhase::Paused;
        true
    }

    pub fn set_frame_count(&mut self, state: &mut RenderState, frame_count: usize) {
        state.frame_count = frame_count.max(1);
        state.current_frame = state.current_frame.min(state.frame_count - 1);
        if state.frame_count <= 1 && self.phase == PlaybackPhase::Playing {
            self.stop_timer(state);
            self.phase = PlaybackPhase::Paused;
        }
    }

    pub fn navigation_enabled(&self, state: &RenderState) -> bool {
        self.is_active() && state.frame_count > 1
    }

    pub fn seek(&mut self, state: &mut RenderState, index: usize) -> Option<usize> {
        if !self.is_active() || state.frame_count == 0 {
            return None;
        }
        let clamped = index.min(state.frame_count - 1);
        if clamped == state.current_frame {
            return None;
        }
        state.current_frame = clamped;
        Some(clamped)
    }

    pub fn step(&mut self, state: &mut RenderState, delta: isize) -> Option<usize> {
        let target = state.current_frame.saturating_add_signed(delta);
        self.seek(state, target)
    }

    pub fn first(&mut self, state: &mut RenderState) -> Option<usize> {
        self.seek(state, 0)
    }

    pub fn last(&mut self, state: &mut RenderState) -> Option<usize> {
        self.seek(state, state.frame_count.saturating_sub(1))
    }

    pub fn play(&mut self, state: &mut RenderState) -> bool {
        if self.phase != PlaybackPhase::Paused || state.frame_count <= 1 {
            return false;
        }
        self.phase = PlaybackPhase::Playing;
        state.is_playing = true;
        self.last_advance = Some(self.clock.now());
        true
    }

    pub fn pause(&mut self, state: &mut RenderState) -> bool {
        if self.phase != PlaybackPhase::Playing {
            return false;
        }
        self.stop_timer(state);
        self.phase = PlaybackPhase::Paused;
        true
    }

    pub fn toggle(&mut self, state: &mut RenderState) -> bool {
        match self.phase {
            PlaybackPhase::Playing => self.pause(state),
            PlaybackPhase::Paused => self.play(state),
            _ => false,
        }
    }

    pub fn set_fps(&mut self, state: &mut RenderState, fps: f32) {
        state.frames_per_second = clamp_fps(fps);
    }

    /// Advances by the number of whole cine intervals elapsed since the last
    /// advance, looping past the last frame.
    pub fn tick(&mut self, state: &mut RenderState) -> Option<usize> {
        if self.phase != PlaybackPhase::Playing || state.frame_count <= 1 {
            return None;
        }
        let last = self.last_advance?;

        let interval = frame_interval(state.frames_per_second);
        let elapsed = self.clock.now().saturating_duration_since(last);
        let intervals = elapsed.as_nanos() / interval.as_nanos().max(1);
        if intervals == 0 {
            return None;
        }

        let advanced = (intervals % state.frame_count as u128) as usize;
        self.last_advance = Some(last + interval * intervals.min(u128::from(u32::MAX)) as u32);
        let next = (state.current_frame + advanced) % state.frame_count;
        if next == state.current_frame {
            return None;
        }
        state.current_frame = next;
        Some(next)
    }

    /// Time left until the next cine advance, for scheduling a repaint.
    pub fn next_tick_in(&self, state: &RenderState) -> Option<Duration> {
        if self.phase != PlaybackPhase::Playing {
            return None;
        }
        let last = self.last_advance?;
        let due = last + frame_interval(state.frames_per_second);
        Some(due.saturating_duration_since(self.clock.now()))
    }

    pub fn handle_key(&mut self, state: &mut RenderState, key: ViewerKey) -> Option<usize> {
        match key {
            ViewerKey::Left => self.step(state, -1),
            ViewerKey::Right => self.step(state, 1),
            ViewerKey::Home => self.first(state),
            ViewerKey::End => self.last(state),
            ViewerKey::Space => {
                self.toggle(state);
                None
            }
        }
    }

    /// Back to `Idle` for a new study. Ignored once disposed.
    pub fn reset(&mut self, state: &mut RenderState) {
        if self.is_disposed() {
            return;
        }
        self.stop_timer(state);
        self.phase = PlaybackPhase::Idle;
    }

    pub fn dispose(&mut self, state: &mut RenderState) {
        self.stop_timer(state);
        self.phase = PlaybackPhase::Disposed;
    }

    fn stop_timer(&mut self, state: &mut RenderState) {
        self.last_advance = None;
        state.is_playing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_controller(frame_count: usize) -> (PlaybackController<ManualClock>, RenderState, ManualClock) {
        let clock = ManualClock::new();
        let mut controller = PlaybackController::new(clock.clone());
        let mut state = RenderState::new(10.0);
        assert!(controller.mark_ready(&mut state, frame_count));
        (controller, state, clock)
    }

    #[test]
    fn ready_settles_in_paused() {
        let (controller, state, _) = ready_controller(5);
        assert_eq!(controller.phase(), PlaybackPhase::Paused);
        assert_eq!(state.frame_count, 5);
        assert!(controller.navigation_enabled(&state));
    }

    #[test]
    fn seek_is_ignored_before_ready() {
        let mut controller = PlaybackController::new(ManualClock::new());
        let mut state = RenderState::default();
        state.frame_count = 10;
        assert_eq!(controller.seek(&mut state, 3), None);
        assert_eq!(state.current_frame, 0);
    }

    #[test]
    fn seek_clamps_into_range() {
        let (mut controller, mut state, _) = ready_controller(5);
        assert_eq!(controller.seek(&mut state, 99), Some(4));
        assert_eq!(controller.seek(&mut state, 4), None);
        assert_eq!(controller.step(&mut state, -10), Some(0));
        assert_eq!(controller.step(&mut state, -1), None);
    }

    #[test]
    fn single_frame_play_is_noop() {
        let (mut controller, mut state, clock) = ready_controller(1);
        assert!(!controller.play(&mut state));
        assert_eq!(controller.phase(), PlaybackPhase::Paused);
        assert!(!state.is_playing);
        assert!(!controller.navigation_enabled(&state));
        clock.advance(Duration::from_secs(1));
        assert_eq!(controller.tick(&mut state), None);
    }

    #[test]
    fn cine_advances_per_elapsed_interval_and_loops() {
        let (mut controller, mut state, clock) = ready_controller(4);
        assert!(controller.play(&mut state));
        assert!(state.is_playing);

        clock.advance(Duration::from_millis(250));
        assert_eq!(controller.tick(&mut state), Some(2));
        clock.advance(Duration::from_millis(40));
        assert_eq!(controller.tick(&mut state), None);
        clock.advance(Duration::from_millis(20));
        assert_eq!(controller.tick(&mut state), Some(3));
        clock.advance(Duration::from_millis(100));
        assert_eq!(controller.tick(&mut state), Some(0));
    }

    #[test]
    fn pause_stops_timer_and_keeps_frame() {
        let (mut controller, mut state, clock) = ready_controller(4);
        controller.play(&mut state);
        clock.advance(Duration::from_millis(100));
        assert_eq!(controller.tick(&mut state), Some(1));
        assert!(controller.pause(&mut state));
        clock.advance(Duration::from_secs(2));
        assert_eq!(controller.tick(&mut state), None);
        assert_eq!(state.current_frame, 1);
        assert!(!controller.pause(&mut state));
    }

    #[test]
    fn no_tick_after_dispose() {
        let (mut controller, mut state, clock) = ready_controller(8);
        controller.play(&mut state);
        controller.dispose(&mut state);
        clock.advance(Duration::from_secs(5));
        assert_eq!(controller.tick(&mut state), None);
        assert_eq!(controller.phase(), PlaybackPhase::Disposed);
        assert!(!controller.play(&mut state));
        controller.reset(&mut state);
        assert_eq!(controller.phase(), PlaybackPhase::Disposed);
    }

    #[test]
    fn keys_map_to_navigation() {
        let (mut controller, mut state, _) = ready_controller(6);
        assert_eq!(controller.handle_key(&mut state, ViewerKey::End), Some(5));
        assert_eq!(controller.handle_key(&mut state, ViewerKey::Left), Some(4));
        assert_eq!(controller.handle_key(&mut state, ViewerKey::Home), Some(0));
        assert_eq!(controller.handle_key(&mut state, ViewerKey::Right), Some(1));
        assert_eq!(controller.handle_key(&mut state, ViewerKey::Space), None);
        assert_eq!(controller.phase(), PlaybackPhase::Playing);
        controller.handle_key(&mut state, ViewerKey::Space);
        assert_eq!(controller.phase(), PlaybackPhase::Paused);
    }

    #[test]
    fn fps_is_clamped() {
        let (mut controller, mut state, _) = ready_controller(3);
        controller.set_fps(&mut state, 500.0);
        assert_eq!(state.frames_per_second, MAX_CINE_FPS);
        controller.set_fps(&mut state, 0.0);
        assert_eq!(state.frames_per_second, MIN_CINE_FPS);
    }

    #[test]
    fn shrinking_to_one_frame_stops_cine() {
        let (mut controller, mut state, _) = ready_controller(3);
        controller.play(&mut state);
        controller.set_frame_count(&mut state, 1);
        assert_eq!(controller.phase(), PlaybackPhase::Paused);
        assert!(!state.is_playing);
    }
}
