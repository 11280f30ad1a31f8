use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use log::{debug, warn};

use crate::error::ViewerError;
use crate::source::{ImageSourceResolver, ResolvedFrame, StudyRef};
use crate::window::DisplayWindow;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub token: u64,
    pub study: StudyRef,
    pub frame_index: usize,
    pub window: Option<DisplayWindow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadResponse {
    pub token: u64,
    pub frame_index: usize,
    pub result: Result<ResolvedFrame, ViewerError>,
}

pub trait LoadDispatcher {
    fn dispatch(&mut self, request: LoadRequest);
    fn poll(&mut self) -> Option<LoadResponse>;
    /// Drops interest in outstanding work. Later dispatches are ignored.
    fn cancel(&mut self);
}

/// Resolves frames on one background thread.
pub struct ThreadedLoader {
    request_tx: Option<Sender<LoadRequest>>,
    response_rx: Receiver<LoadResponse>,
    cancelled: Arc<AtomicBool>,
    /// Dispatched requests still waiting for a response.
    outstanding: VecDeque<LoadRequest>,
}

impl ThreadedLoader {
    pub fn spawn(resolver: Arc<ImageSourceResolver>) -> anyhow::Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<LoadRequest>();
        let (response_tx, response_rx) = mpsc::channel::<LoadResponse>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);

        thread::Builder::new()
            .name("stackview-loader".to_string())
            .spawn(move || {
                for request in request_rx {
                    if worker_cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    let result = resolver.resolve_and_load(
                        &request.study,
                        request.frame_index,
                        request.window,
                    );
                    if worker_cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    let response = LoadResponse {
                        token: request.token,
                        frame_index: request.frame_index,
                        result,
                    };
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
                debug!("Frame loader thread exiting");
            })
            .context("Could not start frame loader thread")?;

        Ok(Self::from_channels(request_tx, response_rx, cancelled))
    }

    fn from_channels(
        request_tx: Sender<LoadRequest>,
        response_rx: Receiver<LoadResponse>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            request_tx: Some(request_tx),
            response_rx,
            cancelled,
            outstanding: VecDeque::new(),
        }
    }

    /// Answers a request the worker can no longer serve.
    fn worker_lost(request: LoadRequest) -> LoadResponse {
        warn!(
            "Frame loader thread is gone; failing load for frame {}",
            request.frame_index
        );
        LoadResponse {
            token: request.token,
            frame_index: request.frame_index,
            result: Err(ViewerError::NoRenderableSource {
                study: request.study.study_id,
                attempts: Vec::new(),
            }),
        }
    }
}

impl LoadDispatcher for ThreadedLoader {
    fn dispatch(&mut self, request: LoadRequest) {
        if self.cancelled.load(Ordering::Relaxed) {
            return;
        }
        self.outstanding.push_back(request.clone());
        // Unsent requests stay outstanding and fail on the next poll.
        let Some(tx) = self.request_tx.as_ref() else {
            return;
        };
        if tx.send(request).is_err() {
            self.request_tx = None;
        }
    }

    fn poll(&mut self) -> Option<LoadResponse> {
        if self.cancelled.load(Ordering::Relaxed) {
            return None;
        }
        match self.response_rx.try_recv() {
            Ok(response) => {
                self.outstanding
                    .retain(|request| request.token != response.token);
                Some(response)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.request_tx = None;
                self.outstanding.pop_front().map(Self::worker_lost)
            }
        }
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.outstanding.clear();
        // The worker exits once the request channel closes.
        self.request_tx = None;
    }
}

impl Drop for ThreadedLoader {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Outcome of handing a response to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub outcome: Result<LoadResponse, ViewerError>,
    /// Queued request that should be dispatched now.
    pub next: Option<LoadRequest>,
}

/// Issues request tokens and keeps at most one load in flight.
#[derive(Debug, Default)]
pub struct LoadTracker {
    last_token: u64,
    in_flight: Option<u64>,
    queued: Option<LoadRequest>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_token(&self) -> Option<u64> {
        (self.last_token > 0).then_some(self.last_token)
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some() || self.queued.is_some()
    }

    /// Creates a request with a fresh token. Returns it when it can be
    /// dispatched right away; otherwise it replaces any queued request.
    pub fn request(
        &mut self,
        study: &StudyRef,
        frame_index: usize,
        window: Option<DisplayWindow>,
    ) -> Option<LoadRequest> {
        self.last_token += 1;
        let request = LoadRequest {
            token: self.last_token,
            study: study.clone(),
            frame_index,
            window,
        };

        if self.in_flight.is_some() {
            if let Some(replaced) = self.queued.replace(request) {
                debug!(
                    "Load for frame {} superseded before dispatch (token {})",
                    replaced.frame_index, replaced.token
                );
            }
            return None;
        }
        self.in_flight = Some(request.token);
        Some(request)
    }

    pub fn complete(&mut self, response: LoadResponse) -> Completion {
        if self.in_flight != Some(response.token) {
            return Completion {
                outcome: Err(self.stale(response.token)),
                next: None,
            };
        }
        self.in_flight = None;

        if response.token == self.last_token {
            return Completion {
                outcome: Ok(response),
                next: None,
            };
        }

        let next = self.queued.take();
        if let Some(request) = next.as_ref() {
            self.in_flight = Some(request.token);
        }
        Completion {
            outcome: Err(self.stale(response.token)),
            next,
        }
    }

    /// Forgets every outstanding request; their responses will be stale.
    pub fn clear(&mut self) {
        self.in_flight = None;
        self.queued = None;
    }

    fn stale(&self, token: u64) -> ViewerError {
        let err = ViewerError::StaleResponse {
            token,
            expected: self.latest_token(),
        };
        debug!("Discarding load response: {err}");
        err
    }
}
