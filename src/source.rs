use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{StatusCode, Url};

use crate::error::{FailedAttempt, FetchError, ViewerError};
use crate::raster::{decode_png, RasterImage};
use crate::service::{FrameRequest, FrameService, FrameServiceError};
use crate::window::DisplayWindow;

/// Collaborator-supplied reference to one multi-frame study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyRef {
    pub study_id: String,
    /// File name of the raw source as known to storage, e.g. `CT_0001.dcm`.
    pub canonical_name: Option<String>,
    pub frame_count: Option<usize>,
}

impl StudyRef {
    pub fn new(study_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
            canonical_name: None,
            frame_count: None,
        }
    }

    pub fn with_canonical_name(mut self, name: impl Into<String>) -> Self {
        self.canonical_name = Some(name.into());
        self
    }

    pub fn with_frame_count(mut self, frame_count: Option<usize>) -> Self {
        self.frame_count = frame_count;
        self
    }

    fn canonical_stem(&self) -> Option<&str> {
        let name = self.canonical_name.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }
        Some(
            Path::new(name)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or(name),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Processed,
    Normalized,
    Thumbnail,
    RawFrameIndexed,
    Heuristic,
}

impl CandidateKind {
    pub fn label(&self) -> &'static str {
        match self {
            CandidateKind::Processed => "processed",
            CandidateKind::Normalized => "normalized",
            CandidateKind::Thumbnail => "thumbnail",
            CandidateKind::RawFrameIndexed => "raw",
            CandidateKind::Heuristic => "heuristic",
        }
    }

    /// Raw sources need the frame index passed along with the request.
    pub fn is_raw(&self) -> bool {
        matches!(self, CandidateKind::RawFrameIndexed | CandidateKind::Heuristic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSourceCandidate {
    pub kind: CandidateKind,
    /// Path relative to the source root.
    pub locator: String,
    pub frame_index: Option<usize>,
}

impl ImageSourceCandidate {
    pub fn new(kind: CandidateKind, locator: impl Into<String>, frame_index: Option<usize>) -> Self {
        Self {
            kind,
            locator: locator.into(),
            frame_index,
        }
    }
}

impl fmt::Display for ImageSourceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_index {
            Some(index) => write!(f, "[{}] {} (frame {index})", self.kind.label(), self.locator),
            None => write!(f, "[{}] {}", self.kind.label(), self.locator),
        }
    }
}

pub fn build_candidates(study: &StudyRef, frame_index: usize) -> Vec<ImageSourceCandidate> {
    let mut candidates = Vec::with_capacity(8);

    if let (Some(stem), Some(name)) = (study.canonical_stem(), study.canonical_name.as_deref()) {
        candidates.push(ImageSourceCandidate::new(
            CandidateKind::Processed,
            format!("processed/{stem}/frame_{frame_index:04}.png"),
            None,
        ));
        candidates.push(ImageSourceCandidate::new(
            CandidateKind::Normalized,
            format!("normalized/{stem}/frame_{frame_index:04}.png"),
            None,
        ));
        if frame_index == 0 {
            candidates.push(ImageSourceCandidate::new(
                CandidateKind::Thumbnail,
                format!("thumbnails/{stem}.png"),
                None,
            ));
        }
        candidates.push(ImageSourceCandidate::new(
            CandidateKind::RawFrameIndexed,
            format!("raw/{}", name.trim()),
            Some(frame_index),
        ));
    }

    for variant in heuristic_name_variants(&study.study_id) {
        let locator = format!("raw/{variant}.dcm");
        if candidates.iter().any(|candidate| candidate.locator == locator) {
            continue;
        }
        candidates.push(ImageSourceCandidate::new(
            CandidateKind::Heuristic,
            locator,
            Some(frame_index),
        ));
    }

    candidates
}

fn heuristic_name_variants(study_id: &str) -> Vec<String> {
    let trimmed = study_id.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut variants = vec![
        trimmed.to_string(),
        trimmed.to_ascii_lowercase(),
        trimmed
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .collect::<String>(),
    ];
    let mut seen = Vec::with_capacity(variants.len());
    variants.retain(|variant| {
        if variant.is_empty() || seen.contains(variant) {
            return false;
        }
        seen.push(variant.clone());
        true
    });
    variants
}

/// A raster obtained from one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRaster {
    pub raster: RasterImage,
}

pub trait FrameFetcher: Send + Sync {
    fn fetch(
        &self,
        candidate: &ImageSourceCandidate,
        window: Option<DisplayWindow>,
        timeout: Duration,
    ) -> Result<FetchedRaster, FetchError>;
}

/// Serves candidates from a directory tree laid out like the storage layer.
pub struct LocalFetcher {
    root: PathBuf,
    service: FrameService,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>, service: FrameService) -> Self {
        Self {
            root: root.into(),
            service,
        }
    }

    /// Length of the `frame_NNNN.png` sequence a PNG candidate belongs to.
    /// Thumbnails look at the study's processed and normalized directories.
    fn png_frame_count(&self, kind: CandidateKind, path: &Path) -> Option<usize> {
        match kind {
            CandidateKind::Processed | CandidateKind::Normalized => {
                path.parent().and_then(png_sequence_len)
            }
            CandidateKind::Thumbnail => {
                let stem = path.file_stem()?;
                ["processed", "normalized"]
                    .into_iter()
                    .find_map(|dir| png_sequence_len(&self.root.join(dir).join(stem)))
            }
            CandidateKind::RawFrameIndexed | CandidateKind::Heuristic => None,
        }
    }

    /// Raw files may also sit directly in the root instead of under `raw/`.
    fn resolve_path(&self, locator: &str) -> PathBuf {
        let nested = self.root.join(locator);
        if nested.exists() {
            return nested;
        }
        match locator.strip_prefix("raw/") {
            Some(flat) => self.root.join(flat),
            None => nested,
        }
    }
}

impl FrameFetcher for LocalFetcher {
    fn fetch(
        &self,
        candidate: &ImageSourceCandidate,
        window: Option<DisplayWindow>,
        timeout: Duration,
    ) -> Result<FetchedRaster, FetchError> {
        let started = Instant::now();
        let path = self.resolve_path(&candidate.locator);
        let frame_index = candidate.frame_index.unwrap_or(0);

        let raster = if candidate.kind.is_raw() {
            let response = self
                .service
                .serve(&FrameRequest {
                    path,
                    frame_index,
                    window,
                })
                .map_err(|err| match err {
                    FrameServiceError::NotFound(_) => FetchError::NotFound,
                    FrameServiceError::DecodeFailed(reason) => FetchError::DecodeFailed(reason),
                })?;
            let mut raster = decode_png(&response.png, frame_index)
                .map_err(|err| FetchError::DecodeFailed(format!("{err:#}")))?
                .with_frame_count_total(Some(response.frame_count_total));
            raster.window = Some(response.window);
            raster.pixel_spacing = response.pixel_spacing;
            raster.recommended_fps = response.recommended_fps;
            raster
        } else {
            let bytes = fs::read(&path).map_err(|err| match err.kind() {
                ErrorKind::NotFound => FetchError::NotFound,
                _ => FetchError::Transport(format!("{}: {err}", path.display())),
            })?;
            decode_png(&bytes, frame_index)
                .map_err(|err| FetchError::DecodeFailed(format!("{err:#}")))?
                .with_frame_count_total(self.png_frame_count(candidate.kind, &path))
        };

        if started.elapsed() > timeout {
            return Err(FetchError::Timeout);
        }
        Ok(FetchedRaster { raster })
    }
}

/// One past the highest `frame_NNNN.png` index in `dir`.
fn png_sequence_len(dir: &Path) -> Option<usize> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| sequence_index(&entry.file_name().to_string_lossy()))
        .max()
        .map(|highest| highest + 1)
}

fn sequence_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("frame_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

/// Fetches candidates with plain HTTP GET requests below a base URL.
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
    export_origin: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: &str, export_origin: Option<String>) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim())
            .with_context(|| format!("Invalid frame source URL {base_url:?}"))?;
        if base_url.cannot_be_a_base() {
            bail!("Frame source URL {base_url} cannot hold a path");
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Could not initialize HTTP client for frame sources")?;
        Ok(Self {
            client,
            base_url,
            export_origin: export_origin.map(|origin| normalize_origin(&origin)),
        })
    }

    /// Locator segments are percent-encoded below the base path.
    pub fn candidate_url(&self, candidate: &ImageSourceCandidate, window: Option<DisplayWindow>) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(candidate.locator.split('/').filter(|segment| !segment.is_empty()));
        }
        if candidate.kind.is_raw() {
            let mut query = url.query_pairs_mut();
            query.append_pair("frame", &candidate.frame_index.unwrap_or(0).to_string());
            if let Some(window) = window {
                query
                    .append_pair("ww", &window.width().to_string())
                    .append_pair("wc", &window.center().to_string());
            }
        }
        url
    }

    fn export_allowed(&self, url: &str) -> bool {
        match self.export_origin.as_deref() {
            Some(origin) => origin_of(url).is_some_and(|candidate| candidate == origin),
            None => false,
        }
    }
}

impl FrameFetcher for HttpFetcher {
    fn fetch(
        &self,
        candidate: &ImageSourceCandidate,
        window: Option<DisplayWindow>,
        timeout: Duration,
    ) -> Result<FetchedRaster, FetchError> {
        let url = self.candidate_url(candidate, window);
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "image/png")
            .timeout(timeout)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Transport(format!("{url}: {err}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let metadata = FrameMetadata::from_headers(response.headers());
        let bytes = response.bytes().map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(format!("Could not read response body from {url}: {err}"))
            }
        })?;

        let frame_index = candidate.frame_index.unwrap_or(0);
        let raster = decode_png(&bytes, frame_index)
            .map_err(|err| FetchError::DecodeFailed(format!("{err:#}")))?;
        if let Some((width, height)) = metadata.size {
            if (width, height) != (raster.width, raster.height) {
                return Err(FetchError::DecodeFailed(format!(
                    "declared {width}x{height} but decoded {}x{}",
                    raster.width, raster.height
                )));
            }
        }

        let mut raster = raster
            .with_frame_count_total(metadata.frame_count_total)
            .with_export_allowed(self.export_allowed(url.as_str()));
        raster.pixel_spacing = metadata.pixel_spacing;
        raster.recommended_fps = metadata.recommended_fps;
        Ok(FetchedRaster { raster })
    }
}

#[derive(Debug, Default, PartialEq)]
struct FrameMetadata {
    size: Option<(usize, usize)>,
    frame_count_total: Option<usize>,
    pixel_spacing: Option<(f32, f32)>,
    recommended_fps: Option<f32>,
}

impl FrameMetadata {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<usize>().ok())
        };
        let pixel_spacing = headers
            .get("x-pixel-spacing")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let mut parts = value.split('\\').map(|part| part.trim().parse::<f32>().ok());
                Some((parts.next()??, parts.next()??))
            })
            .filter(|(row, column)| *row > 0.0 && *column > 0.0);
        let recommended_fps = headers
            .get("x-cine-fps")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f32>().ok())
            .filter(|fps| fps.is_finite() && *fps > 0.0);
        Self {
            size: read("x-frame-width").zip(read("x-frame-height")),
            frame_count_total: read("x-frame-count").filter(|count| *count > 0),
            pixel_spacing,
            recommended_fps,
        }
    }
}

fn normalize_origin(value: &str) -> String {
    origin_of(value).unwrap_or_else(|| value.trim().trim_end_matches('/').to_ascii_lowercase())
}

/// `scheme://host[:port]` of an absolute URL.
fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.trim().split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    Some(format!(
        "{}://{}",
        scheme.to_ascii_lowercase(),
        authority.to_ascii_lowercase()
    ))
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFrame {
    pub raster: RasterImage,
    pub candidate: ImageSourceCandidate,
    pub failed_attempts: Vec<FailedAttempt>,
}

pub struct ImageSourceResolver {
    fetcher: Box<dyn FrameFetcher>,
    attempt_timeout: Duration,
}

impl ImageSourceResolver {
    pub fn new(fetcher: Box<dyn FrameFetcher>, attempt_timeout: Duration) -> Self {
        Self {
            fetcher,
            attempt_timeout,
        }
    }

    pub fn resolve_and_load(
        &self,
        study: &StudyRef,
        frame_index: usize,
        window: Option<DisplayWindow>,
    ) -> Result<ResolvedFrame, ViewerError> {
        let candidates = build_candidates(study, frame_index);
        self.load_first(study, frame_index, candidates, window)
    }

    /// Tries `candidates` in order. The winning raster is labelled with
    /// `frame_index` whatever its source.
    pub fn load_first(
        &self,
        study: &StudyRef,
        frame_index: usize,
        candidates: Vec<ImageSourceCandidate>,
        window: Option<DisplayWindow>,
    ) -> Result<ResolvedFrame, ViewerError> {
        let mut failed_attempts = Vec::new();

        for candidate in candidates {
            if candidate.kind == CandidateKind::Heuristic {
                warn!(
                    "Study {}: trying heuristic source {} (no canonical mapping matched)",
                    study.study_id, candidate.locator
                );
            }

            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                self.fetcher.fetch(&candidate, window, self.attempt_timeout)
            }))
            .unwrap_or_else(|_| {
                Err(FetchError::DecodeFailed(format!(
                    "fetch of {} panicked",
                    candidate.locator
                )))
            });

            match attempt {
                Ok(fetched) => {
                    if candidate.kind == CandidateKind::Heuristic {
                        warn!(
                            "Study {}: rendered from heuristic source {}",
                            study.study_id, candidate
                        );
                    } else {
                        info!("Study {}: rendered from {}", study.study_id, candidate);
                    }
                    let mut raster = fetched.raster;
                    raster.frame_index = frame_index;
                    return Ok(ResolvedFrame {
                        raster,
                        candidate,
                        failed_attempts,
                    });
                }
                Err(error) => {
                    debug!("Study {}: {} failed: {}", study.study_id, candidate, error);
                    failed_attempts.push(FailedAttempt { candidate, error });
                }
            }
        }

        Err(ViewerError::NoRenderableSource {
            study: study.study_id.clone(),
            attempts: failed_attempts,
        })
    }
}
