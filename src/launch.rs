use std::path::PathBuf;

use crate::source::StudyRef;
use crate::window::DisplayWindow;

const SCHEME: &str = "stackview://";

/// Initial view settings carried by a launch request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOptions {
    pub frame: Option<usize>,
    pub fps: Option<f32>,
    pub window: Option<DisplayWindow>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchRequest {
    LocalFile {
        path: PathBuf,
        options: LaunchOptions,
    },
    Study {
        /// Falls back to the configured source when absent.
        source: Option<String>,
        study: StudyRef,
        options: LaunchOptions,
    },
}

impl LaunchRequest {
    pub fn options(&self) -> &LaunchOptions {
        match self {
            LaunchRequest::LocalFile { options, .. } | LaunchRequest::Study { options, .. } => {
                options
            }
        }
    }
}

#[derive(Debug, Default)]
struct LaunchFields {
    path: Option<String>,
    source: Option<String>,
    study: Option<String>,
    name: Option<String>,
    frames: Option<usize>,
    frame: Option<usize>,
    fps: Option<f32>,
    window_width: Option<f32>,
    window_center: Option<f32>,
}

impl LaunchFields {
    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "path" | "file" | "open" => self.path = Some(value.to_string()),
            "source" | "root" | "base_url" => self.source = Some(value.to_string()),
            "study" | "study_id" => self.study = Some(value.to_string()),
            "name" | "canonical_name" => self.name = Some(value.to_string()),
            "frames" | "frame_count" => {
                let frames = parse_usize(key, value)?;
                if frames == 0 {
                    return Err("frames must be at least 1.".to_string());
                }
                self.frames = Some(frames);
            }
            "frame" => self.frame = Some(parse_usize(key, value)?),
            "fps" => {
                let fps = parse_f32(key, value)?;
                if fps <= 0.0 {
                    return Err("fps must be greater than 0.".to_string());
                }
                self.fps = Some(fps);
            }
            "ww" | "window_width" => {
                let width = parse_f32(key, value)?;
                if width <= 0.0 {
                    return Err("ww must be greater than 0.".to_string());
                }
                self.window_width = Some(width);
            }
            "wc" | "window_center" => self.window_center = Some(parse_f32(key, value)?),
            _ => {}
        }
        Ok(())
    }

    fn into_request(self) -> Result<Option<LaunchRequest>, String> {
        let window = match (self.window_width, self.window_center) {
            (Some(width), Some(center)) => Some(DisplayWindow::new(width, center)),
            (None, None) => None,
            _ => return Err("ww and wc must be given together.".to_string()),
        };
        let options = LaunchOptions {
            frame: self.frame,
            fps: self.fps,
            window,
        };

        match (self.path, self.study) {
            (Some(_), Some(_)) => {
                Err("Cannot mix a file path with study= / --study.".to_string())
            }
            (Some(path), None) => {
                if self.source.is_some() || self.name.is_some() {
                    return Err("source and name only apply to study launches.".to_string());
                }
                Ok(Some(LaunchRequest::LocalFile {
                    path: PathBuf::from(path),
                    options,
                }))
            }
            (None, Some(study_id)) => {
                let mut study = StudyRef::new(study_id).with_frame_count(self.frames);
                if let Some(name) = self.name {
                    study = study.with_canonical_name(name);
                }
                Ok(Some(LaunchRequest::Study {
                    source: self.source,
                    study,
                    options,
                }))
            }
            (None, None) => {
                if self.source.is_some() {
                    return Err("A study id is required with a source.".to_string());
                }
                Ok(None)
            }
        }
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("{key} must be a non-negative integer."))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, String> {
    value
        .parse::<f32>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| format!("{key} must be a number."))
}

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    if args.len() == 1 && strip_scheme(&args[0]).is_some() {
        return parse_stackview_uri(&args[0]).map(Some);
    }

    let mut fields = LaunchFields::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            if fields.path.is_some() {
                return Err("Only one DICOM file can be opened at a time.".to_string());
            }
            fields.path = Some(arg.clone());
            continue;
        };
        let (key, inline_value) = match flag.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (flag, None),
        };
        let value = match inline_value {
            Some(value) => value,
            None => iter
                .next()
                .cloned()
                .ok_or_else(|| format!("Missing value after --{key}."))?,
        };
        let key = key.to_ascii_lowercase().replace('-', "_");
        if !is_known_key(&key) {
            return Err(format!("Unknown option --{key}."));
        }
        fields.set(&key, &value)?;
    }

    fields.into_request()
}

fn is_known_key(key: &str) -> bool {
    matches!(
        key,
        "path"
            | "file"
            | "open"
            | "source"
            | "root"
            | "base_url"
            | "study"
            | "study_id"
            | "name"
            | "canonical_name"
            | "frames"
            | "frame_count"
            | "frame"
            | "fps"
            | "ww"
            | "window_width"
            | "wc"
            | "window_center"
    )
}

pub fn parse_stackview_uri(uri: &str) -> Result<LaunchRequest, String> {
    let rest = strip_scheme(uri).ok_or_else(|| format!("URL must start with {SCHEME}"))?;
    let (location, query) = match rest.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (rest, None),
    };

    let mut fields = LaunchFields::default();
    if let Some(path) = parse_location_path(location)? {
        fields.path = Some(path);
    }

    for pair in query.unwrap_or_default().split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = key.trim().to_ascii_lowercase();
        fields.set(&key, &percent_decode(value)?)?;
    }

    fields
        .into_request()?
        .ok_or_else(|| "URL names neither a file nor a study.".to_string())
}

fn strip_scheme(uri: &str) -> Option<&str> {
    let prefix = uri.get(..SCHEME.len())?;
    prefix
        .eq_ignore_ascii_case(SCHEME)
        .then(|| &uri[SCHEME.len()..])
}

fn parse_location_path(location: &str) -> Result<Option<String>, String> {
    let location = location.trim().trim_end_matches('/');
    if location.is_empty() || location.eq_ignore_ascii_case("open") {
        return Ok(None);
    }
    let path = match location.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("open/") => &location[5..],
        _ => location,
    };
    let decoded = percent_decode(path)?;
    Ok((!decoded.trim().is_empty()).then_some(decoded))
}

fn percent_decode(value: &str) -> Result<String, String> {
    const INVALID: &str = "Invalid percent-encoding in URL.";

    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                let hi = bytes.get(index + 1).copied().and_then(hex_value);
                let lo = bytes.get(index + 2).copied().and_then(hex_value);
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(INVALID.to_string());
                };
                decoded.push((hi << 4) | lo);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| "URL contains invalid UTF-8 after decoding.".to_string())
}

fn hex_value(digit: u8) -> Option<u8> {
    char::from(digit).to_digit(16).map(|value| value as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parse_file_query() {
        let request = parse_stackview_uri("stackview://open?path=data%2Fct%20cine.dcm&frame=4")
            .expect("URI should parse");
        assert_eq!(
            request,
            LaunchRequest::LocalFile {
                path: PathBuf::from("data/ct cine.dcm"),
                options: LaunchOptions {
                    frame: Some(4),
                    ..LaunchOptions::default()
                },
            }
        );
    }

    #[test]
    fn parse_file_in_location() {
        let request =
            parse_stackview_uri("STACKVIEW://open/%2Ftmp%2Fa.dcm").expect("URI should parse");
        assert_eq!(
            request,
            LaunchRequest::LocalFile {
                path: PathBuf::from("/tmp/a.dcm"),
                options: LaunchOptions::default(),
            }
        );
    }

    #[test]
    fn parse_study_request_with_window() {
        let request = parse_stackview_uri(
            "stackview://open?source=https%3A%2F%2Fpacs%2Fframes&study=CT-9&name=CT_0009.dcm&frames=96&fps=30&ww=400&wc=40",
        )
        .expect("URI should parse");
        let LaunchRequest::Study {
            source,
            study,
            options,
        } = request
        else {
            panic!("expected a study launch");
        };
        assert_eq!(source.as_deref(), Some("https://pacs/frames"));
        assert_eq!(study.study_id, "CT-9");
        assert_eq!(study.canonical_name.as_deref(), Some("CT_0009.dcm"));
        assert_eq!(study.frame_count, Some(96));
        assert_eq!(options.fps, Some(30.0));
        assert_eq!(options.window, Some(DisplayWindow::new(400.0, 40.0)));
    }

    #[test]
    fn window_needs_both_values() {
        let err = parse_stackview_uri("stackview://open?study=A&ww=400").expect_err("wc missing");
        assert!(err.contains("together"));
    }

    #[test]
    fn rejects_mixed_file_and_study() {
        assert!(parse_stackview_uri("stackview://open?path=a.dcm&study=A").is_err());
    }

    #[test]
    fn rejects_bad_percent_encoding() {
        assert!(parse_stackview_uri("stackview://open?path=a%2").is_err());
        assert!(parse_stackview_uri("stackview://open?path=a%zz").is_err());
    }

    #[test]
    fn empty_uri_is_an_error() {
        assert!(parse_stackview_uri("stackview://open").is_err());
        assert!(parse_stackview_uri("https://example.org").is_err());
    }

    #[test]
    fn parse_cli_file() {
        let request = parse_launch_request_from_args(&args(&["scan.dcm", "--fps", "12"]))
            .expect("args should parse")
            .expect("request");
        assert_eq!(
            request,
            LaunchRequest::LocalFile {
                path: PathBuf::from("scan.dcm"),
                options: LaunchOptions {
                    fps: Some(12.0),
                    ..LaunchOptions::default()
                },
            }
        );
    }

    #[test]
    fn parse_cli_study_flags() {
        let request = parse_launch_request_from_args(&args(&[
            "--source",
            "/data/studies",
            "--study=MR 5",
            "--frames",
            "20",
        ]))
        .expect("args should parse")
        .expect("request");
        match request {
            LaunchRequest::Study { source, study, .. } => {
                assert_eq!(source.as_deref(), Some("/data/studies"));
                assert_eq!(study.study_id, "MR 5");
                assert_eq!(study.frame_count, Some(20));
                assert_eq!(study.canonical_name, None);
            }
            other => panic!("expected study launch, got {other:?}"),
        }
    }

    #[test]
    fn cli_errors_are_reported() {
        assert!(parse_launch_request_from_args(&args(&["--study"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--zoom", "2"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["a.dcm", "b.dcm"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--frames", "0", "--study", "A"])).is_err());
        assert_eq!(parse_launch_request_from_args(&[]), Ok(None));
    }

    #[test]
    fn uri_argument_is_parsed_as_uri() {
        let request = parse_launch_request_from_args(&args(&["stackview://open?study=A"]))
            .expect("args should parse");
        assert!(matches!(request, Some(LaunchRequest::Study { .. })));
    }
}
