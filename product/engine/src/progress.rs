//! yt-dlp output parsing.
//!
//! Each line is first classified by a set of independent matchers
//! ([`classify`]); [`parse_line`] then turns the category into at most one
//! [`ProgressEvent`], threading a small [`ParserState`] through so that stage
//! changes and the start of a job are reported once.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started,
    Progress {
        percent: f64,
        speed: String,
        eta: String,
    },
    PostProcessing {
        stage: String,
    },
    Completed,
    Failed {
        message: String,
    },
    Cancelled,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed | ProgressEvent::Failed { .. } | ProgressEvent::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Started => "started",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::PostProcessing { .. } => "post_processing",
            ProgressEvent::Completed => "completed",
            ProgressEvent::Failed { .. } => "failed",
            ProgressEvent::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Preparing,
    Downloading,
    PostProcessing,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParserState {
    /// Set once any line has produced an event.
    pub started: bool,
    pub phase: Phase,
    /// Post-processor tag of the current stage, cleared when a new download begins.
    pub last_stage: Option<String>,
    /// Files announced by the tool, in announcement order, without duplicates.
    pub destinations: Vec<String>,
}

impl ParserState {
    fn record_destination(&mut self, path: &str) {
        let path = path.trim().trim_matches('"');
        if path.is_empty() || self.destinations.iter().any(|d| d == path) {
            return;
        }
        self.destinations.push(path.to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineCategory<'a> {
    Error {
        message: &'a str,
    },
    Percent {
        percent: &'a str,
        speed: Option<&'a str>,
        eta: Option<&'a str>,
    },
    Destination {
        path: &'a str,
    },
    PostProcessor {
        tag: &'a str,
        destination: Option<&'a str>,
    },
    Info {
        tag: &'a str,
    },
    Unmatched,
}

const POST_PROCESSOR_TAGS: &[&str] = &[
    "Merger",
    "ExtractAudio",
    "VideoRemuxer",
    "VideoConvertor",
    "EmbedSubtitle",
    "EmbedThumbnail",
    "Metadata",
    "SponsorBlock",
    "ModifyChapters",
    "SplitChapters",
    "ThumbnailsConvertor",
    "SubtitlesConvertor",
    "MoveFiles",
];

fn tag_re() -> &'static Regex {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    TAG_RE.get_or_init(|| Regex::new(r"^\[([A-Za-z][\w:.+-]*)\]\s*(.*)$").unwrap())
}

fn error_re() -> &'static Regex {
    static ERROR_RE: OnceLock<Regex> = OnceLock::new();
    ERROR_RE.get_or_init(|| Regex::new(r"^(?:ERROR:|yt-dlp: error:)\s*(.*)$").unwrap())
}

fn percent_re() -> &'static Regex {
    static PERCENT_RE: OnceLock<Regex> = OnceLock::new();
    PERCENT_RE
        .get_or_init(|| Regex::new(r"^(?:\[download\]\s+)?(\S+)%\s+of\s+(.*)$").unwrap())
}

fn speed_re() -> &'static Regex {
    static SPEED_RE: OnceLock<Regex> = OnceLock::new();
    SPEED_RE.get_or_init(|| Regex::new(r"\bat\s+(Unknown(?:\s+B/s)?|\S+)").unwrap())
}

fn eta_re() -> &'static Regex {
    static ETA_RE: OnceLock<Regex> = OnceLock::new();
    ETA_RE.get_or_init(|| Regex::new(r"\bETA\s+(\S+)").unwrap())
}

fn elapsed_re() -> &'static Regex {
    static ELAPSED_RE: OnceLock<Regex> = OnceLock::new();
    ELAPSED_RE.get_or_init(|| Regex::new(r"\bin\s+\d[\d:]*").unwrap())
}

fn destination_re() -> &'static Regex {
    static DESTINATION_RE: OnceLock<Regex> = OnceLock::new();
    DESTINATION_RE.get_or_init(|| {
        Regex::new(r#"(?:Destination:\s+(.+)|Merging formats into "(.+)"|^(.+?) has already been downloaded)"#)
            .unwrap()
    })
}

fn match_error(line: &str) -> Option<LineCategory<'_>> {
    let caps = error_re().captures(line)?;
    let message = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    Some(LineCategory::Error {
        message: if message.is_empty() { line } else { message },
    })
}

fn match_percent(line: &str) -> Option<LineCategory<'_>> {
    let caps = percent_re().captures(line)?;
    let percent = caps.get(1)?.as_str();
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    let speed = speed_re()
        .captures(rest)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let eta = eta_re()
        .captures(rest)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| elapsed_re().is_match(rest).then_some("00:00"));

    Some(LineCategory::Percent {
        percent,
        speed,
        eta,
    })
}

fn extract_destination(detail: &str) -> Option<&str> {
    let caps = destination_re().captures(detail)?;
    (1..=3)
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().trim())
        .filter(|p| !p.is_empty())
}

fn is_post_processor(tag: &str) -> bool {
    POST_PROCESSOR_TAGS.contains(&tag) || tag.starts_with("Fixup") || tag.starts_with("FFmpeg")
}

fn match_tagged(line: &str) -> Option<LineCategory<'_>> {
    let caps = tag_re().captures(line)?;
    let tag = caps.get(1)?.as_str();
    let detail = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    if is_post_processor(tag) {
        return Some(LineCategory::PostProcessor {
            tag,
            destination: extract_destination(detail),
        });
    }
    if tag == "download" {
        if let Some(path) = extract_destination(detail) {
            return Some(LineCategory::Destination { path });
        }
    }
    Some(LineCategory::Info { tag })
}

/// Runs the matchers in priority order. The first hit wins.
pub fn classify(line: &str) -> LineCategory<'_> {
    let line = line.trim();
    if line.is_empty() {
        return LineCategory::Unmatched;
    }
    match_error(line)
        .or_else(|| match_percent(line))
        .or_else(|| match_tagged(line))
        .unwrap_or(LineCategory::Unmatched)
}

fn parse_percent(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    (value.is_finite() && (0.0..=100.0).contains(&value)).then_some(value)
}

fn normalize_field(value: Option<&str>) -> String {
    match value.map(str::trim) {
        None | Some("") => UNKNOWN.to_string(),
        Some(v) if v.starts_with(UNKNOWN) => UNKNOWN.to_string(),
        Some(v) => v.to_string(),
    }
}

/// Feeds one output line through the parser.
///
/// Never fails: a line that matches nothing, or matches a pattern but carries
/// malformed numbers, yields no event and leaves the state untouched apart
/// from recorded destinations.
pub fn parse_line(line: &str, mut state: ParserState) -> (ParserState, Option<ProgressEvent>) {
    let event = match classify(line) {
        LineCategory::Error { message } => Some(ProgressEvent::Failed {
            message: message.to_string(),
        }),
        LineCategory::Percent {
            percent,
            speed,
            eta,
        } => match parse_percent(percent) {
            Some(percent) => {
                if state.phase == Phase::PostProcessing {
                    state.last_stage = None;
                }
                state.phase = Phase::Downloading;
                Some(ProgressEvent::Progress {
                    percent,
                    speed: normalize_field(speed),
                    eta: normalize_field(eta),
                })
            }
            None => None,
        },
        LineCategory::Destination { path } => {
            state.record_destination(path);
            state.phase = Phase::Downloading;
            state.last_stage = None;
            None
        }
        LineCategory::PostProcessor { tag, destination } => {
            if let Some(path) = destination {
                state.record_destination(path);
            }
            state.phase = Phase::PostProcessing;
            if state.last_stage.as_deref() == Some(tag) {
                None
            } else {
                state.last_stage = Some(tag.to_string());
                Some(ProgressEvent::PostProcessing {
                    stage: tag.to_string(),
                })
            }
        }
        LineCategory::Info { .. } if !state.started => Some(ProgressEvent::Started),
        LineCategory::Info { .. } | LineCategory::Unmatched => None,
    };

    if event.is_some() {
        state.started = true;
    }
    (state, event)
}
