//! User-selected download options.
//!
//! A [`DownloadOptions`] value is a snapshot: once a job is submitted it is
//! shared behind an `Arc` and never mutated. Editing the form afterwards builds
//! a new value for the next job.

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_AUDIO_QUALITY: u8 = 5;
pub const MAX_AUDIO_QUALITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Best,
    BestVideoOnly,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    Worst,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 8] = [
        VideoQuality::Best,
        VideoQuality::BestVideoOnly,
        VideoQuality::P1440,
        VideoQuality::P1080,
        VideoQuality::P720,
        VideoQuality::P480,
        VideoQuality::P360,
        VideoQuality::Worst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoQuality::Best => "best",
            VideoQuality::BestVideoOnly => "best_video_only",
            VideoQuality::P1440 => "1440p",
            VideoQuality::P1080 => "1080p",
            VideoQuality::P720 => "720p",
            VideoQuality::P480 => "480p",
            VideoQuality::P360 => "360p",
            VideoQuality::Worst => "worst",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|q| q.as_str() == value)
    }

    pub fn max_height(&self) -> Option<u32> {
        match self {
            VideoQuality::P1440 => Some(1440),
            VideoQuality::P1080 => Some(1080),
            VideoQuality::P720 => Some(720),
            VideoQuality::P480 => Some(480),
            VideoQuality::P360 => Some(360),
            VideoQuality::Best | VideoQuality::BestVideoOnly | VideoQuality::Worst => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DownloadMode {
    Video(VideoQuality),
    AudioOnly,
    /// Raw yt-dlp format selector. Passed through as-is; yt-dlp validates it.
    CustomFormat(String),
}

impl Default for DownloadMode {
    fn default() -> Self {
        DownloadMode::Video(VideoQuality::Best)
    }
}

/// Container used both for remuxing and for constraining video format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Mp4,
    Mkv,
    Webm,
    Mov,
    Flv,
    Avi,
}

impl ContainerFormat {
    pub const ALL: [ContainerFormat; 6] = [
        ContainerFormat::Mp4,
        ContainerFormat::Mkv,
        ContainerFormat::Webm,
        ContainerFormat::Mov,
        ContainerFormat::Flv,
        ContainerFormat::Avi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Webm => "webm",
            ContainerFormat::Mov => "mov",
            ContainerFormat::Flv => "flv",
            ContainerFormat::Avi => "avi",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Best,
    Aac,
    Alac,
    Flac,
    M4a,
    Mp3,
    Opus,
    Vorbis,
    Wav,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 9] = [
        AudioFormat::Best,
        AudioFormat::Aac,
        AudioFormat::Alac,
        AudioFormat::Flac,
        AudioFormat::M4a,
        AudioFormat::Mp3,
        AudioFormat::Opus,
        AudioFormat::Vorbis,
        AudioFormat::Wav,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Best => "best",
            AudioFormat::Aac => "aac",
            AudioFormat::Alac => "alac",
            AudioFormat::Flac => "flac",
            AudioFormat::M4a => "m4a",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Opus => "opus",
            AudioFormat::Vorbis => "vorbis",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.as_str() == value)
    }
}

/// yt-dlp VBR level: 0 is best, 10 is worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AudioQuality(u8);

impl AudioQuality {
    pub fn new(level: u8) -> Option<Self> {
        (level <= MAX_AUDIO_QUALITY).then_some(Self(level))
    }

    pub fn level(&self) -> u8 {
        self.0
    }
}

impl Default for AudioQuality {
    fn default() -> Self {
        Self(DEFAULT_AUDIO_QUALITY)
    }
}

impl TryFrom<u8> for AudioQuality {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        AudioQuality::new(value)
            .ok_or_else(|| format!("audio quality must be 0..={MAX_AUDIO_QUALITY}, got {value}"))
    }
}

impl From<AudioQuality> for u8 {
    fn from(value: AudioQuality) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SponsorBlockCategory {
    Sponsor,
    Intro,
    Outro,
    Selfpromo,
    Preview,
    Filler,
    Interaction,
    MusicOfftopic,
}

impl SponsorBlockCategory {
    pub const ALL: [SponsorBlockCategory; 8] = [
        SponsorBlockCategory::Sponsor,
        SponsorBlockCategory::Intro,
        SponsorBlockCategory::Outro,
        SponsorBlockCategory::Selfpromo,
        SponsorBlockCategory::Preview,
        SponsorBlockCategory::Filler,
        SponsorBlockCategory::Interaction,
        SponsorBlockCategory::MusicOfftopic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SponsorBlockCategory::Sponsor => "sponsor",
            SponsorBlockCategory::Intro => "intro",
            SponsorBlockCategory::Outro => "outro",
            SponsorBlockCategory::Selfpromo => "selfpromo",
            SponsorBlockCategory::Preview => "preview",
            SponsorBlockCategory::Filler => "filler",
            SponsorBlockCategory::Interaction => "interaction",
            SponsorBlockCategory::MusicOfftopic => "music_offtopic",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// Parses the free-text category field (`"sponsor, intro,outro"`).
    /// Blank input and the literal `all` both mean every category, returned as an empty set.
    pub fn parse_list(value: &str) -> Result<BTreeSet<Self>> {
        let mut out = BTreeSet::new();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.eq_ignore_ascii_case("all") {
                return Ok(BTreeSet::new());
            }
            let category = Self::from_str(part).ok_or_else(|| {
                EngineError::InvalidOptions(format!("unknown SponsorBlock category: {part}"))
            })?;
            out.insert(category);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubtitleOptions {
    /// Language codes such as `en` or `de.*`. Empty selects every available language.
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub url: String,
    pub mode: DownloadMode,
    pub remux: Option<ContainerFormat>,
    pub audio_format: AudioFormat,
    pub audio_quality: Option<AudioQuality>,
    pub subtitles: Option<SubtitleOptions>,
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub embed_chapters: bool,
    pub split_chapters: bool,
    pub playlist: bool,
    /// `Some(empty)` removes every category.
    pub sponsorblock: Option<BTreeSet<SponsorBlockCategory>>,
    pub output_dir: PathBuf,
}

impl DownloadOptions {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            mode: DownloadMode::default(),
            remux: None,
            audio_format: AudioFormat::default(),
            audio_quality: None,
            subtitles: None,
            embed_metadata: false,
            embed_thumbnail: false,
            embed_chapters: false,
            split_chapters: false,
            playlist: true,
            sponsorblock: None,
            output_dir: output_dir.into(),
        }
    }

    /// Checks the preconditions a job needs before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(EngineError::InvalidOptions("URL is empty".to_string()));
        }
        if url.chars().any(|c| c.is_control()) {
            return Err(EngineError::InvalidOptions(
                "URL contains control characters".to_string(),
            ));
        }
        if let DownloadMode::CustomFormat(selector) = &self.mode {
            if selector.trim().is_empty() {
                return Err(EngineError::InvalidOptions(
                    "custom format selector is empty".to_string(),
                ));
            }
        }
        ensure_writable_dir(&self.output_dir)
    }
}

pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    let meta = std::fs::metadata(dir).map_err(|e| {
        EngineError::InvalidOptions(format!(
            "output directory {} is not accessible: {e}",
            dir.to_string_lossy()
        ))
    })?;
    if !meta.is_dir() {
        return Err(EngineError::InvalidOptions(format!(
            "output path {} is not a directory",
            dir.to_string_lossy()
        )));
    }

    // Probe with a real write; permission bits are not authoritative on every filesystem.
    let probe = dir.join(format!(".vidfetch-write-probe-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe, b"").map_err(|e| {
        EngineError::InvalidOptions(format!(
            "output directory {} is not writable: {e}",
            dir.to_string_lossy()
        ))
    })?;
    remove_write_probe(&probe)
}

fn remove_write_probe(probe: &Path) -> Result<()> {
    std::fs::remove_file(probe).map_err(|e| {
        EngineError::InvalidOptions(format!(
            "could not remove write probe {}: {e}",
            probe.to_string_lossy()
        ))
    })
}
