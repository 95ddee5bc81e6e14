//! Translation of [`DownloadOptions`] into a yt-dlp argument vector.
//!
//! The builder is pure: no I/O, no failure. Options are validated before a job
//! is submitted, so every input here is assumed well-formed. The result is
//! always an argument vector handed straight to the OS; nothing is ever
//! interpreted by a shell.

use crate::config::EngineConfig;
use crate::options::{ContainerFormat, DownloadMode, DownloadOptions, VideoQuality};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";
pub const OUTPUT_FILENAME_PATTERN: &str = "%(title)s.%(ext)s";
const DEFAULT_CONTAINER: ContainerFormat = ContainerFormat::Mp4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandInvocation {
    /// Human-readable rendering for logs and dry runs. Never executed.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote_for_display(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|a| quote_for_display(a)));
        parts.join(" ")
    }

    pub fn url(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

fn quote_for_display(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,%@+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    program: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    restrict_filenames: bool,
    env: BTreeMap<String, String>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_YTDLP_PROGRAM),
            ffmpeg_location: None,
            restrict_filenames: true,
            env: BTreeMap::new(),
        }
    }
}

impl CommandBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &EngineConfig, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ffmpeg_location: config.ffmpeg_location.clone(),
            restrict_filenames: config.restrict_filenames,
            env: config.env.clone(),
        }
    }

    pub fn ffmpeg_location(mut self, location: Option<PathBuf>) -> Self {
        self.ffmpeg_location = location;
        self
    }

    pub fn restrict_filenames(mut self, restrict: bool) -> Self {
        self.restrict_filenames = restrict;
        self
    }

    pub fn build(&self, options: &DownloadOptions) -> CommandInvocation {
        let mut args: Vec<String> = vec!["--newline".to_string()];
        if self.restrict_filenames {
            args.push("--restrict-filenames".to_string());
        }
        args.push(if options.playlist { "--yes-playlist" } else { "--no-playlist" }.to_string());

        push_mode_args(&mut args, options);
        push_feature_args(&mut args, options);

        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.to_string_lossy().to_string());
        }

        args.push("-o".to_string());
        args.push(output_template(options));

        // Everything after `--` is positional, so a URL starting with `-` stays a URL.
        args.push("--".to_string());
        args.push(options.url.trim().to_string());

        CommandInvocation {
            program: self.program.clone(),
            args,
            working_dir: options.output_dir.clone(),
            env: self.env.clone(),
        }
    }
}

/// Builds with default settings: `yt-dlp` from `PATH`, restricted filenames.
pub fn build(options: &DownloadOptions) -> CommandInvocation {
    CommandBuilder::default().build(options)
}

pub fn output_template(options: &DownloadOptions) -> String {
    options
        .output_dir
        .join(OUTPUT_FILENAME_PATTERN)
        .to_string_lossy()
        .to_string()
}

fn push_mode_args(args: &mut Vec<String>, options: &DownloadOptions) {
    match &options.mode {
        DownloadMode::Video(quality) => {
            let container = options.remux.unwrap_or(DEFAULT_CONTAINER);
            args.push("-f".to_string());
            args.push(video_format_selector(*quality, container));
            args.push("--merge-output-format".to_string());
            args.push(container.as_str().to_string());
            match options.remux {
                Some(remux) => {
                    args.push("--remux-video".to_string());
                    args.push(remux.as_str().to_string());
                }
                None => {
                    args.push("--recode-video".to_string());
                    args.push(DEFAULT_CONTAINER.as_str().to_string());
                }
            }
        }
        // Audio extraction wins over any remux choice.
        DownloadMode::AudioOnly => {
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(options.audio_format.as_str().to_string());
            if let Some(quality) = options.audio_quality {
                args.push("--audio-quality".to_string());
                args.push(quality.level().to_string());
            }
        }
        DownloadMode::CustomFormat(selector) => {
            args.push("-f".to_string());
            args.push(selector.clone());
            if let Some(remux) = options.remux {
                args.push("--remux-video".to_string());
                args.push(remux.as_str().to_string());
            }
        }
    }
}

fn push_feature_args(args: &mut Vec<String>, options: &DownloadOptions) {
    if let Some(subs) = &options.subtitles {
        let langs: Vec<&str> = subs
            .languages
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        args.push("--write-subs".to_string());
        args.push("--embed-subs".to_string());
        args.push("--sub-langs".to_string());
        args.push(if langs.is_empty() {
            "all".to_string()
        } else {
            langs.join(",")
        });
    }
    if options.embed_metadata {
        args.push("--embed-metadata".to_string());
    }
    if options.embed_thumbnail {
        args.push("--embed-thumbnail".to_string());
    }
    if options.embed_chapters {
        args.push("--embed-chapters".to_string());
    }
    if options.split_chapters {
        args.push("--split-chapters".to_string());
    }
    if let Some(categories) = &options.sponsorblock {
        args.push("--sponsorblock-remove".to_string());
        args.push(if categories.is_empty() {
            "all".to_string()
        } else {
            categories
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(",")
        });
    }
}

/// Video+audio selector with fallbacks, constrained to streams the target
/// container can hold without transcoding.
fn video_format_selector(quality: VideoQuality, container: ContainerFormat) -> String {
    let (video_ext, audio_ext) = match container {
        ContainerFormat::Mp4 | ContainerFormat::Mov => ("[ext=mp4]", "[ext=m4a]"),
        ContainerFormat::Webm => ("[ext=webm]", "[ext=webm]"),
        ContainerFormat::Mkv | ContainerFormat::Flv | ContainerFormat::Avi => ("", ""),
    };
    let height = quality
        .max_height()
        .map(|h| format!("[height<={h}]"))
        .unwrap_or_default();

    match quality {
        VideoQuality::BestVideoOnly if video_ext.is_empty() => "bestvideo".to_string(),
        VideoQuality::BestVideoOnly => format!("bestvideo{video_ext}/bestvideo"),
        VideoQuality::Worst if video_ext.is_empty() => "worstvideo+worstaudio/worst".to_string(),
        VideoQuality::Worst => {
            format!("worstvideo{video_ext}+worstaudio{audio_ext}/worst{video_ext}/worst")
        }
        _ if video_ext.is_empty() => format!("bestvideo{height}+bestaudio/best{height}"),
        _ => format!(
            "bestvideo{height}{video_ext}+bestaudio{audio_ext}/best{height}{video_ext}/best{height}"
        ),
    }
}
