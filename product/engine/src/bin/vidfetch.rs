use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use vidfetch_engine::config::load_engine_config;
use vidfetch_engine::job::{DownloadSession, Job, JobController, JobOutcome};
use vidfetch_engine::options::{
    AudioFormat, AudioQuality, ContainerFormat, DownloadMode, DownloadOptions,
    SponsorBlockCategory, SubtitleOptions, VideoQuality,
};
use vidfetch_engine::paths::AppPaths;
use vidfetch_engine::progress::ProgressEvent;
use vidfetch_engine::tools;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut url: Option<String> = None;
    let mut output_dir: Option<PathBuf> = None;
    let mut quality: Option<VideoQuality> = None;
    let mut custom_format: Option<String> = None;
    let mut audio_only = false;
    let mut audio_format: Option<AudioFormat> = None;
    let mut audio_quality: Option<AudioQuality> = None;
    let mut remux: Option<ContainerFormat> = None;
    let mut subtitles: Option<SubtitleOptions> = None;
    let mut embed_metadata = false;
    let mut embed_thumbnail = false;
    let mut embed_chapters = false;
    let mut split_chapters = false;
    let mut playlist = true;
    let mut sponsorblock: Option<String> = None;
    let mut print_command = false;
    let mut json_events = false;
    let mut tools_status = false;
    let mut install_ffmpeg = false;
    let mut install_ytdlp = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => base_dir = Some(PathBuf::from(value(&args, &mut i, "--base-dir")?)),
            "-o" | "--output" => output_dir = Some(PathBuf::from(value(&args, &mut i, "--output")?)),
            "--quality" => {
                let v = value(&args, &mut i, "--quality")?;
                quality = Some(
                    VideoQuality::from_str(v)
                        .ok_or_else(|| format!("unknown quality: {v} (try --help)"))?,
                );
            }
            "-f" | "--format" => custom_format = Some(value(&args, &mut i, "--format")?.to_string()),
            "-x" | "--audio-only" => audio_only = true,
            "--audio-format" => {
                let v = value(&args, &mut i, "--audio-format")?;
                audio_format = Some(
                    AudioFormat::from_str(v).ok_or_else(|| format!("unknown audio format: {v}"))?,
                );
            }
            "--audio-quality" => {
                let v = value(&args, &mut i, "--audio-quality")?;
                let level: u8 = v
                    .trim()
                    .parse()
                    .map_err(|_| format!("--audio-quality expects 0-10, got {v}"))?;
                audio_quality = Some(AudioQuality::try_from(level)?);
            }
            "--remux" => {
                let v = value(&args, &mut i, "--remux")?;
                remux = Some(
                    ContainerFormat::from_str(v).ok_or_else(|| format!("unknown container: {v}"))?,
                );
            }
            "--subs" => {
                subtitles.get_or_insert_with(SubtitleOptions::default);
            }
            "--sub-langs" => {
                let v = value(&args, &mut i, "--sub-langs")?;
                subtitles.get_or_insert_with(SubtitleOptions::default).languages = v
                    .split(',')
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
            }
            "--embed-metadata" => embed_metadata = true,
            "--embed-thumbnail" => embed_thumbnail = true,
            "--embed-chapters" => embed_chapters = true,
            "--split-chapters" => split_chapters = true,
            "--no-playlist" => playlist = false,
            "--yes-playlist" => playlist = true,
            "--sponsorblock" => sponsorblock = Some("all".to_string()),
            "--sponsorblock-remove" => {
                sponsorblock = Some(value(&args, &mut i, "--sponsorblock-remove")?.to_string())
            }
            "--print-command" => print_command = true,
            "--json" => json_events = true,
            "--tools-status" => tools_status = true,
            "--install-ffmpeg" => install_ffmpeg = true,
            "--install-ytdlp" => install_ytdlp = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown arg: {other} (try --help)"));
            }
            other => {
                if url.is_some() {
                    return Err(format!("unexpected extra argument: {other}"));
                }
                url = Some(other.to_string());
            }
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    let config = load_engine_config(&paths).map_err(|e| e.to_string())?;

    if install_ffmpeg {
        println!("FFmpeg: installing...");
        let status = tools::install_ffmpeg_tools(&paths).map_err(|e| e.to_string())?;
        if !status.installed {
            return Err("FFmpeg install did not result in installed=true".to_string());
        }
        println!("FFmpeg: installed ({})", status.ffmpeg_path);
    }

    if install_ytdlp {
        println!("yt-dlp: installing...");
        let status = tools::install_ytdlp_tools(&config, &paths).map_err(|e| e.to_string())?;
        println!(
            "yt-dlp: installed ({}, {})",
            status.bundled_path,
            status.ytdlp_version.as_deref().unwrap_or("version unknown")
        );
    }

    if tools_status {
        let ytdlp = tools::ytdlp_tools_status(&config, &paths);
        let ffmpeg = tools::ffmpeg_tools_status(&paths);
        let report = serde_json::json!({ "yt_dlp": ytdlp, "ffmpeg": ffmpeg });
        println!(
            "{}",
            serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
        );
    }

    let Some(url) = url else {
        if install_ffmpeg || install_ytdlp || tools_status {
            return Ok(());
        }
        return Err("no URL given (try --help)".to_string());
    };

    let mode = if audio_only {
        DownloadMode::AudioOnly
    } else if let Some(selector) = custom_format {
        DownloadMode::CustomFormat(selector)
    } else {
        DownloadMode::Video(quality.unwrap_or(VideoQuality::Best))
    };

    let output_dir = output_dir.unwrap_or_else(|| paths.default_download_dir());
    let mut options = DownloadOptions::new(url, output_dir);
    options.mode = mode;
    options.remux = remux;
    options.audio_format = audio_format.unwrap_or_default();
    options.audio_quality = audio_quality;
    options.subtitles = subtitles;
    options.embed_metadata = embed_metadata;
    options.embed_thumbnail = embed_thumbnail;
    options.embed_chapters = embed_chapters;
    options.split_chapters = split_chapters;
    options.playlist = playlist;
    options.sponsorblock = sponsorblock
        .as_deref()
        .map(SponsorBlockCategory::parse_list)
        .transpose()
        .map_err(|e| e.to_string())?;

    let controller = JobController::new(config, Some(paths));

    if print_command {
        println!("{}", controller.command_for(&options).display());
        return Ok(());
    }

    if !options.output_dir.exists() {
        std::fs::create_dir_all(&options.output_dir).map_err(|e| e.to_string())?;
    }

    let mut job = Job::new(options);
    let events = job.subscribe();
    let mut session = DownloadSession::new(controller);
    let job_id = session.start(job).map_err(|e| e.to_string())?.id().to_string();

    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    if std::io::stdin().is_terminal() {
        eprintln!("Press Enter to cancel.");
        std::thread::spawn(move || {
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_ok() {
                let _ = cancel_tx.send(());
            }
        });
    }

    loop {
        if cancel_rx.try_recv().is_ok() && session.cancel() {
            eprintln!("\nStopping download...");
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                if json_events {
                    println!("{}", serde_json::to_string(&event).map_err(|e| e.to_string())?);
                } else {
                    print_status(&event);
                }
                if event.is_terminal() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = session
        .wait()
        .ok_or_else(|| format!("job {job_id} vanished"))?;
    if !json_events {
        println!();
        for file in &report.output_files {
            println!("Saved: {}", file.to_string_lossy());
        }
        if let Some(log) = &report.log_path {
            println!("Log: {}", log.to_string_lossy());
        }
    }

    match report.outcome {
        JobOutcome::Completed => Ok(()),
        JobOutcome::Cancelled => Err("download cancelled".to_string()),
        JobOutcome::Failed { message, .. } => Err(message),
    }
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn print_status(event: &ProgressEvent) {
    let mut out = std::io::stdout();
    let _ = match event {
        ProgressEvent::Started => write!(out, "Preparing download..."),
        ProgressEvent::Progress {
            percent,
            speed,
            eta,
        } => write!(
            out,
            "\rDownloading: {percent:5.1}%  Speed: {speed:<12}  ETA: {eta:<8}"
        ),
        ProgressEvent::PostProcessing { stage } => write!(out, "\nPost-processing: {stage}"),
        ProgressEvent::Completed => write!(out, "\nDownload complete"),
        ProgressEvent::Failed { message } => write!(out, "\nError: {message}"),
        ProgressEvent::Cancelled => write!(out, "\nDownload cancelled"),
    };
    let _ = out.flush();
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("VIDFETCH_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("vidfetch"));
            }
        }
    }

    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        let t = data_home.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t).join("vidfetch"));
        }
    }

    std::env::var("HOME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .map(|h| PathBuf::from(h).join(".local").join("share").join("vidfetch"))
}

fn print_help() {
    println!(
        r#"vidfetch

Downloads a video or its audio with yt-dlp and reports progress.

Usage:
  vidfetch [options] <url>
  vidfetch --tools-status
  vidfetch --install-ytdlp --install-ffmpeg

Download options:
  -o, --output <dir>           Output directory (default: ~/Downloads)
  --quality <preset>           best, best_video_only, 1440p, 1080p, 720p, 480p, 360p, worst
  -f, --format <selector>      Raw yt-dlp format selector
  -x, --audio-only             Extract audio only
  --audio-format <fmt>         best, aac, alac, flac, m4a, mp3, opus, vorbis, wav
  --audio-quality <0-10>       VBR level, 0 is best (default 5)
  --remux <container>          mp4, mkv, webm, mov, flv, avi
  --subs                       Download and embed subtitles (all languages)
  --sub-langs <a,b>            Subtitle languages, implies --subs
  --embed-metadata             Embed metadata
  --embed-thumbnail            Embed thumbnail
  --embed-chapters             Embed chapters
  --split-chapters             Split into one file per chapter
  --no-playlist                Download only the referenced video
  --sponsorblock               Remove all SponsorBlock segments
  --sponsorblock-remove <cats> Remove the listed categories (comma separated)

Other:
  --base-dir <path>            Data directory (default: $VIDFETCH_BASE_DIR or platform data dir)
  --print-command              Print the yt-dlp invocation and exit
  --json                       Print progress events as JSON lines
  --tools-status               Report yt-dlp and ffmpeg availability
  --install-ytdlp              Install yt-dlp into <base-dir>/tools/yt-dlp
  --install-ffmpeg             Install ffmpeg into <base-dir>/tools/ffmpeg
"#
    );
}
