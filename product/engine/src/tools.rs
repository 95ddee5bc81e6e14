use crate::config::EngineConfig;
use crate::paths::AppPaths;
use crate::process::command;
use crate::{EngineError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

const YT_DLP_RELEASE_BASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
const YT_DLP_CHECKSUMS_ASSET: &str = "SHA2-256SUMS";
const YT_DLP_MIN_DOWNLOAD_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct FfmpegToolsStatus {
    pub installed: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_version: Option<String>,
}

pub fn ffmpeg_tools_status(paths: &AppPaths) -> FfmpegToolsStatus {
    let ffmpeg_path = paths.ffmpeg_bin_path();
    let installed = ffmpeg_path.exists();
    let ffmpeg_version = tool_version_first_line_with_arg(paths.ffmpeg_cmd(), "-version");

    FfmpegToolsStatus {
        installed,
        ffmpeg_path: ffmpeg_path.to_string_lossy().to_string(),
        ffmpeg_version,
    }
}

pub fn install_ffmpeg_tools(paths: &AppPaths) -> Result<FfmpegToolsStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;

    let installed = paths.ffmpeg_bin_path();
    if !installed.exists() {
        return Err(EngineError::InstallFailed(format!(
            "ffmpeg archive did not contain {}",
            installed.to_string_lossy()
        )));
    }
    probe_version("ffmpeg", &installed, "-version")?;

    Ok(ffmpeg_tools_status(paths))
}

#[derive(Debug, Clone, Serialize)]
pub struct YtDlpToolsStatus {
    pub available: bool,
    pub bundled_installed: bool,
    pub bundled_path: String,
    pub ytdlp_path: String,
    pub ytdlp_version: Option<String>,
}

/// Probes the configured executable, the bundled copy and `PATH`, in that
/// order, and reports the first one that answers `--version`.
pub fn ytdlp_tools_status(config: &EngineConfig, paths: &AppPaths) -> YtDlpToolsStatus {
    let bundled = paths.ytdlp_bin_path();
    let bundled_installed = bundled.exists();

    let mut resolved_path = String::new();
    let mut resolved_version: Option<String> = None;
    let mut available = false;

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(configured) = &config.ytdlp_path {
        candidates.push(configured.clone());
    }
    if bundled_installed {
        candidates.push(bundled.clone());
    }
    candidates.push(PathBuf::from(crate::command::DEFAULT_YTDLP_PROGRAM));

    for candidate in candidates {
        let version = tool_version_first_line_with_arg(&candidate, "--version");
        if version.is_some() {
            available = true;
            resolved_path = candidate.to_string_lossy().to_string();
            resolved_version = version;
            break;
        }
    }

    YtDlpToolsStatus {
        available,
        bundled_installed,
        bundled_path: bundled.to_string_lossy().to_string(),
        ytdlp_path: resolved_path,
        ytdlp_version: resolved_version,
    }
}

/// Executable a job runs. An explicit config path always wins, even when it
/// does not exist, so a bad setting surfaces as a spawn failure.
pub fn resolve_ytdlp_program(config: &EngineConfig, paths: Option<&AppPaths>) -> PathBuf {
    if let Some(configured) = &config.ytdlp_path {
        return configured.clone();
    }
    if let Some(paths) = paths {
        let bundled = paths.ytdlp_bin_path();
        if bundled.exists() {
            return bundled;
        }
    }
    PathBuf::from(crate::command::DEFAULT_YTDLP_PROGRAM)
}

pub fn resolve_ffmpeg_location(config: &EngineConfig, paths: Option<&AppPaths>) -> Option<PathBuf> {
    config
        .ffmpeg_location
        .clone()
        .or_else(|| paths.and_then(AppPaths::bundled_ffmpeg_location))
}

/// Name of the standalone yt-dlp release asset for the running platform.
pub fn ytdlp_release_asset() -> Option<&'static str> {
    if cfg!(windows) {
        Some("yt-dlp.exe")
    } else if cfg!(target_os = "macos") {
        Some("yt-dlp_macos")
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        Some("yt-dlp_linux")
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
        Some("yt-dlp_linux_aarch64")
    } else {
        None
    }
}

/// Downloads the latest yt-dlp release into `<base>/tools/yt-dlp`, verified
/// against the release's published checksum list.
pub fn install_ytdlp_tools(config: &EngineConfig, paths: &AppPaths) -> Result<YtDlpToolsStatus> {
    paths.ensure_dirs()?;

    let asset = ytdlp_release_asset().ok_or_else(|| {
        EngineError::InstallFailed("no prebuilt yt-dlp release for this platform".to_string())
    })?;

    let sums_url = format!("{YT_DLP_RELEASE_BASE_URL}/{YT_DLP_CHECKSUMS_ASSET}");
    let sums = ureq::get(&sums_url)
        .call()
        .map_err(|e| EngineError::InstallFailed(format!("yt-dlp checksum download failed: {e}")))?
        .into_body()
        .read_to_string()
        .map_err(|e| EngineError::InstallFailed(format!("yt-dlp checksum read failed: {e}")))?;
    let expected = checksum_for_asset(&sums, asset).ok_or_else(|| {
        EngineError::InstallFailed(format!("no checksum published for {asset}"))
    })?;

    let destination = paths.ytdlp_bin_path();
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = destination.with_extension("download");

    let resp = ureq::get(&format!("{YT_DLP_RELEASE_BASE_URL}/{asset}"))
        .call()
        .map_err(|e| EngineError::InstallFailed(format!("yt-dlp download failed: {e}")))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        return Err(EngineError::InstallFailed(format!(
            "yt-dlp download failed (status={status})"
        )));
    }

    {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
    }

    let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if downloaded_size < YT_DLP_MIN_DOWNLOAD_BYTES {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(EngineError::InstallFailed(
            "downloaded yt-dlp is unexpectedly small".to_string(),
        ));
    }

    if let Err(err) = verify_sha256(&tmp_path, &expected) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    mark_executable(&tmp_path)?;

    if destination.exists() {
        let _ = std::fs::remove_file(&destination);
    }
    if std::fs::rename(&tmp_path, &destination).is_err() {
        std::fs::copy(&tmp_path, &destination)?;
        let _ = std::fs::remove_file(&tmp_path);
    }

    probe_version("yt-dlp", &destination, "--version")?;

    Ok(ytdlp_tools_status(config, paths))
}

/// Looks up `asset` in a `sha256sum`-style listing (`<hex>  <name>`).
pub fn checksum_for_asset(listing: &str, asset: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == asset && hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| hash.to_ascii_lowercase())
    })
}

pub fn verify_sha256(path: &Path, expected_hex: &str) -> Result<()> {
    let expected = hex::decode(expected_hex.trim()).map_err(|e| {
        EngineError::InstallFailed(format!("invalid sha256 for {}: {e}", path.to_string_lossy()))
    })?;
    let got = sha256_file(path)?;
    if got != expected {
        return Err(EngineError::HashMismatch {
            path: path.to_path_buf(),
            expected: expected_hex.trim().to_ascii_lowercase(),
            actual: hex::encode(got),
        });
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    use sha2::Digest;
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut hasher = sha2::Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Runs `<program> <arg>` and returns the first non-empty stdout line.
/// A failing run is reported with its exit code and stderr.
fn probe_version(tool: &str, program: impl AsRef<std::ffi::OsStr>, arg: &str) -> Result<String> {
    let output = command(program)
        .arg(arg)
        .output()
        .map_err(|e| EngineError::spawn(tool, e))?;
    let first_line = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string);

    match first_line {
        Some(line) if output.status.success() => Ok(line),
        _ => Err(EngineError::ExternalToolFailed {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}

fn tool_version_first_line_with_arg(
    program: impl AsRef<std::ffi::OsStr>,
    arg: &str,
) -> Option<String> {
    let tool = program.as_ref().to_string_lossy().to_string();
    probe_version(&tool, program, arg).ok()
}
