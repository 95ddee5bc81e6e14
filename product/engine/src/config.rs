use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit yt-dlp executable. When unset the bundled copy and then `PATH` are tried.
    pub ytdlp_path: Option<PathBuf>,
    /// Passed to yt-dlp as `--ffmpeg-location` (file or directory).
    pub ffmpeg_location: Option<PathBuf>,
    /// How long a cooperative shutdown may take before the process is killed.
    pub terminate_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub restrict_filenames: bool,
    /// Extra environment for the child; the parent environment is inherited underneath.
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            ffmpeg_location: None,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            restrict_filenames: true,
            env: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let path = paths.engine_config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidOptions(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    let path = paths.engine_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
