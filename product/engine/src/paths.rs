use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn job_log_path(&self, job_id: &str) -> PathBuf {
        self.job_logs_dir().join(format!("{job_id}.jsonl"))
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ytdlp_dir(&self) -> PathBuf {
        self.tools_dir().join("yt-dlp")
    }

    pub fn ytdlp_bin_path(&self) -> PathBuf {
        let mut path = self.ytdlp_dir().join("yt-dlp");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffmpeg");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// Bundled ffmpeg when installed, otherwise whatever `ffmpeg` resolves to on `PATH`.
    pub fn ffmpeg_cmd(&self) -> PathBuf {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffmpeg")
        }
    }

    /// Directory handed to yt-dlp as `--ffmpeg-location` when a bundled copy exists.
    pub fn bundled_ffmpeg_location(&self) -> Option<PathBuf> {
        if self.ffmpeg_bin_path().exists() {
            Some(self.ffmpeg_dir())
        } else {
            None
        }
    }

    pub fn default_download_dir(&self) -> PathBuf {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            let home = PathBuf::from(home);
            if home.is_dir() {
                return home.join("Downloads");
            }
        }
        self.base_dir.join("downloads")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        std::fs::create_dir_all(self.ytdlp_dir())?;
        std::fs::create_dir_all(self.ffmpeg_dir())?;
        Ok(())
    }
}
