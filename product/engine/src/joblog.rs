//! Per-job JSONL diagnostics under `<base>/logs/jobs/<job_id>.jsonl`.

use crate::paths::AppPaths;
use crate::Result;
use regex::Regex;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

pub const LEVEL_DEBUG: &str = "debug";
pub const LEVEL_INFO: &str = "info";
pub const LEVEL_WARN: &str = "warn";
pub const LEVEL_ERROR: &str = "error";

const JOB_LOG_ROTATE_BYTES: u64 = 8 * 1024 * 1024;
const JOB_LOG_MAX_BACKUPS: usize = 3;
const JOB_LOG_MAX_AGE_DAYS: u64 = 30;
const JOB_LOG_TOTAL_CAP_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLogRetentionPolicy {
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

impl Default for JobLogRetentionPolicy {
    fn default() -> Self {
        Self {
            rotate_bytes: JOB_LOG_ROTATE_BYTES,
            max_backups: JOB_LOG_MAX_BACKUPS,
            max_age_days: JOB_LOG_MAX_AGE_DAYS,
            total_cap_bytes: JOB_LOG_TOTAL_CAP_BYTES,
        }
    }
}

/// Appends structured lines to one job's log file.
#[derive(Debug, Clone)]
pub struct JobLog {
    dir: PathBuf,
    job_id: String,
    policy: JobLogRetentionPolicy,
}

impl JobLog {
    pub fn new(paths: &AppPaths, job_id: impl Into<String>) -> Self {
        Self::with_policy(paths, job_id, JobLogRetentionPolicy::default())
    }

    pub fn with_policy(
        paths: &AppPaths,
        job_id: impl Into<String>,
        policy: JobLogRetentionPolicy,
    ) -> Self {
        Self {
            dir: paths.job_logs_dir(),
            job_id: job_id.into(),
            policy,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.job_id))
    }

    /// Every string inside `data` has its URLs redacted before it is written.
    pub fn log(&self, level: &str, event: &str, mut data: serde_json::Value) -> Result<()> {
        redact_json_strings(&mut data);
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "job_id": self.job_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        let path = self.path();
        std::fs::create_dir_all(&self.dir)?;
        rotate_job_log_if_needed(&path, &self.policy)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

fn rotate_job_log_if_needed(path: &Path, policy: &JobLogRetentionPolicy) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };

    if len < policy.rotate_bytes {
        return Ok(());
    }

    rotate_file_backups(path, policy.max_backups)?;
    Ok(())
}

/// Shifts `<log>.1 .. <log>.{max-1}` up by one and moves the live log to `.1`.
/// The oldest backup falls off the end.
fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        return match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }

    let oldest = backup_path(path, max_backups);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..max_backups).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            std::fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    if path.exists() {
        std::fs::rename(path, backup_path(path, 1))?;
    }
    Ok(())
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    path.with_file_name(name)
}

pub fn prune_job_logs(paths: &AppPaths) -> Result<usize> {
    prune_job_logs_with(paths, &JobLogRetentionPolicy::default())
}

/// Drops logs older than the age limit, then the oldest remaining files until
/// the directory fits the total cap. Returns how many files were removed.
pub fn prune_job_logs_with(paths: &AppPaths, policy: &JobLogRetentionPolicy) -> Result<usize> {
    let dir = paths.job_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let cutoff = now
        .checked_sub(Duration::from_secs(policy.max_age_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let size = meta.len();

        if modified < cutoff {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            continue;
        }

        candidates.push((path, modified, size));
    }

    candidates.sort_by_key(|(_, modified, _)| *modified);
    let mut total: u64 = candidates.iter().map(|(_, _, size)| *size).sum();
    for (path, _modified, size) in candidates {
        if total <= policy.total_cap_bytes {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
        total = total.saturating_sub(size);
    }

    Ok(removed)
}

/// Reduces a URL to scheme and host for log output.
pub fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value.trim()) {
        Ok(uri) => {
            let scheme = uri.scheme();
            let authority = uri.host_str().unwrap_or("unknown-host");
            format!("{scheme}://{authority}/...")
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}

/// Replaces every http(s) URL inside free text with its redacted form.
pub fn redact_free_text(value: &str) -> String {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let url_re = URL_RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap());
    url_re
        .replace_all(value, |caps: &regex::Captures<'_>| redact_url_for_log(&caps[0]))
        .into_owned()
}

fn redact_json_strings(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(text) => {
            if text.contains("://") {
                *text = redact_free_text(text);
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json_strings),
        serde_json::Value::Object(map) => map.values_mut().for_each(redact_json_strings),
        _ => {}
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    #[test]
    fn log_appends_jsonl_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = JobLog::new(&paths, "job_a");

        log.log(LEVEL_INFO, "started", serde_json::json!({ "pid": 42 }))
            .expect("log 1");
        log.log(LEVEL_DEBUG, "line", serde_json::json!({ "text": "[info] x" }))
            .expect("log 2");

        let text = std::fs::read_to_string(paths.job_log_path("job_a")).expect("read");
        let rows: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["job_id"], "job_a");
        assert_eq!(rows[0]["level"], "info");
        assert_eq!(rows[0]["event"], "started");
        assert_eq!(rows[0]["data"]["pid"], 42);
        assert_eq!(rows[1]["data"]["text"], "[info] x");
        assert!(rows[1]["ts_ms"].as_i64().expect("ts") > 0);
    }

    #[test]
    fn log_rotates_when_over_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let policy = JobLogRetentionPolicy {
            rotate_bytes: 64,
            max_backups: 2,
            ..JobLogRetentionPolicy::default()
        };
        let log = JobLog::with_policy(&paths, "job_r", policy);
        for i in 0..6 {
            log.log(LEVEL_DEBUG, "line", serde_json::json!({ "i": i }))
                .expect("log");
        }

        let main = log.path();
        assert!(main.exists());
        assert!(backup_path(&main, 1).exists());
        assert!(backup_path(&main, 2).exists());
        assert!(!backup_path(&main, 3).exists());
    }

    #[test]
    fn backups_shift_and_oldest_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("job.jsonl");
        let read = |n: usize| std::fs::read_to_string(backup_path(&log, n)).expect("backup");

        std::fs::write(&log, "live").expect("write live");
        std::fs::write(backup_path(&log, 1), "older").expect("write .1");
        std::fs::write(backup_path(&log, 2), "oldest").expect("write .2");

        rotate_file_backups(&log, 2).expect("rotate");

        assert!(!log.exists());
        assert_eq!(read(1), "live");
        assert_eq!(read(2), "older");
        assert!(!backup_path(&log, 3).exists());
        assert_eq!(backup_path(&log, 2).file_name().expect("name"), "job.jsonl.2");
    }

    #[test]
    fn prune_job_logs_removes_old_files_by_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        let old_path = paths.job_log_path("old");
        let recent_path = paths.job_log_path("recent");
        std::fs::write(&old_path, "{}\n").expect("write old");
        std::fs::write(&recent_path, "{}\n").expect("write recent");

        let now = SystemTime::now();
        let forty_days = Duration::from_secs(40 * 24 * 60 * 60);
        let old_time = now.checked_sub(forty_days).expect("checked_sub");
        set_file_mtime(&old_path, FileTime::from_system_time(old_time)).expect("set mtime");

        assert_eq!(prune_job_logs(&paths).expect("prune"), 1);
        assert!(!old_path.exists(), "old log should be removed");
        assert!(recent_path.exists(), "recent log should be kept");
    }

    #[test]
    fn prune_job_logs_enforces_total_cap_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        let now = SystemTime::now();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let path = paths.job_log_path(name);
            std::fs::write(&path, vec![b'x'; 100]).expect("write");
            let age = Duration::from_secs(60 * (3 - i as u64));
            set_file_mtime(&path, FileTime::from_system_time(now - age)).expect("mtime");
        }

        let policy = JobLogRetentionPolicy {
            total_cap_bytes: 150,
            ..JobLogRetentionPolicy::default()
        };
        assert_eq!(prune_job_logs_with(&paths, &policy).expect("prune"), 2);
        assert!(!paths.job_log_path("a").exists());
        assert!(!paths.job_log_path("b").exists());
        assert!(paths.job_log_path("c").exists());
    }

    #[test]
    fn redact_url_keeps_scheme_and_host_only() {
        assert_eq!(
            redact_url_for_log("https://www.youtube.com/watch?v=abc&token=secret"),
            "https://www.youtube.com/..."
        );
        assert_eq!(redact_url_for_log("not a url"), "[invalid-url]");
    }

    #[test]
    fn free_text_urls_are_redacted_in_place() {
        assert_eq!(
            redact_free_text(
                "[generic] Extracting URL: https://user:pw@example.com/v?token=xyz done"
            ),
            "[generic] Extracting URL: https://example.com/... done"
        );
        assert_eq!(
            redact_free_text(r#"Merging formats into "https://cdn.example.com/a?sig=1""#),
            r#"Merging formats into "https://cdn.example.com/...""#
        );
        assert_eq!(redact_free_text("no links here"), "no links here");
    }

    #[test]
    fn logged_strings_never_carry_full_urls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = JobLog::new(&paths, "job_u");

        log.log(
            LEVEL_ERROR,
            "failed",
            serde_json::json!({
                "message": "ERROR: Unable to download https://example.com/watch?v=abc&token=xyz",
                "nested": [{ "text": "see http://example.org/private/path" }],
            }),
        )
        .expect("log");

        let text = std::fs::read_to_string(log.path()).expect("read");
        assert!(!text.contains("token=xyz"), "{text}");
        assert!(!text.contains("private/path"), "{text}");
        assert!(text.contains("https://example.com/..."), "{text}");
    }
}
