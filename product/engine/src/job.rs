//! Download job orchestration.
//!
//! A [`Job`] is submitted to a [`JobController`], which validates its options,
//! builds the yt-dlp invocation and hands everything to a dedicated worker
//! thread. The worker owns the child process: it spawns it, feeds its output
//! through the progress parser, relays events to the job's observers and
//! settles exactly one terminal outcome. The caller keeps a [`JobHandle`] for
//! cancellation and for collecting the final [`JobReport`].

use crate::command::{CommandBuilder, CommandInvocation};
use crate::config::{load_engine_config, EngineConfig};
use crate::joblog::{self, now_ms, JobLog, LEVEL_DEBUG, LEVEL_ERROR, LEVEL_INFO, LEVEL_WARN};
use crate::options::DownloadOptions;
use crate::paths::AppPaths;
use crate::process::{ExitKind, LineRecv, ProcessHandle};
use crate::progress::{parse_line, ParserState, ProgressEvent};
use crate::tools;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TOOL_NAME: &str = "yt-dlp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(JobState::Idle),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executable could not be started.
    Spawn,
    /// The tool printed an error marker.
    ToolError,
    /// Non-zero exit without a recognizable error line.
    UnexpectedExit,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Spawn => "spawn",
            FailureKind::ToolError => "tool_error",
            FailureKind::UnexpectedExit => "unexpected_exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed { kind: FailureKind, message: String },
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        }
    }

    fn event(&self) -> ProgressEvent {
        match self {
            JobOutcome::Completed => ProgressEvent::Completed,
            JobOutcome::Failed { message, .. } => ProgressEvent::Failed {
                message: message.clone(),
            },
            JobOutcome::Cancelled => ProgressEvent::Cancelled,
        }
    }
}

/// Receives every event of one job, in emission order, on the job's worker thread.
pub trait JobObserver: Send {
    fn on_event(&mut self, job_id: &str, event: &ProgressEvent);
}

impl<F> JobObserver for F
where
    F: FnMut(&str, &ProgressEvent) + Send,
{
    fn on_event(&mut self, job_id: &str, event: &ProgressEvent) {
        self(job_id, event)
    }
}

/// Forwards events into an mpsc channel. A dropped receiver is ignored.
pub struct ChannelObserver {
    tx: Sender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl JobObserver for ChannelObserver {
    fn on_event(&mut self, _job_id: &str, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// A download waiting to be submitted.
pub struct Job {
    id: String,
    options: Arc<DownloadOptions>,
    observers: Vec<Box<dyn JobObserver>>,
}

impl Job {
    pub fn new(options: DownloadOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            options: Arc::new(options),
            observers: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &Arc<DownloadOptions> {
        &self.options
    }

    /// Unsubmitted jobs are always idle.
    pub fn state(&self) -> JobState {
        JobState::Idle
    }

    pub fn add_observer(&mut self, observer: impl JobObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn subscribe(&mut self) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        self.add_observer(ChannelObserver::new(tx));
        rx
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub exit: Option<ExitKind>,
    /// Files announced by yt-dlp that exist once the job is over.
    pub output_files: Vec<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

impl JobReport {
    pub fn state(&self) -> JobState {
        self.outcome.state()
    }

    fn worker_lost(job_id: &str) -> Self {
        let now = now_ms();
        Self {
            job_id: job_id.to_string(),
            outcome: JobOutcome::Failed {
                kind: FailureKind::UnexpectedExit,
                message: "job worker stopped unexpectedly".to_string(),
            },
            exit: None,
            output_files: Vec::new(),
            log_path: None,
            started_at_ms: now,
            finished_at_ms: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobController {
    config: EngineConfig,
    paths: Option<AppPaths>,
}

impl JobController {
    /// Without `paths` no job logs are written and no bundled tools are used.
    pub fn new(config: EngineConfig, paths: Option<AppPaths>) -> Self {
        Self { config, paths }
    }

    pub fn from_paths(paths: AppPaths) -> Result<Self> {
        let config = load_engine_config(&paths)?;
        Ok(Self::new(config, Some(paths)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> Option<&AppPaths> {
        self.paths.as_ref()
    }

    pub fn command_for(&self, options: &DownloadOptions) -> CommandInvocation {
        let program = tools::resolve_ytdlp_program(&self.config, self.paths.as_ref());
        CommandBuilder::from_config(&self.config, program)
            .ffmpeg_location(tools::resolve_ffmpeg_location(
                &self.config,
                self.paths.as_ref(),
            ))
            .build(options)
    }

    /// Validates the job's options and starts its worker. The process itself
    /// is spawned on the worker, so a missing executable is reported as a
    /// `Failed` outcome rather than an error here.
    pub fn submit(&self, job: Job) -> Result<JobHandle> {
        job.options.validate()?;

        let invocation = self.command_for(&job.options);
        let cancel = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(JobState::Running));
        let log = self.paths.as_ref().map(|paths| {
            let _ = joblog::prune_job_logs(paths);
            JobLog::new(paths, &job.id)
        });

        let worker = Worker {
            job_id: job.id.clone(),
            options: job.options,
            invocation,
            observers: job.observers,
            cancel: Arc::clone(&cancel),
            state: Arc::clone(&state),
            log,
            grace: self.config.terminate_grace(),
            poll: self.config.poll_interval(),
            started_relayed: false,
            terminal_relayed: false,
        };

        let short_id: String = job.id.chars().take(8).collect();
        let thread = thread::Builder::new()
            .name(format!("vidfetch-job-{short_id}"))
            .spawn(move || worker.run())?;

        Ok(JobHandle {
            id: job.id,
            cancel,
            state,
            worker: Some(thread),
        })
    }
}

/// Caller's side of a running job. Dropping it cancels the job and waits for
/// the worker to finish.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<JobState>>,
    worker: Option<JoinHandle<JobReport>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests cancellation. Has no effect once the job reached a terminal state.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> JobState {
        *lock_state(&self.state)
    }

    /// True once the worker thread has exited and the process is reaped.
    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| w.is_finished())
            .unwrap_or(true)
    }

    /// Blocks until the worker is done. Call from a background thread in
    /// interactive front-ends.
    pub fn join(mut self) -> JobReport {
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            _ => {
                *lock_state(&self.state) = JobState::Failed;
                JobReport::worker_lost(&self.id)
            }
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if !worker.is_finished() {
                self.cancel.store(true, Ordering::SeqCst);
            }
            let _ = worker.join();
        }
    }
}

fn lock_state(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Front-end session: at most one job runs at a time. A job counts as running
/// until its worker has exited, which is after its process has been reaped,
/// even when its outcome is already settled.
#[derive(Debug)]
pub struct DownloadSession {
    controller: JobController,
    active: Option<JobHandle>,
}

impl DownloadSession {
    pub fn new(controller: JobController) -> Self {
        Self {
            controller,
            active: None,
        }
    }

    pub fn controller(&self) -> &JobController {
        &self.controller
    }

    pub fn is_busy(&self) -> bool {
        self.active
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&mut self, job: Job) -> Result<&JobHandle> {
        if self.is_busy() {
            return Err(EngineError::JobAlreadyRunning);
        }
        // Finished worker; dropping the handle only joins the thread.
        self.active = None;

        let handle = self.controller.submit(job)?;
        Ok(&*self.active.insert(handle))
    }

    /// Returns false when there is nothing left to cancel. Still effective
    /// while a failed job waits for its process to exit.
    pub fn cancel(&self) -> bool {
        match &self.active {
            Some(handle) if !handle.is_finished() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Option<&JobHandle> {
        self.active.as_ref()
    }

    /// Blocks until the active job finishes and returns its report.
    pub fn wait(&mut self) -> Option<JobReport> {
        self.active.take().map(JobHandle::join)
    }
}

struct Worker {
    job_id: String,
    options: Arc<DownloadOptions>,
    invocation: CommandInvocation,
    observers: Vec<Box<dyn JobObserver>>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<JobState>>,
    log: Option<JobLog>,
    grace: Duration,
    poll: Duration,
    started_relayed: bool,
    terminal_relayed: bool,
}

#[derive(Default)]
struct StopTracker {
    cancel_seen: bool,
    kill_deadline: Option<Instant>,
}

impl Worker {
    fn run(mut self) -> JobReport {
        let started_at_ms = now_ms();
        self.note(
            LEVEL_INFO,
            "job_submitted",
            serde_json::json!({
                "url": joblog::redact_url_for_log(&self.options.url),
                "program": self.invocation.program.to_string_lossy(),
                "args": redacted_args(&self.invocation.args),
                "working_dir": self.invocation.working_dir.to_string_lossy(),
            }),
        );

        if self.cancel.load(Ordering::SeqCst) {
            self.note(LEVEL_INFO, "cancel_requested", serde_json::Value::Null);
            return self.finish(
                started_at_ms,
                JobOutcome::Cancelled,
                None,
                &ParserState::default(),
            );
        }

        let mut process = match ProcessHandle::start(&self.invocation) {
            Ok(process) => process,
            Err(err) => {
                let outcome = JobOutcome::Failed {
                    kind: FailureKind::Spawn,
                    message: err.to_string(),
                };
                return self.finish(started_at_ms, outcome, None, &ParserState::default());
            }
        };
        self.note(
            LEVEL_INFO,
            "process_spawned",
            serde_json::json!({ "pid": process.id() }),
        );

        let mut parser = ParserState::default();
        let mut parsed_failure: Option<String> = None;
        let mut stop = StopTracker::default();

        loop {
            self.enforce_stop(&mut process, &mut stop, parsed_failure.is_some());
            match process.recv_line(self.poll) {
                LineRecv::Line(line) => {
                    self.note(
                        LEVEL_DEBUG,
                        "tool_line",
                        serde_json::json!({ "stream": line.stream.as_str(), "text": line.text }),
                    );
                    let (next, event) = parse_line(&line.text, parser);
                    parser = next;
                    if let Some(event) = event {
                        self.on_parsed(event, &mut parsed_failure);
                    }
                }
                LineRecv::Timeout => {}
                LineRecv::Closed => break,
            }
        }

        let exit = loop {
            self.enforce_stop(&mut process, &mut stop, parsed_failure.is_some());
            match process.try_wait() {
                Ok(Some(exit)) => break exit,
                Ok(None) => thread::sleep(self.poll),
                Err(err) => {
                    self.note(
                        LEVEL_WARN,
                        "wait_failed",
                        serde_json::json!({ "error": err.to_string() }),
                    );
                    process.kill();
                    break process.try_wait().ok().flatten().unwrap_or(ExitKind::Unknown);
                }
            }
        };
        let exit = process.wait().unwrap_or(exit);
        self.note(
            LEVEL_INFO,
            "process_exited",
            serde_json::json!({ "exit": exit, "terminate_requested": process.terminate_requested() }),
        );

        let cancelled = stop.cancel_seen || self.cancel.load(Ordering::SeqCst);
        let outcome = match parsed_failure {
            Some(message) => JobOutcome::Failed {
                kind: FailureKind::ToolError,
                message,
            },
            None if cancelled => JobOutcome::Cancelled,
            None if exit.success() => JobOutcome::Completed,
            None => JobOutcome::Failed {
                kind: FailureKind::UnexpectedExit,
                message: format!("{TOOL_NAME} failed with {}", exit.describe()),
            },
        };
        self.finish(started_at_ms, outcome, Some(exit), &parser)
    }

    /// Sends the cooperative stop once a cancel or a parsed failure is seen,
    /// and kills the process when it outlives the grace period.
    fn enforce_stop(&self, process: &mut ProcessHandle, stop: &mut StopTracker, failed: bool) {
        if !stop.cancel_seen && self.cancel.load(Ordering::SeqCst) {
            stop.cancel_seen = true;
            self.note(LEVEL_INFO, "cancel_requested", serde_json::Value::Null);
        }

        if (stop.cancel_seen || failed) && stop.kill_deadline.is_none() {
            process.request_terminate();
            stop.kill_deadline = Some(Instant::now() + self.grace);
        }

        if let Some(deadline) = stop.kill_deadline {
            if Instant::now() >= deadline && matches!(process.try_wait(), Ok(None)) {
                self.note(
                    LEVEL_WARN,
                    "terminate_escalated",
                    serde_json::json!({ "grace_ms": self.grace.as_millis() as u64 }),
                );
                process.kill();
            }
        }
    }

    fn on_parsed(&mut self, event: ProgressEvent, parsed_failure: &mut Option<String>) {
        // After a cancel request the outcome is settled; output is only logged.
        if self.cancel.load(Ordering::SeqCst) || parsed_failure.is_some() {
            return;
        }
        match event {
            ProgressEvent::Failed { message } => {
                *parsed_failure = Some(message.clone());
                *lock_state(&self.state) = JobState::Failed;
                self.relay(ProgressEvent::Failed { message });
            }
            ProgressEvent::Completed | ProgressEvent::Cancelled => {}
            other => self.relay(other),
        }
    }

    fn relay(&mut self, event: ProgressEvent) {
        if self.terminal_relayed {
            return;
        }
        match &event {
            ProgressEvent::Progress { .. } | ProgressEvent::PostProcessing { .. }
                if !self.started_relayed =>
            {
                self.relay(ProgressEvent::Started);
            }
            ProgressEvent::Started if self.started_relayed => return,
            _ => {}
        }
        match &event {
            ProgressEvent::Started => self.started_relayed = true,
            e if e.is_terminal() => self.terminal_relayed = true,
            _ => {}
        }

        let level = match &event {
            ProgressEvent::Failed { .. } => LEVEL_ERROR,
            _ => LEVEL_INFO,
        };
        self.note(
            level,
            event.name(),
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        );
        for observer in &mut self.observers {
            observer.on_event(&self.job_id, &event);
        }
    }

    fn finish(
        mut self,
        started_at_ms: i64,
        outcome: JobOutcome,
        exit: Option<ExitKind>,
        parser: &ParserState,
    ) -> JobReport {
        *lock_state(&self.state) = outcome.state();
        self.relay(outcome.event());

        let output_files = existing_outputs(&self.options, parser);
        let report = JobReport {
            job_id: self.job_id.clone(),
            outcome,
            exit,
            output_files,
            log_path: self.log.as_ref().map(JobLog::path),
            started_at_ms,
            finished_at_ms: now_ms(),
        };
        self.note(
            LEVEL_INFO,
            "job_finished",
            serde_json::to_value(&report).unwrap_or(serde_json::Value::Null),
        );
        report
    }

    /// Best-effort: a failing log never affects the job.
    fn note(&self, level: &str, event: &str, data: serde_json::Value) {
        if let Some(log) = &self.log {
            let _ = log.log(level, event, data);
        }
    }
}

fn existing_outputs(options: &DownloadOptions, parser: &ParserState) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for raw in &parser.destinations {
        let path = PathBuf::from(raw);
        let path = if path.is_absolute() {
            path
        } else {
            options.output_dir.join(path)
        };
        if path.is_file() && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

fn redacted_args(args: &[String]) -> Vec<String> {
    let mut out = args.to_vec();
    if let Some(url) = out.last_mut() {
        *url = joblog::redact_url_for_log(url);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_str() {
        for state in [
            JobState::Idle,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::from_str(state.as_str()), Some(state));
        }
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn new_job_is_idle_and_shares_options() {
        let job = Job::new(DownloadOptions::new("https://example.com/v", "/tmp"));
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.options().url, "https://example.com/v");
        assert!(!job.id().is_empty());
    }

    #[test]
    fn submit_rejects_invalid_options_without_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = JobController::new(EngineConfig::default(), None);
        let mut job = Job::new(DownloadOptions::new("", dir.path()));
        let rx = job.subscribe();

        let err = controller.submit(job).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOptions(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn command_uses_configured_program_and_ffmpeg() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.ytdlp_path = Some(PathBuf::from("/opt/bin/yt-dlp"));
        config.ffmpeg_location = Some(PathBuf::from("/opt/ffmpeg"));
        let controller = JobController::new(config, None);

        let inv = controller.command_for(&DownloadOptions::new("https://example.com/v", dir.path()));
        assert_eq!(inv.program, PathBuf::from("/opt/bin/yt-dlp"));
        assert!(inv.args.windows(2).any(|w| w[0] == "--ffmpeg-location" && w[1] == "/opt/ffmpeg"));
        assert_eq!(inv.working_dir, dir.path());
    }

    #[test]
    fn redacted_args_hide_the_url_only() {
        let args = vec![
            "--newline".to_string(),
            "--".to_string(),
            "https://example.com/watch?v=secret".to_string(),
        ];
        assert_eq!(
            redacted_args(&args),
            vec!["--newline", "--", "https://example.com/..."]
        );
    }

    #[test]
    fn outcome_maps_to_state_and_event() {
        let failed = JobOutcome::Failed {
            kind: FailureKind::UnexpectedExit,
            message: "boom".to_string(),
        };
        assert_eq!(failed.state(), JobState::Failed);
        assert_eq!(
            failed.event(),
            ProgressEvent::Failed {
                message: "boom".to_string()
            }
        );
        assert_eq!(JobOutcome::Cancelled.event(), ProgressEvent::Cancelled);
    }
}
