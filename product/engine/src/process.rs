//! Child process plumbing for external tools.
//!
//! [`ProcessHandle`] owns one spawned child. Two reader threads split stdout
//! and stderr into lines (on `\n` and on `\r`, which yt-dlp uses for in-place
//! progress updates) and push them into a single channel.

use crate::command::CommandInvocation;
use crate::{EngineError, Result};
use serde::Serialize;
use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TERMINATE_POLL_INTERVAL_MS: u64 = 50;
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// `Command` preconfigured for background tools: no console window on Windows,
/// no inherited stdin.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRecv {
    Line(OutputLine),
    Timeout,
    /// Both streams reached end of file and every line has been received.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitKind::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitKind::Signal(signal);
            }
        }
        ExitKind::Unknown
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitKind::Code(0))
    }

    pub fn describe(&self) -> String {
        match self {
            ExitKind::Code(code) => format!("exit code {code}"),
            ExitKind::Signal(signal) => format!("terminated by signal {signal}"),
            ExitKind::Unknown => "unknown exit status".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    tool: String,
    child: Child,
    lines: Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    exit: Option<ExitKind>,
    terminate_requested: bool,
}

impl ProcessHandle {
    /// Spawns the invocation with piped output. Fails when the executable
    /// cannot be found or started, or when the working directory is unusable.
    pub fn start(invocation: &CommandInvocation) -> Result<Self> {
        let tool = invocation.program.to_string_lossy().to_string();
        if !invocation.working_dir.is_dir() {
            return Err(EngineError::ExternalToolSpawn {
                tool,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "working directory {} does not exist",
                        invocation.working_dir.to_string_lossy()
                    ),
                ),
            });
        }

        let mut cmd = command(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so a terminate reaches ffmpeg children as well.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::spawn(&tool, e))?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, tx));
        }

        Ok(Self {
            tool,
            child,
            lines: rx,
            readers,
            exit: None,
            terminate_requested: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn recv_line(&self, timeout: Duration) -> LineRecv {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => LineRecv::Line(line),
            Err(RecvTimeoutError::Timeout) => LineRecv::Timeout,
            Err(RecvTimeoutError::Disconnected) => LineRecv::Closed,
        }
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitKind>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let status = self.child.try_wait()?;
        self.exit = status.map(ExitKind::from_status);
        Ok(self.exit)
    }

    /// Blocks until the child exits and both reader threads have finished.
    pub fn wait(&mut self) -> Result<ExitKind> {
        let exit = match self.exit {
            Some(exit) => exit,
            None => {
                let exit = ExitKind::from_status(self.child.wait()?);
                self.exit = Some(exit);
                exit
            }
        };
        self.join_readers();
        Ok(exit)
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    /// Asks the child to shut down. Sent at most once; does not wait.
    pub fn request_terminate(&mut self) {
        if self.terminate_requested || self.exit.is_some() {
            return;
        }
        self.terminate_requested = true;
        request_graceful_stop(&self.child);
    }

    /// Forcibly kills the child and everything it started, then reaps it.
    pub fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        self.exit = Some(
            kill_child_process_tree(&mut self.child)
                .map(ExitKind::from_status)
                .unwrap_or(ExitKind::Unknown),
        );
    }

    /// Cooperative shutdown, escalating to a forced kill once `grace` elapses.
    pub fn terminate(&mut self, grace: Duration) -> Result<ExitKind> {
        self.request_terminate();
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.try_wait()?.is_some() {
                return self.wait();
            }
            thread::sleep(Duration::from_millis(TERMINATE_POLL_INTERVAL_MS));
        }
        self.kill();
        self.wait()
    }

    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(ExitKind::from_status(status));
            } else {
                self.kill();
            }
        }
        self.join_readers();
    }
}

fn spawn_reader<R>(mut source: R, stream: OutputStream, tx: Sender<OutputLine>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        let mut pending: Vec<u8> = Vec::new();
        let send = |pending: &mut Vec<u8>| {
            if pending.is_empty() {
                return;
            }
            let text = String::from_utf8_lossy(pending).to_string();
            pending.clear();
            // The receiver may be gone; keep draining so the child never blocks on a full pipe.
            let _ = tx.send(OutputLine { stream, text });
        };

        loop {
            let n = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for &byte in &chunk[..n] {
                if byte == b'\n' || byte == b'\r' {
                    send(&mut pending);
                } else {
                    pending.push(byte);
                }
            }
        }
        send(&mut pending);
    })
}

#[cfg(unix)]
fn request_graceful_stop(child: &Child) {
    signal_process_group(child.id(), "TERM");
}

/// Signals the whole process group led by `pid` through the `sh` builtin,
/// which is present even where a standalone `kill` binary is not.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: &str) {
    let _ = command("sh")
        .arg("-c")
        .arg(format!("kill -{signal} -{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(windows)]
fn request_graceful_stop(child: &Child) {
    let pid = child.id().to_string();
    let _ = command("taskkill")
        .args(["/PID", &pid, "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(any(unix, windows)))]
fn request_graceful_stop(_child: &Child) {}

fn kill_child_process_tree(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    #[cfg(unix)]
    signal_process_group(child.id(), "KILL");

    let _ = child.kill();
    child.wait().ok()
}
