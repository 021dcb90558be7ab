//! Job abstraction and the subprocess job.
//!
//! The traversal scheduler is polymorphic over anything implementing
//! [`Job`]; the concrete variant here launches an external command in a
//! workspace directory with both output streams routed through
//! [`PrefixWriter`]s. Tests substitute scripted in-memory jobs.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use owo_colors::OwoColorize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::JobError;
use crate::prefix::PrefixWriter;

/// Lifecycle of a job. Transitions are monotonic: once terminal the state
/// is frozen, with the single exception that a cancellation recorded while
/// the child was alive wins over a concurrently-observed exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NeverRan,
    Running,
    Success,
    Failed,
    FailedToStart,
    Interrupted,
}

impl JobState {
    pub fn label(self) -> &'static str {
        match self {
            JobState::NeverRan => "never-ran",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::FailedToStart => "failed-to-start",
            JobState::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::NeverRan | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::NeverRan => write!(f, "{}", self.label().cyan()),
            JobState::Running => write!(f, "{}", self.label()),
            JobState::Success => write!(f, "{}", self.label().green()),
            JobState::Failed | JobState::FailedToStart => write!(f, "{}", self.label().red()),
            JobState::Interrupted => write!(f, "{}", self.label().yellow()),
        }
    }
}

/// A unit of executable work over one workspace.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Execute the work. With `dryrun` set, describe the command and
    /// resolve successfully without side effects.
    async fn run(&self, dryrun: bool) -> Result<(), JobError>;

    /// Record cancellation intent and interrupt the live child, if any.
    /// Idempotent; never demotes a job that already succeeded.
    fn cancel(&self);

    fn state(&self) -> JobState;

    fn report(&self) -> String {
        format!("{}: {}", self.name(), self.state())
    }
}

type BoxedSink = Box<dyn Write + Send>;

/// Subprocess job: runs `<bin> <args>` in `<basedir>/<name>` with output
/// line-prefixed as `[<name>]: `.
pub struct CommandJob {
    name: String,
    dir: PathBuf,
    bin: String,
    args: Vec<String>,
    stdout: Arc<PrefixWriter<BoxedSink>>,
    stderr: Arc<PrefixWriter<BoxedSink>>,
    state: Mutex<JobState>,
    // Live child's pid, which doubles as its process-group id.
    pgid: Mutex<Option<u32>>,
    cancelled: AtomicBool,
}

impl CommandJob {
    pub fn new(
        name: &str,
        basedir: &Path,
        bin: &str,
        args: &[String],
        stdout: BoxedSink,
        stderr: BoxedSink,
    ) -> Self {
        let prefix = format!("[{}]: ", name);
        Self {
            name: name.to_string(),
            dir: basedir.join(name),
            bin: bin.to_string(),
            args: args.to_vec(),
            stdout: Arc::new(PrefixWriter::new(stdout, &prefix)),
            stderr: Arc::new(PrefixWriter::new(stderr, &prefix)),
            state: Mutex::new(JobState::NeverRan),
            pgid: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn describe(&self) -> String {
        format!("{} {} (in {})", self.bin, self.args.join(" "), self.dir.display())
    }

    /// Everything the child wrote to stdout, prefixes excluded.
    pub fn stdout_transcript(&self) -> Vec<u8> {
        self.stdout.transcript()
    }

    /// Record the terminal state, honouring the tie-break: a recorded
    /// cancellation wins over any exit observed afterwards, except a spawn
    /// failure, which never produced a child to interrupt.
    fn finish(&self, outcome: JobState) -> JobState {
        let mut state = self.state.lock().unwrap();
        if self.cancelled.load(Ordering::SeqCst) && outcome != JobState::FailedToStart {
            *state = JobState::Interrupted;
        } else if *state != JobState::Interrupted {
            *state = outcome;
        }
        *state
    }

    fn interrupted_err(&self) -> JobError {
        JobError::Interrupted {
            name: self.name.clone(),
        }
    }
}

#[async_trait]
impl Job for CommandJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, dryrun: bool) -> Result<(), JobError> {
        let description = self.describe();
        if dryrun {
            self.stdout
                .write_unprefixed(format!("{}\n", description).as_bytes())
                .map_err(|err| JobError::Run {
                    command: description.clone(),
                    reason: err.to_string(),
                })?;
            self.finish(JobState::Success);
            return Ok(());
        }
        if self.cancelled.load(Ordering::SeqCst) {
            self.finish(JobState::Interrupted);
            return Err(self.interrupted_err());
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state == JobState::NeverRan {
                *state = JobState::Running;
            }
        }

        let mut command = Command::new(&self.bin);
        command
            .args(&self.args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        configure_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.finish(JobState::FailedToStart);
                return Err(JobError::Spawn {
                    command: description,
                    source,
                });
            }
        };
        let pid = child.id();
        *self.pgid.lock().unwrap() = pid;
        tracing::debug!(job = %self.name, ?pid, "spawned");
        // A cancellation that raced the spawn saw no pid to signal; deliver
        // the interrupt ourselves now that the group exists.
        if self.cancelled.load(Ordering::SeqCst) {
            if let Some(pid) = pid {
                interrupt(pid);
            }
        }

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Arc::clone(&self.stdout))));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Arc::clone(&self.stderr))));
        }

        let status = child.wait().await;
        *self.pgid.lock().unwrap() = None;
        for handle in pumps {
            let _ = handle.await;
        }

        match status {
            Ok(status) if status.success() => match self.finish(JobState::Success) {
                JobState::Interrupted => Err(self.interrupted_err()),
                _ => Ok(()),
            },
            Ok(status) => match self.finish(JobState::Failed) {
                JobState::Interrupted => Err(self.interrupted_err()),
                _ => {
                    let reason = match status.code() {
                        Some(code) => format!("exit code {}", code),
                        None => "terminated by signal".to_string(),
                    };
                    Err(JobError::Run {
                        command: description,
                        reason,
                    })
                }
            },
            Err(err) => match self.finish(JobState::Failed) {
                JobState::Interrupted => Err(self.interrupted_err()),
                _ => Err(JobError::Run {
                    command: description,
                    reason: err.to_string(),
                }),
            },
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, JobState::NeverRan | JobState::Running) {
                *state = JobState::Interrupted;
            }
        }
        if let Some(pgid) = *self.pgid.lock().unwrap() {
            tracing::debug!(job = %self.name, pgid, "interrupting process group");
            interrupt(pgid);
        }
    }

    fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }
}

/// Pump raw child output into a prefixing writer until EOF, then flush any
/// dangling partial line.
async fn pump<R>(mut reader: R, writer: Arc<PrefixWriter<BoxedSink>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_chunk(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = writer.flush_partial();
}

fn configure_process_group(command: &mut Command) {
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGINT);
        let _ = libc::kill(pid, libc::SIGINT);
    }
}

#[cfg(all(not(unix), windows))]
fn interrupt(pid: u32) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // Windows has no SIGINT; CTRL_BREAK is the closest console signal we
    // can deliver to a process group.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn interrupt(_pid: u32) {}
