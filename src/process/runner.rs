//! C2 — Process Runner.
//!
//! Executes ffmpeg/ffprobe under the global ffmpeg concurrency gate, with
//! per-invocation timeouts and cooperative cancellation that terminates the
//! whole process group (spec §4.2, §9 "Subprocess cancellation").

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::process::progress::{parse_progress_line, ProgressSample, StallWatchdog, WatchdogState};
use crate::process::semaphore::DynamicSemaphore;
use crate::sync_ext::MutexExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Invoked once per `-progress` block (i.e. on each `progress=continue`/
/// `progress=end` line), from the stderr reader thread.
pub type ProgressCallback = Arc<dyn Fn(ProgressSample) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Clone)]
pub struct ProcessRunner {
    ffmpeg_gate: DynamicSemaphore,
    default_timeout: Duration,
    /// job_id -> live child pids, so an external watcher (the orphan reaper,
    /// or a second cancellation path) can terminate a job's whole subprocess
    /// set even if it isn't the thread blocked inside `run`.
    live: Arc<Mutex<HashMap<String, Vec<u32>>>>,
}

impl ProcessRunner {
    pub fn new(ffmpeg_concurrency: usize, default_timeout: Duration) -> Self {
        Self {
            ffmpeg_gate: DynamicSemaphore::new(ffmpeg_concurrency),
            default_timeout,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_ffmpeg_concurrency(&self, n: usize) {
        self.ffmpeg_gate.set_capacity(n);
    }

    pub fn ffmpeg_concurrency(&self) -> usize {
        self.ffmpeg_gate.capacity()
    }

    /// Kill every process tracked against `job_id` (used by the orphan
    /// reaper and by bulk cancel paths that fire before a worker thread's
    /// own polling loop has had a chance to notice).
    pub fn kill_job_processes(&self, job_id: &str) {
        let pids = self
            .live
            .lock_unpoisoned()
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        for pid in pids {
            terminate_process_group(pid, Duration::from_millis(0));
        }
    }

    pub fn has_live_processes(&self, job_id: &str) -> bool {
        self.live
            .lock_unpoisoned()
            .get(job_id)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    fn register(&self, job_id: &str, pid: u32) {
        self.live
            .lock_unpoisoned()
            .entry(job_id.to_string())
            .or_default()
            .push(pid);
    }

    fn unregister(&self, job_id: &str, pid: u32) {
        if let Some(pids) = self.live.lock_unpoisoned().get_mut(job_id) {
            pids.retain(|p| *p != pid);
        }
    }

    /// Run `argv[0]` with the rest as arguments. Commands whose executable
    /// basename is `ffmpeg` acquire the global gate first; `ffprobe` and
    /// everything else bypasses it (spec §4.2).
    pub fn run(
        &self,
        job_id: &str,
        argv: &[String],
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let Some((exe, args)) = argv.split_first() else {
            return Err(Error::InvalidArgument("empty command".to_string()));
        };

        let is_ffmpeg = Path::new(exe)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("ffmpeg"))
            .unwrap_or(false);

        let _permit = if is_ffmpeg {
            match self.ffmpeg_gate.acquire_cancelable(cancel) {
                Some(p) => Some(p),
                None => return Err(Error::Canceled),
            }
        } else {
            None
        };

        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let mut cmd = Command::new(exe);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        new_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Other(anyhow::anyhow!("failed to spawn {exe}: {e}"))
        })?;
        #[cfg(windows)]
        win_job::assign(&child);
        let pid = child.id();
        self.register(job_id, pid);

        let stdout_handle = take_stdout_reader(&mut child);
        let stderr_handle = take_stderr_reader(&mut child);

        let deadline_timeout = timeout.unwrap_or(self.default_timeout);
        let result = self.wait_with_cancellation(&mut child, cancel, deadline_timeout);

        self.unregister(job_id, pid);

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        match result {
            WaitOutcome::Exited(status) => {
                let code = status.code();
                if code == Some(0) {
                    Ok(CommandOutput { exit_code: code, stdout, stderr })
                } else {
                    Err(Error::NonzeroExit {
                        code,
                        stderr: String::from_utf8_lossy(&stderr).to_string(),
                    })
                }
            }
            WaitOutcome::TimedOut => Err(Error::Timeout(deadline_timeout)),
            WaitOutcome::Stalled(idle) => Err(Error::Timeout(idle)),
            WaitOutcome::Canceled => Err(Error::Canceled),
        }
    }

    /// Like [`run`](Self::run), but parses `-progress pipe:2` key=value
    /// blocks off stderr as they arrive and applies a stall watchdog on top
    /// of the ordinary timeout (spec §4.4.3 "stall watchdog"): no progress
    /// block for `stall_warn` is informational, `stall_kill` terminates the
    /// process group early with [`Error::Timeout`]. Callers that don't care
    /// about live progress should keep using `run`; this variant costs an
    /// extra line-buffered parse pass over stderr.
    #[allow(clippy::too_many_arguments)]
    pub fn run_with_progress(
        &self,
        job_id: &str,
        argv: &[String],
        cancel: &CancelToken,
        timeout: Option<Duration>,
        stall_warn: Duration,
        stall_kill: Duration,
        on_progress: ProgressCallback,
    ) -> Result<CommandOutput> {
        let Some((exe, args)) = argv.split_first() else {
            return Err(Error::InvalidArgument("empty command".to_string()));
        };

        let is_ffmpeg = Path::new(exe)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("ffmpeg"))
            .unwrap_or(false);

        let _permit = if is_ffmpeg {
            match self.ffmpeg_gate.acquire_cancelable(cancel) {
                Some(p) => Some(p),
                None => return Err(Error::Canceled),
            }
        } else {
            None
        };

        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let mut cmd = Command::new(exe);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        new_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to spawn {exe}: {e}")))?;
        #[cfg(windows)]
        win_job::assign(&child);
        let pid = child.id();
        self.register(job_id, pid);

        let watchdog = Arc::new(Mutex::new(StallWatchdog::new(stall_warn, stall_kill)));
        let stdout_handle = take_stdout_reader(&mut child);
        let stderr_handle = take_progress_stderr_reader(&mut child, watchdog.clone(), on_progress);

        let deadline_timeout = timeout.unwrap_or(self.default_timeout);
        let result = self.wait_with_watchdog(&mut child, cancel, deadline_timeout, &watchdog, stall_warn, stall_kill);

        self.unregister(job_id, pid);

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        match result {
            WaitOutcome::Exited(status) => {
                let code = status.code();
                if code == Some(0) {
                    Ok(CommandOutput { exit_code: code, stdout, stderr })
                } else {
                    Err(Error::NonzeroExit {
                        code,
                        stderr: String::from_utf8_lossy(&stderr).to_string(),
                    })
                }
            }
            WaitOutcome::TimedOut => Err(Error::Timeout(deadline_timeout)),
            WaitOutcome::Stalled(idle) => Err(Error::Timeout(idle)),
            WaitOutcome::Canceled => Err(Error::Canceled),
        }
    }

    fn wait_with_cancellation(
        &self,
        child: &mut Child,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> WaitOutcome {
        let start = Instant::now();
        let enforce_timeout = timeout > Duration::ZERO;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return WaitOutcome::Exited(status),
                Ok(None) => {}
                Err(_) => return WaitOutcome::Exited(std::process::ExitStatus::default()),
            }

            if cancel.is_canceled() {
                terminate_process_group(child.id(), TERM_GRACE_PERIOD);
                let _ = child.wait();
                return WaitOutcome::Canceled;
            }

            if enforce_timeout && start.elapsed() >= timeout {
                terminate_process_group(child.id(), TERM_GRACE_PERIOD);
                let _ = child.wait();
                return WaitOutcome::TimedOut;
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn wait_with_watchdog(
        &self,
        child: &mut Child,
        cancel: &CancelToken,
        timeout: Duration,
        watchdog: &Arc<Mutex<StallWatchdog>>,
        stall_warn: Duration,
        stall_kill: Duration,
    ) -> WaitOutcome {
        let start = Instant::now();
        let enforce_timeout = timeout > Duration::ZERO;
        // 0 disables the corresponding threshold (spec §4.2's convention);
        // StallWatchdog itself has no opinion on zero, so callers that want
        // it disabled never poll that half of it.
        let check_kill = stall_kill > Duration::ZERO;
        let check_warn = stall_warn > Duration::ZERO;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return WaitOutcome::Exited(status),
                Ok(None) => {}
                Err(_) => return WaitOutcome::Exited(std::process::ExitStatus::default()),
            }

            if cancel.is_canceled() {
                terminate_process_group(child.id(), TERM_GRACE_PERIOD);
                let _ = child.wait();
                return WaitOutcome::Canceled;
            }

            if enforce_timeout && start.elapsed() >= timeout {
                terminate_process_group(child.id(), TERM_GRACE_PERIOD);
                let _ = child.wait();
                return WaitOutcome::TimedOut;
            }

            if check_kill || check_warn {
                let mut wd = watchdog.lock_unpoisoned();
                let idle = wd.idle();
                match wd.poll() {
                    WatchdogState::Kill if check_kill => {
                        drop(wd);
                        terminate_process_group(child.id(), TERM_GRACE_PERIOD);
                        let _ = child.wait();
                        return WaitOutcome::Stalled(idle);
                    }
                    WatchdogState::Warn if check_warn => {
                        tracing::warn!(idle_secs = idle.as_secs(), "ffmpeg progress stalled");
                    }
                    _ => {}
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Stalled(Duration),
    Canceled,
}

fn take_stdout_reader(child: &mut Child) -> std::thread::JoinHandle<Vec<u8>> {
    let mut stdout = child.stdout.take();
    std::thread::spawn(move || read_all(&mut stdout))
}

fn take_stderr_reader(child: &mut Child) -> std::thread::JoinHandle<Vec<u8>> {
    let mut stderr = child.stderr.take();
    std::thread::spawn(move || read_all(&mut stderr))
}

/// Reads stderr line by line, accumulating raw bytes for error reporting
/// while also feeding each line into a [`ProgressSample`] accumulator;
/// `watchdog` is reset and `on_progress` fired at each
/// `progress=continue`/`progress=end` boundary.
fn take_progress_stderr_reader(
    child: &mut Child,
    watchdog: Arc<Mutex<StallWatchdog>>,
    on_progress: ProgressCallback,
) -> std::thread::JoinHandle<Vec<u8>> {
    let stderr = child.stderr.take();
    std::thread::spawn(move || {
        let Some(stderr) = stderr else { return Vec::new() };
        let mut raw = Vec::new();
        let mut acc = ProgressSample::default();
        let reader = std::io::BufReader::new(stderr);
        for line in std::io::BufRead::lines(reader) {
            let Ok(line) = line else { break };
            raw.extend_from_slice(line.as_bytes());
            raw.push(b'\n');
            parse_progress_line(&line, &mut acc);
            if line.starts_with("progress=") {
                watchdog.lock_unpoisoned().mark_progress();
                on_progress(acc);
                acc = ProgressSample::default();
            }
        }
        raw
    })
}

fn read_all(stream: &mut Option<impl Read>) -> Vec<u8> {
    let Some(stream) = stream else { return Vec::new() };
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    buf
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // pgid = pid of this child; SIGTERM/SIGKILL to -pgid reaches every
    // filter/helper process ffmpeg forks, not just the direct child.
    cmd.process_group(0);
}

#[cfg(windows)]
fn new_process_group(_cmd: &mut Command) {
    // No `setsid`-equivalent flag on `Command` itself; grouping is done via
    // a Job Object assigned to the child right after spawn (see `win_job`),
    // which reaches every helper process ffmpeg forks the same way a Unix
    // process group does.
}

#[cfg(not(any(unix, windows)))]
fn new_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn terminate_process_group(pid: u32, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    if grace > Duration::ZERO {
        std::thread::sleep(grace);
    }
    let _ = killpg(pgid, Signal::SIGKILL);
}

#[cfg(windows)]
fn terminate_process_group(pid: u32, grace: Duration) {
    // Windows has no graceful-signal equivalent to SIGTERM for an arbitrary
    // process tree, so the grace period is honored by delaying the only
    // termination primitive available (`TerminateJobObject`) rather than by
    // escalating through two distinct signals as the Unix path does.
    if grace > Duration::ZERO {
        std::thread::sleep(grace);
    }
    win_job::terminate(pid);
}

#[cfg(not(any(unix, windows)))]
fn terminate_process_group(pid: u32, _grace: Duration) {
    let _ = pid;
}

/// Windows process-group discipline via Job Objects (spec §9 "On platforms
/// without process groups (Windows), use job objects"). A job created with
/// `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE` takes every assigned process down
/// when the job handle closes or `TerminateJobObject` is called, which is
/// the closest analogue to `killpg` for a tree of ffmpeg filter helpers.
#[cfg(windows)]
mod win_job {
    use std::collections::HashMap;
    use std::os::windows::io::AsRawHandle;
    use std::process::Child;
    use std::sync::Mutex;

    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    static JOBS: Mutex<Option<HashMap<u32, isize>>> = Mutex::new(None);

    /// Creates a job object for `child`, configures kill-on-close, and
    /// assigns the child to it. Best-effort: if job creation or assignment
    /// fails (e.g. the child is already in another job under older Windows
    /// versions), the child is still tracked as a plain process and
    /// `terminate` below falls back to doing nothing for it.
    pub fn assign(child: &Child) {
        unsafe {
            let Ok(job) = CreateJobObjectW(None, None) else { return };
            let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let set_ok = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const _,
                std::mem::size_of_val(&info) as u32,
            )
            .is_ok();

            let handle = HANDLE(child.as_raw_handle() as isize);
            if set_ok && AssignProcessToJobObject(job, handle).is_ok() {
                let mut jobs = JOBS.lock().unwrap_or_else(|p| p.into_inner());
                jobs.get_or_insert_with(HashMap::new).insert(child.id(), job.0 as isize);
            } else {
                let _ = CloseHandle(job);
            }
        }
    }

    /// Terminates every process in `pid`'s job object, if one was assigned.
    pub fn terminate(pid: u32) {
        let raw = {
            let mut jobs = JOBS.lock().unwrap_or_else(|p| p.into_inner());
            jobs.as_mut().and_then(|m| m.remove(&pid))
        };
        if let Some(raw) = raw {
            unsafe {
                let handle = HANDLE(raw);
                let _ = TerminateJobObject(handle, 1);
                let _ = CloseHandle(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_invalid_argument() {
        let runner = ProcessRunner::new(2, Duration::from_secs(5));
        let cancel = CancelToken::new();
        let err = runner.run("job1", &[], &cancel, None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn runs_a_trivial_command_successfully() {
        let runner = ProcessRunner::new(2, Duration::from_secs(5));
        let cancel = CancelToken::new();
        let argv = vec!["true".to_string()];
        #[cfg(not(unix))]
        let argv = vec!["cmd".to_string(), "/c".to_string(), "exit".to_string(), "0".to_string()];
        let out = runner.run("job1", &argv, &cancel, None).unwrap();
        assert!(out.success());
    }

    #[test]
    fn canceled_before_spawn_short_circuits() {
        let runner = ProcessRunner::new(2, Duration::from_secs(5));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = runner
            .run("job1", &["ffmpeg".to_string(), "-version".to_string()], &cancel, None)
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }

    #[test]
    #[cfg(unix)]
    fn run_with_progress_invokes_callback_per_block() {
        let runner = ProcessRunner::new(2, Duration::from_secs(5));
        let cancel = CancelToken::new();
        let script = "echo out_time_ms=1000000 1>&2; echo progress=continue 1>&2; \
                      echo out_time_ms=2000000 1>&2; echo progress=end 1>&2";
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let samples = Arc::new(Mutex::new(Vec::new()));
        let samples2 = samples.clone();
        let on_progress: ProgressCallback = Arc::new(move |s| samples2.lock_unpoisoned().push(s));
        let out = runner
            .run_with_progress(
                "job1",
                &argv,
                &cancel,
                None,
                Duration::from_secs(60),
                Duration::from_secs(120),
                on_progress,
            )
            .unwrap();
        assert!(out.success());
        let collected = samples.lock_unpoisoned();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].out_time_seconds, Some(1.0));
        assert!(collected[1].is_end);
    }

    #[test]
    fn nonzero_exit_is_reported_with_stderr() {
        let runner = ProcessRunner::new(2, Duration::from_secs(5));
        let cancel = CancelToken::new();
        let argv = vec!["false".to_string()];
        #[cfg(not(unix))]
        let argv = vec!["cmd".to_string(), "/c".to_string(), "exit".to_string(), "1".to_string()];
        let err = runner.run("job1", &argv, &cancel, None).unwrap_err();
        assert!(matches!(err, Error::NonzeroExit { .. }));
    }
}
