//! Child process lifecycle for pipeline stages.
//!
//! The supervisor is the only owner of stage processes: it spawns them,
//! connects stage stdout to the next stage's stdin, keeps their stderr for
//! diagnostics and tears them down with a bounded SIGINT -> SIGKILL sequence.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::pipeline::PipelineSpec;
use crate::error::{StreamError, StreamResult};

/// Bytes of stderr retained per process. The rest is drained and dropped.
pub const STDERR_CAPTURE_BYTES: usize = 64 * 1024;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(250);

/// Bounded waits used while stopping a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownTimings {
    /// Wait after SIGINT before escalating.
    pub grace: Duration,
    /// Wait after SIGKILL before giving up on reclaim.
    pub kill_wait: Duration,
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            kill_wait: Duration::from_secs(2),
        }
    }
}

/// Background reader that keeps a prefix of a child's stderr.
struct StderrCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrCapture {
    fn spawn(mut source: impl Read + Send + 'static, stage: &str) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let reader = std::thread::Builder::new()
            .name(format!("stderr-{stage}"))
            .spawn(move || {
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match source.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if let Ok(mut captured) = sink.lock() {
                        let room = STDERR_CAPTURE_BYTES.saturating_sub(captured.len());
                        captured.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            });
        let reader = match reader {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("stderr capture for {} unavailable: {}", stage, e);
                None
            }
        };
        Self { buffer, reader }
    }

    fn contents(&self) -> String {
        match self.buffer.lock() {
            Ok(captured) => String::from_utf8_lossy(&captured).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Gives the reader a moment to drain what the exited child wrote last.
    ///
    /// A grandchild can keep the pipe open, so this never blocks past
    /// `STDERR_DRAIN_WAIT`.
    fn finish(&mut self) {
        let deadline = Instant::now() + STDERR_DRAIN_WAIT;
        while let Some(reader) = self.reader.as_ref() {
            if reader.is_finished() {
                if let Some(reader) = self.reader.take() {
                    let _ = reader.join();
                }
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// A running (or recently exited) pipeline stage.
pub struct SupervisedProcess {
    stage: String,
    child: Child,
    status: Option<ExitStatus>,
    stderr: Option<StderrCapture>,
}

impl SupervisedProcess {
    fn new(stage: String, mut child: Child) -> Self {
        let stderr = child
            .stderr
            .take()
            .map(|source| StderrCapture::spawn(source, &stage));
        Self {
            stage,
            child,
            status: None,
            stderr,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Program name of the stage.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Exit status once the process has been reaped.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.reaped(status),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("cannot poll {} (pid {}): {}", self.stage, self.pid(), e);
                }
            }
        }
        self.status
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.poll().and_then(|status| status.code())
    }

    /// `code N`, `signal N` or `running`.
    pub fn exit_summary(&mut self) -> String {
        match self.poll() {
            None => "running".to_string(),
            Some(status) => describe_status(status),
        }
    }

    /// Everything captured from stderr so far.
    pub fn diagnostics(&self) -> String {
        self.stderr
            .as_ref()
            .map(StderrCapture::contents)
            .unwrap_or_default()
    }

    /// First `limit` characters of stderr.
    pub fn diagnostics_prefix(&self, limit: usize) -> String {
        self.diagnostics().chars().take(limit).collect()
    }

    /// Polls until the process exits or `timeout` elapses. True if it exited.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll().is_some() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Cooperative stop. `gst-launch-1.0 -e` turns SIGINT into an EOS.
    pub fn interrupt(&mut self) {
        #[cfg(unix)]
        {
            let Ok(pid) = libc::pid_t::try_from(self.pid()) else {
                return;
            };
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
            let rc = unsafe { libc::kill(pid, libc::SIGINT) };
            if rc != 0 {
                log::debug!(
                    "SIGINT to {} (pid {}) failed: {}",
                    self.stage,
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
        #[cfg(not(unix))]
        {
            self.kill();
        }
    }

    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            log::debug!("kill {} (pid {}) failed: {}", self.stage, self.pid(), e);
        }
    }

    fn reaped(&mut self, status: ExitStatus) {
        self.status = Some(status);
        if let Some(capture) = self.stderr.as_mut() {
            capture.finish();
        }
    }
}

impl std::fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("stage", &self.stage)
            .field("pid", &self.child.id())
            .field("status", &self.status)
            .finish()
    }
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    "unknown status".to_string()
}

/// Spawns and reaps pipeline stages.
#[derive(Clone, Copy, Debug, Default)]
pub struct Supervisor {
    timings: ShutdownTimings,
}

impl Supervisor {
    pub fn new(timings: ShutdownTimings) -> Self {
        Self { timings }
    }

    pub fn timings(&self) -> ShutdownTimings {
        self.timings
    }

    /// Spawn every stage in order.
    ///
    /// If a later stage fails to spawn, the stages already running are torn
    /// down before the error is returned.
    pub fn launch(&self, spec: &PipelineSpec) -> StreamResult<Vec<SupervisedProcess>> {
        let mut handles: Vec<SupervisedProcess> = Vec::with_capacity(spec.stages.len());
        let mut upstream: Option<ChildStdout> = None;

        for (index, stage) in spec.stages.iter().enumerate() {
            let mut command = Command::new(&stage.program);
            command.args(&stage.args).stderr(Stdio::piped());

            let stdin = match upstream.take() {
                Some(pipe) if spec.is_piped_into(index) => Stdio::from(pipe),
                _ => Stdio::null(),
            };
            command.stdin(stdin);
            if spec.is_piped_from(index) {
                command.stdout(Stdio::piped());
            } else {
                command.stdout(Stdio::null());
            }

            let spawned = command.spawn();
            // Close our copy of the upstream read end; the downstream stage
            // must be its only reader.
            drop(command);

            let mut child = match spawned {
                Ok(child) => child,
                Err(source) => {
                    log::error!("failed to spawn {}: {}", stage, source);
                    self.terminate(&mut handles);
                    return Err(StreamError::ProcessLaunchFailed {
                        program: stage.name(),
                        source,
                    });
                }
            };
            if spec.is_piped_from(index) {
                upstream = child.stdout.take();
            }
            log::debug!("spawned {} (pid {})", stage.name(), child.id());
            handles.push(SupervisedProcess::new(stage.name(), child));
        }

        Ok(handles)
    }

    /// Best-effort stop of every handle, newest first.
    ///
    /// Never fails: a process that survives SIGKILL past the reclaim wait is
    /// logged and dropped.
    pub fn terminate(&self, handles: &mut Vec<SupervisedProcess>) {
        while let Some(mut handle) = handles.pop() {
            if !handle.is_alive() {
                continue;
            }
            handle.interrupt();
            if handle.wait_timeout(self.timings.grace) {
                log::debug!("{} (pid {}) stopped", handle.stage(), handle.pid());
                continue;
            }
            log::warn!(
                "{} (pid {}) ignored SIGINT for {:?}, killing",
                handle.stage(),
                handle.pid(),
                self.timings.grace
            );
            handle.kill();
            if !handle.wait_timeout(self.timings.kill_wait) {
                log::error!(
                    "{} (pid {}) still alive {:?} after SIGKILL; abandoning it",
                    handle.stage(),
                    handle.pid(),
                    self.timings.kill_wait
                );
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::camera::{Backend, CommandSpec, PipeEdge};
    use std::path::PathBuf;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn single(script: &str) -> PipelineSpec {
        PipelineSpec {
            backend: Backend::UsbCamera,
            stages: vec![sh(script)],
            pipe: None,
        }
    }

    fn fast() -> Supervisor {
        Supervisor::new(ShutdownTimings {
            grace: Duration::from_millis(500),
            kill_wait: Duration::from_millis(500),
        })
    }

    #[test]
    fn captures_stderr_and_exit_code() {
        let supervisor = fast();
        let mut handles = supervisor
            .launch(&single("echo 'no such element x264enc' >&2; exit 3"))
            .unwrap();
        let handle = &mut handles[0];
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert_eq!(handle.exit_code(), Some(3));
        assert_eq!(handle.exit_summary(), "code 3");
        assert!(handle.diagnostics().contains("no such element x264enc"));
        assert_eq!(handle.diagnostics_prefix(7), "no such");
    }

    #[test]
    fn pipes_first_stage_into_second() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("received");
        let spec = PipelineSpec {
            backend: Backend::PiCamera,
            stages: vec![
                sh("printf 'nal-units'"),
                sh(&format!("cat > '{}'", out.display())),
            ],
            pipe: Some(PipeEdge { from: 0, to: 1 }),
        };
        let mut handles = fast().launch(&spec)?;
        for handle in handles.iter_mut() {
            assert!(handle.wait_timeout(Duration::from_secs(5)));
        }
        assert_eq!(std::fs::read_to_string(out)?, "nal-units");
        Ok(())
    }

    #[test]
    fn upstream_sees_downstream_exit() {
        // `yes` only terminates once nobody holds the read end any more.
        let spec = PipelineSpec {
            backend: Backend::PiCamera,
            stages: vec![sh("exec yes"), sh("exec head -c 1 > /dev/null")],
            pipe: Some(PipeEdge { from: 0, to: 1 }),
        };
        let mut handles = fast().launch(&spec).unwrap();
        assert!(handles[1].wait_timeout(Duration::from_secs(5)));
        assert!(handles[0].wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn terminate_stops_processes_that_honour_sigint() {
        let supervisor = fast();
        let mut handles = supervisor.launch(&single("exec sleep 30")).unwrap();
        let pid = handles[0].pid();
        supervisor.terminate(&mut handles);
        assert!(handles.is_empty());
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn terminate_escalates_to_kill() {
        let supervisor = fast();
        let mut handles = supervisor
            .launch(&single("trap '' INT; while :; do sleep 0.1; done"))
            .unwrap();
        // give the shell time to install the trap
        std::thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        supervisor.terminate(&mut handles);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(handles.is_empty());
    }

    #[test]
    fn failed_spawn_reports_program_and_cleans_up() {
        let spec = PipelineSpec {
            backend: Backend::PiCamera,
            stages: vec![
                sh("exec sleep 30"),
                CommandSpec {
                    program: PathBuf::from("/nonexistent/gst-launch-1.0"),
                    args: Vec::new(),
                },
            ],
            pipe: Some(PipeEdge { from: 0, to: 1 }),
        };
        let err = fast().launch(&spec).unwrap_err();
        match err {
            StreamError::ProcessLaunchFailed { program, .. } => {
                assert_eq!(program, "gst-launch-1.0")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
