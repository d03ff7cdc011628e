//! Start/stop/restart/status facade over detection, building, supervision
//! and the watchdog.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::detect::{Detector, HostProbe, SystemProbe};
use super::pipeline::PipelineBuilder;
use super::supervisor::{ShutdownTimings, SupervisedProcess, Supervisor};
use super::watchdog::{Watchdog, WatchdogConfig, WatchdogHandle, WatchdogPhase};
use super::{Backend, StreamConfig};
use crate::error::{StreamError, StreamResult};

/// Bounded join on the watchdog during `stop`.
pub const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between stop and start in `restart`, so sockets and devices are released.
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Streaming,
    Reconnecting,
    Stopped,
    /// The watchdog gave up. Only an explicit start leaves this state.
    Failed,
}

impl SessionState {
    /// Streaming or between a crash and its relaunch.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Reconnecting)
    }
}

/// State shared between the facade and its watchdog.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) state: SessionState,
    pub(crate) phase: WatchdogPhase,
    pub(crate) backend: Option<Backend>,
    pub(crate) processes: Vec<SupervisedProcess>,
    pub(crate) reconnect_attempts: u32,
    /// Bumped by every `start`; a watchdog only acts on its own generation.
    pub(crate) generation: u64,
    /// Pipeline launches this session, initial launch included.
    pub(crate) launches: u32,
    pub(crate) last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            phase: WatchdogPhase::Terminated,
            backend: None,
            processes: Vec::new(),
            reconnect_attempts: 0,
            generation: 0,
            launches: 0,
            last_error: None,
        }
    }
}

/// Snapshot returned by `CameraManager::status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// At least one pipeline process is alive.
    pub streaming: bool,
    pub state: SessionState,
    pub phase: WatchdogPhase,
    pub backend: Option<Backend>,
    pub target: String,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Everything the facade needs besides the host probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    pub stream: StreamConfig,
    pub watchdog: WatchdogConfig,
    pub shutdown: ShutdownTimings,
    pub join_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            watchdog: WatchdogConfig::default(),
            shutdown: ShutdownTimings::default(),
            join_timeout: WATCHDOG_JOIN_TIMEOUT,
            settle_delay: RESTART_SETTLE_DELAY,
        }
    }
}

/// Owns at most one streaming pipeline at a time.
///
/// ```no_run
/// use rover_cam::camera::{CameraManager, ManagerConfig};
///
/// let mut cam = CameraManager::new(ManagerConfig::default());
/// cam.start()?;
/// println!("{:?}", cam.status());
/// cam.stop();
/// # Ok::<(), rover_cam::StreamError>(())
/// ```
pub struct CameraManager<P: HostProbe = SystemProbe> {
    detector: Detector<P>,
    config: ManagerConfig,
    supervisor: Supervisor,
    session: Arc<Mutex<Session>>,
    watchdog: Option<WatchdogHandle>,
}

impl CameraManager<SystemProbe> {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_probe(config, SystemProbe::new())
    }
}

impl<P: HostProbe> CameraManager<P> {
    pub fn with_probe(config: ManagerConfig, probe: P) -> Self {
        Self {
            detector: Detector::new(probe),
            supervisor: Supervisor::new(config.shutdown),
            config,
            session: Arc::new(Mutex::new(Session::default())),
            watchdog: None,
        }
    }

    pub fn detector(&self) -> &Detector<P> {
        &self.detector
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config.stream
    }

    /// Detect (unless overridden), build, launch and start the watchdog.
    ///
    /// A no-op with a warning while a session is already active.
    pub fn start(&mut self) -> StreamResult<()> {
        {
            let session = self.lock()?;
            if session.state.is_active() {
                log::warn!("stream already running, call stop() first");
                return Ok(());
            }
        }
        // A failed session leaves an exited watchdog and possibly stragglers.
        self.reap_previous_session();

        let backend = match self.config.stream.backend {
            Some(backend) => backend,
            None => self.detector.detect(),
        };
        self.lock()?.backend = Some(backend);
        if backend == Backend::None {
            return Err(StreamError::NoBackendAvailable);
        }

        let spec = PipelineBuilder::new(&self.detector).build(backend, &self.config.stream)?;
        log::info!("launching {}", spec);
        let processes = self.supervisor.launch(&spec)?;

        let generation = {
            let mut session = self.lock()?;
            session.state = SessionState::Streaming;
            session.phase = WatchdogPhase::Active;
            session.processes = processes;
            session.reconnect_attempts = 0;
            session.generation += 1;
            session.launches = 1;
            session.last_error = None;
            session.generation
        };

        let spawned = Watchdog::spawn(
            self.session.clone(),
            self.supervisor,
            spec,
            self.config.watchdog,
            self.config.stream.auto_reconnect,
            generation,
        );
        match spawned {
            Ok(handle) => self.watchdog = Some(handle),
            Err(source) => {
                let mut session = self.lock()?;
                self.supervisor.terminate(&mut session.processes);
                session.state = SessionState::Stopped;
                return Err(StreamError::ProcessLaunchFailed {
                    program: "camera-watchdog".to_string(),
                    source,
                });
            }
        }

        let stream = &self.config.stream;
        log::info!(
            "streaming {} -> udp://{} ({}x{} @ {}fps)",
            backend,
            stream.target(),
            stream.width,
            stream.height,
            stream.fps
        );
        Ok(())
    }

    /// Replace the stream parameters, then start.
    ///
    /// While a session is active the new parameters are ignored, same as
    /// a plain `start`.
    pub fn start_with(&mut self, config: StreamConfig) -> StreamResult<()> {
        if self.lock()?.state.is_active() {
            log::warn!("stream already running, keeping target {}", self.config.stream.target());
            return Ok(());
        }
        self.config.stream = config;
        self.start()
    }

    /// Stop the watchdog, then every pipeline process. Best effort, never fails.
    pub fn stop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop(self.config.join_timeout);
        }
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        self.supervisor.terminate(&mut session.processes);
        session.phase = WatchdogPhase::Terminated;
        if session.state != SessionState::Idle {
            session.state = SessionState::Stopped;
            log::info!("stream stopped");
        }
    }

    pub fn restart(&mut self) -> StreamResult<()> {
        self.stop();
        std::thread::sleep(self.config.settle_delay);
        self.start()
    }

    pub fn status(&self) -> StreamStatus {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let streaming = any_alive(&mut session.processes);
        StreamStatus {
            streaming,
            state: session.state,
            phase: session.phase,
            backend: session.backend.or(self.config.stream.backend),
            target: self.config.stream.target(),
            reconnect_attempts: session.reconnect_attempts,
            last_error: session.last_error.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .lock()
            .map(|session| session.state)
            .unwrap_or(SessionState::Failed)
    }

    /// True while at least one pipeline process is alive.
    pub fn is_streaming(&self) -> bool {
        match self.session.lock() {
            Ok(mut session) => any_alive(&mut session.processes),
            Err(_) => false,
        }
    }

    /// Pids of the current pipeline processes, in launch order.
    pub fn pids(&self) -> Vec<u32> {
        match self.session.lock() {
            Ok(session) => session.processes.iter().map(|p| p.pid()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Pipeline launches in the current session, relaunches included.
    pub fn launches(&self) -> u32 {
        self.session.lock().map(|s| s.launches).unwrap_or(0)
    }

    fn reap_previous_session(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop(self.config.join_timeout);
        }
        if let Ok(mut session) = self.session.lock() {
            self.supervisor.terminate(&mut session.processes);
        }
    }

    fn lock(&self) -> StreamResult<MutexGuard<'_, Session>> {
        self.session.lock().map_err(|_| StreamError::SessionPoisoned)
    }
}

impl<P: HostProbe> Drop for CameraManager<P> {
    fn drop(&mut self) {
        if self.watchdog.is_some() || !self.pids().is_empty() {
            self.stop();
        }
    }
}

fn any_alive(processes: &mut [SupervisedProcess]) -> bool {
    processes.iter_mut().any(|p| p.is_alive())
}
