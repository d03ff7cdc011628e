//! Background restart loop for a streaming session.
//!
//! The watchdog polls the session's processes and, when one dies, logs what
//! it left on stderr, tears down its siblings and relaunches the same
//! pipeline after a fixed delay. Attempts are counted per session and are
//! never reset by a successful relaunch, which caps total restart churn.
//!
//! All checks and relaunches happen under the session lock, and the stop
//! signal is re-checked under that lock before relaunching, so a concurrent
//! `stop` can never end up with two live process sets.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use super::manager::{Session, SessionState};
use super::pipeline::PipelineSpec;
use super::supervisor::Supervisor;
use crate::error::StreamError;

/// Sleep between liveness checks.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Delay between a detected crash and the relaunch.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Characters of a dead stage's stderr written to the log.
pub const DIAGNOSTIC_CHARS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub diagnostic_chars: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: WATCHDOG_POLL_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            diagnostic_chars: DIAGNOSTIC_CHARS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPhase {
    Active,
    Diagnosing,
    Backoff,
    Relaunching,
    Terminated,
}

enum Verdict {
    Healthy,
    Relaunch,
    GiveUp,
}

pub(crate) struct Watchdog {
    session: Arc<Mutex<Session>>,
    supervisor: Supervisor,
    spec: PipelineSpec,
    config: WatchdogConfig,
    auto_reconnect: bool,
    /// Session this watchdog was spawned for.
    generation: u64,
    stop: Receiver<()>,
}

/// Facade side of a running watchdog.
pub(crate) struct WatchdogHandle {
    stop: Option<Sender<()>>,
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Signal the watchdog and wait up to `timeout` for it to exit.
    ///
    /// Returns false if the thread was still running at the deadline; it is
    /// then detached and finishes on its own at its next stop check.
    pub(crate) fn stop(mut self, timeout: Duration) -> bool {
        drop(self.stop.take());
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("camera watchdog did not exit within {:?}", timeout);
                false
            }
            _ => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        log::error!("camera watchdog thread panicked");
                    }
                }
                true
            }
        }
    }
}

impl Watchdog {
    pub(crate) fn spawn(
        session: Arc<Mutex<Session>>,
        supervisor: Supervisor,
        spec: PipelineSpec,
        config: WatchdogConfig,
        auto_reconnect: bool,
        generation: u64,
    ) -> std::io::Result<WatchdogHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let watchdog = Watchdog {
            session,
            supervisor,
            spec,
            config,
            auto_reconnect,
            generation,
            stop: stop_rx,
        };
        let join = std::thread::Builder::new()
            .name("camera-watchdog".to_string())
            .spawn(move || {
                // Dropped on exit (or unwind), which is what `stop` waits for.
                let _done = done_tx;
                watchdog.run();
            })?;
        Ok(WatchdogHandle {
            stop: Some(stop_tx),
            done: done_rx,
            join: Some(join),
        })
    }

    fn run(self) {
        loop {
            if self.stop_requested() || self.sleep(self.config.poll_interval) {
                break;
            }
            match self.check() {
                Verdict::Healthy => continue,
                Verdict::GiveUp => break,
                Verdict::Relaunch => {}
            }
            if self.sleep(self.config.reconnect_delay) {
                break;
            }
            if !self.relaunch() {
                break;
            }
        }
        if let Some(mut session) = self.lock() {
            if session.generation == self.generation {
                session.phase = WatchdogPhase::Terminated;
            }
        }
        log::debug!("camera watchdog exiting");
    }

    fn check(&self) -> Verdict {
        let Some(mut session) = self.lock() else {
            return Verdict::GiveUp;
        };
        if session.generation != self.generation || !session.state.is_active() {
            return Verdict::GiveUp;
        }

        let mut any_dead = session.processes.is_empty();
        for handle in session.processes.iter_mut() {
            if !handle.is_alive() {
                any_dead = true;
            }
        }
        if !any_dead {
            return Verdict::Healthy;
        }

        session.phase = WatchdogPhase::Diagnosing;
        for handle in session.processes.iter_mut() {
            if handle.is_alive() {
                continue;
            }
            let summary = handle.exit_summary();
            log::error!(
                "pipeline stage {} (pid {}) exited with {}. stderr: {}",
                handle.stage(),
                handle.pid(),
                summary,
                handle.diagnostics_prefix(self.config.diagnostic_chars).trim_end()
            );
        }
        self.supervisor.terminate(&mut session.processes);

        if !self.auto_reconnect {
            log::info!("auto-reconnect disabled, giving up");
            Self::fail(&mut session, StreamError::ReconnectDisabled);
            return Verdict::GiveUp;
        }

        session.reconnect_attempts += 1;
        if session.reconnect_attempts > self.config.max_reconnect_attempts {
            log::error!(
                "exceeded {} reconnect attempts, giving up",
                self.config.max_reconnect_attempts
            );
            Self::fail(
                &mut session,
                StreamError::ReconnectExhausted {
                    attempts: self.config.max_reconnect_attempts,
                },
            );
            return Verdict::GiveUp;
        }

        log::info!(
            "reconnect attempt {}/{} in {:.1}s",
            session.reconnect_attempts,
            self.config.max_reconnect_attempts,
            self.config.reconnect_delay.as_secs_f64()
        );
        session.state = SessionState::Reconnecting;
        session.phase = WatchdogPhase::Backoff;
        Verdict::Relaunch
    }

    /// Relaunch under the lock. False when the session was stopped meanwhile.
    fn relaunch(&self) -> bool {
        let Some(mut session) = self.lock() else {
            return false;
        };
        if self.stop_requested()
            || session.generation != self.generation
            || session.state != SessionState::Reconnecting
        {
            return false;
        }

        session.phase = WatchdogPhase::Relaunching;
        session.launches += 1;
        match self.supervisor.launch(&self.spec) {
            Ok(processes) => {
                let pids: Vec<u32> = processes.iter().map(|p| p.pid()).collect();
                log::info!("pipeline relaunched (pids {:?})", pids);
                session.processes = processes;
                session.state = SessionState::Streaming;
            }
            // Nothing is running now, so the next poll counts another attempt.
            Err(e) => {
                log::error!("reconnect failed: {}", e);
                session.last_error = Some(e.to_string());
            }
        }
        session.phase = WatchdogPhase::Active;
        true
    }

    fn fail(session: &mut Session, error: StreamError) {
        session.state = SessionState::Failed;
        session.last_error = Some(error.to_string());
    }

    /// Sleeps on the stop channel. True if a stop arrived.
    fn sleep(&self, duration: Duration) -> bool {
        !matches!(
            self.stop.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    fn lock(&self) -> Option<MutexGuard<'_, Session>> {
        match self.session.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::error!("camera session lock poisoned, watchdog exiting");
                None
            }
        }
    }
}
