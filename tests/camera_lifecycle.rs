#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use rover_cam::camera::{
    Backend, CameraManager, ManagerConfig, SessionState, ShutdownTimings, SystemProbe,
    WatchdogConfig, WatchdogPhase,
};

const LONG_RUNNING: &str = "#!/bin/sh\nexec sleep 30\n";

struct FakeHost {
    dir: TempDir,
}

impl FakeHost {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir(dir.path().join("bin")).expect("bin dir");
        std::fs::create_dir(dir.path().join("dev")).expect("dev dir");
        Self { dir }
    }

    fn tool(&self, name: &str, script: &str) {
        let path = self.dir.path().join("bin").join(name);
        std::fs::write(&path, script).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }

    fn remove_tool(&self, name: &str) {
        std::fs::remove_file(self.dir.path().join("bin").join(name)).expect("remove script");
    }

    fn counter(&self) -> PathBuf {
        self.dir.path().join("launches")
    }

    fn probe(&self) -> SystemProbe {
        SystemProbe::new()
            .with_search_path(self.dir.path().join("bin"))
            .with_dev_dir(self.dir.path().join("dev"))
    }
}

fn fast_config(max_reconnect_attempts: u32, auto_reconnect: bool) -> ManagerConfig {
    let mut config = ManagerConfig {
        watchdog: WatchdogConfig {
            poll_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_attempts,
            ..WatchdogConfig::default()
        },
        shutdown: ShutdownTimings {
            grace: Duration::from_millis(500),
            kill_wait: Duration::from_millis(500),
        },
        join_timeout: Duration::from_secs(2),
        settle_delay: Duration::from_millis(50),
        ..ManagerConfig::default()
    };
    config.stream.auto_reconnect = auto_reconnect;
    config
}

fn wait_for_state(cam: &CameraManager, state: SessionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cam.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn launches_recorded(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
        .map(|raw| raw.lines().count())
        .unwrap_or(0)
}

#[test]
fn pi_camera_pipeline_runs_as_two_piped_processes() {
    let host = FakeHost::new();
    host.tool("rpicam-vid", LONG_RUNNING);
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(5, true), host.probe());
    cam.start().expect("start");

    let status = cam.status();
    assert!(status.streaming);
    assert_eq!(status.state, SessionState::Streaming);
    assert_eq!(status.backend, Some(Backend::PiCamera));
    assert_eq!(status.phase, WatchdogPhase::Active);
    assert_eq!(cam.pids().len(), 2);

    cam.stop();
    assert_eq!(cam.state(), SessionState::Stopped);
    assert_eq!(cam.status().phase, WatchdogPhase::Terminated);
}

#[test]
fn second_start_keeps_the_running_pipeline() {
    let host = FakeHost::new();
    host.tool("rpicam-vid", LONG_RUNNING);
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(5, true), host.probe());
    cam.start().expect("first start");
    let pids = cam.pids();
    cam.start().expect("second start");
    assert_eq!(cam.pids(), pids);
    assert_eq!(cam.launches(), 1);
    cam.stop();
}

#[cfg(target_os = "linux")]
#[test]
fn stop_reaps_every_process() {
    let host = FakeHost::new();
    host.tool("rpicam-vid", LONG_RUNNING);
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(5, true), host.probe());
    cam.start().expect("start");
    let pids = cam.pids();
    assert!(!pids.is_empty());

    let started = Instant::now();
    cam.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    for pid in pids {
        assert!(
            !Path::new(&format!("/proc/{pid}")).exists(),
            "pid {pid} survived stop"
        );
    }
    assert!(cam.pids().is_empty());
    assert!(!cam.is_streaming());
}

#[test]
fn crashing_pipeline_gives_up_after_attempt_ceiling() {
    let host = FakeHost::new();
    let counter = host.counter();
    host.tool(
        "rpicam-vid",
        &format!("#!/bin/sh\necho x >> '{}'\nexit 1\n", counter.display()),
    );
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(2, true), host.probe());
    cam.start().expect("start");

    assert!(wait_for_state(&cam, SessionState::Failed, Duration::from_secs(10)));
    // initial launch plus two relaunches
    assert_eq!(launches_recorded(&counter), 3);
    assert_eq!(cam.launches(), 3);

    let status = cam.status();
    assert!(!status.streaming);
    assert_eq!(status.reconnect_attempts, 3);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("gave up after 2 reconnect attempts")));

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(launches_recorded(&counter), 3);
    assert_eq!(cam.state(), SessionState::Failed);

    cam.stop();
}

#[test]
fn disabled_reconnect_fails_on_first_crash() {
    let host = FakeHost::new();
    let counter = host.counter();
    host.tool(
        "rpicam-vid",
        &format!("#!/bin/sh\necho x >> '{}'\nexit 1\n", counter.display()),
    );
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(5, false), host.probe());
    cam.start().expect("start");

    assert!(wait_for_state(&cam, SessionState::Failed, Duration::from_secs(10)));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(launches_recorded(&counter), 1);
    assert_eq!(cam.status().reconnect_attempts, 0);
    cam.stop();
}

#[test]
fn start_after_failure_begins_a_fresh_session() {
    let host = FakeHost::new();
    let counter = host.counter();
    host.tool(
        "rpicam-vid",
        &format!("#!/bin/sh\necho x >> '{}'\nexit 1\n", counter.display()),
    );
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(0, true), host.probe());
    cam.start().expect("start");
    assert!(wait_for_state(&cam, SessionState::Failed, Duration::from_secs(10)));

    host.tool("rpicam-vid", LONG_RUNNING);
    cam.start().expect("restart after failure");
    assert_eq!(cam.state(), SessionState::Streaming);
    assert_eq!(cam.status().reconnect_attempts, 0);
    assert_eq!(cam.status().last_error, None);
    cam.stop();
}

#[test]
fn restart_replaces_the_pipeline() {
    let host = FakeHost::new();
    host.tool("rpicam-vid", LONG_RUNNING);
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(5, true), host.probe());
    cam.start().expect("start");
    let before = cam.pids();

    cam.restart().expect("restart");
    let after = cam.pids();
    assert_eq!(after.len(), 2);
    assert_ne!(before, after);
    assert_eq!(cam.state(), SessionState::Streaming);
    cam.stop();
}

#[test]
fn missing_streaming_tool_is_reported_before_launch() {
    let host = FakeHost::new();
    host.tool("rpicam-vid", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(5, true), host.probe());
    let err = cam.start().unwrap_err();
    assert!(err.to_string().contains("gst-launch-1.0"));
    assert!(cam.pids().is_empty());
}

#[test]
fn relaunch_spawn_failures_count_as_attempts() {
    let host = FakeHost::new();
    host.tool("rpicam-vid", "#!/bin/sh\nexit 1\n");
    host.tool("gst-launch-1.0", LONG_RUNNING);

    let mut cam = CameraManager::with_probe(fast_config(3, true), host.probe());
    cam.start().expect("start");
    host.remove_tool("rpicam-vid");

    assert!(wait_for_state(&cam, SessionState::Failed, Duration::from_secs(10)));
    let status = cam.status();
    assert_eq!(status.reconnect_attempts, 4);
    assert_eq!(cam.launches(), 4);
    assert!(cam.pids().is_empty());
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("gave up after 3 reconnect attempts")));

    let deadline = Instant::now() + Duration::from_secs(2);
    while cam.status().phase != WatchdogPhase::Terminated && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(cam.status().phase, WatchdogPhase::Terminated);
    cam.stop();
}
