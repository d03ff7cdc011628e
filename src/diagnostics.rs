//! Host diagnostics for the streaming stack.
//!
//! Everything here is best effort: a missing helper tool or a hung probe
//! shows up as an empty field in the report, never as an error.

use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::camera::detect::{Detector, HostProbe, STREAMING_TOOL};
use crate::camera::{Backend, CommandSpec, PipelineSpec, Supervisor};

/// GStreamer elements the sender pipelines use.
pub const REQUIRED_ELEMENTS: [&str; 7] = [
    "v4l2src",
    "videoconvert",
    "x264enc",
    "h264parse",
    "fdsrc",
    "rtph264pay",
    "udpsink",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_CAMERAS_TIMEOUT: Duration = Duration::from_secs(10);
const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(5);
const USB_CAPTURE_TIMEOUT: Duration = Duration::from_secs(6);
const SMOKE_TEST_STDERR_CHARS: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VideoDevice {
    pub path: String,
    pub name: String,
    pub driver: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GstreamerReport {
    pub installed: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub elements_found: Vec<String>,
    pub elements_missing: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PiCameraReport {
    pub available: bool,
    pub command: Option<String>,
    pub path: Option<PathBuf>,
    pub cameras: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SmokeTest {
    pub success: bool,
    pub exit: Option<String>,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    pub detected_backend: Backend,
    pub video_devices: Vec<VideoDevice>,
    pub gstreamer: GstreamerReport,
    pub pi_camera: PiCameraReport,
    pub smoke_test: Option<SmokeTest>,
    /// `v4l2src` capture from the first video device.
    pub usb_capture: Option<SmokeTest>,
}

impl DiagnosticReport {
    /// Operator-facing remediation hints.
    pub fn hints(&self) -> Vec<String> {
        let mut hints = Vec::new();
        if !self.gstreamer.installed {
            hints.push(
                "GStreamer is not installed: sudo apt install gstreamer1.0-tools \
                 gstreamer1.0-plugins-good gstreamer1.0-plugins-bad gstreamer1.0-plugins-ugly"
                    .to_string(),
            );
        } else if !self.gstreamer.elements_missing.is_empty() {
            hints.push(format!(
                "missing GStreamer elements: {} (gst-plugins-good, -bad or -ugly)",
                self.gstreamer.elements_missing.join(", ")
            ));
        }
        if !self.pi_camera.available {
            hints.push(
                "rpicam-vid/libcamera-vid not found: Pi camera streaming unavailable".to_string(),
            );
        }
        if self.video_devices.is_empty() {
            hints.push("no /dev/video* devices found".to_string());
        }
        if let Some(smoke) = &self.smoke_test {
            if !smoke.success {
                hints.push(format!(
                    "videotestsrc smoke pipeline failed ({})",
                    smoke.exit.as_deref().unwrap_or("did not start")
                ));
            }
        }
        if let Some(capture) = &self.usb_capture {
            if !capture.success {
                hints.push(format!(
                    "camera capture pipeline failed ({}): check the device with \
                     v4l2-ctl --list-formats-ext",
                    capture.exit.as_deref().unwrap_or("did not start")
                ));
            }
        }
        hints
    }
}

/// Runs every check. The test pipelines are optional because they take seconds.
pub fn run_diagnostics<P: HostProbe>(
    detector: &Detector<P>,
    pipelines: bool,
) -> DiagnosticReport {
    let gstreamer = check_gstreamer(detector);
    let video_devices = list_video_devices(detector);
    let pipelines = pipelines && gstreamer.installed;
    let smoke_test = pipelines.then(|| run_smoke_test(detector));
    let usb_capture = video_devices
        .first()
        .filter(|_| pipelines)
        .map(|device| run_usb_capture_test(detector, &device.path));
    DiagnosticReport {
        detected_backend: detector.detect(),
        video_devices,
        gstreamer,
        pi_camera: check_pi_camera(detector),
        smoke_test,
        usb_capture,
    }
}

/// Video devices with `v4l2-ctl --info` metadata when that tool exists.
pub fn list_video_devices<P: HostProbe>(detector: &Detector<P>) -> Vec<VideoDevice> {
    let v4l2_ctl = detector.probe().find_program("v4l2-ctl");
    detector
        .video_devices()
        .into_iter()
        .map(|path| {
            let path = path.display().to_string();
            let info = v4l2_ctl
                .as_deref()
                .and_then(|tool| run_probe(tool, &["-d", path.as_str(), "--info"], PROBE_TIMEOUT))
                .filter(|out| out.succeeded())
                .map(|out| parse_v4l2_info(&out.stdout))
                .unwrap_or_default();
            VideoDevice {
                path,
                name: info.0.unwrap_or_else(|| "unknown".to_string()),
                driver: info.1.unwrap_or_else(|| "unknown".to_string()),
            }
        })
        .collect()
}

pub fn check_gstreamer<P: HostProbe>(detector: &Detector<P>) -> GstreamerReport {
    let Some(path) = detector.streaming_tool() else {
        log::warn!("{} not found, install gstreamer1.0-tools", STREAMING_TOOL);
        return GstreamerReport {
            elements_missing: REQUIRED_ELEMENTS.iter().map(|e| e.to_string()).collect(),
            ..GstreamerReport::default()
        };
    };

    let version = run_probe(&path, &["--version"], PROBE_TIMEOUT)
        .and_then(|out| parse_gstreamer_version(&out.stdout));

    let inspect = detector.probe().find_program("gst-inspect-1.0");
    let (found, missing): (Vec<&str>, Vec<&str>) =
        REQUIRED_ELEMENTS.iter().copied().partition(|element| {
            inspect
                .as_deref()
                .and_then(|tool| run_probe(tool, &[*element], PROBE_TIMEOUT))
                .is_some_and(|out| out.succeeded())
        });

    GstreamerReport {
        installed: true,
        path: Some(path),
        version,
        elements_found: found.into_iter().map(str::to_string).collect(),
        elements_missing: missing.into_iter().map(str::to_string).collect(),
    }
}

pub fn check_pi_camera<P: HostProbe>(detector: &Detector<P>) -> PiCameraReport {
    let Some((command, path)) = detector.pi_camera_tool() else {
        return PiCameraReport::default();
    };
    let cameras = run_probe(&path, &["--list-cameras"], LIST_CAMERAS_TIMEOUT)
        .map(|out| {
            // rpicam-apps print the camera list on stderr on some releases
            format!("{}\n{}", out.stdout, out.stderr)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    PiCameraReport {
        available: true,
        command: Some(command.to_string()),
        path: Some(path),
        cameras,
    }
}

/// `videotestsrc num-buffers=90 ! fakesink`. Still running at the deadline
/// counts as success, same as a clean exit.
pub fn run_smoke_test<P: HostProbe>(detector: &Detector<P>) -> SmokeTest {
    run_test_pipeline(
        detector,
        &["videotestsrc", "num-buffers=90", "!", "fakesink"],
        SMOKE_TEST_TIMEOUT,
    )
}

/// `v4l2src device=DEV num-buffers=150 ! videoconvert ! fakesink`: whether
/// the camera itself delivers frames.
pub fn run_usb_capture_test<P: HostProbe>(detector: &Detector<P>, device: &str) -> SmokeTest {
    let source = format!("device={device}");
    run_test_pipeline(
        detector,
        &[
            "v4l2src",
            source.as_str(),
            "num-buffers=150",
            "!",
            "videoconvert",
            "!",
            "fakesink",
        ],
        USB_CAPTURE_TIMEOUT,
    )
}

fn run_test_pipeline<P: HostProbe>(
    detector: &Detector<P>,
    args: &[&str],
    timeout: Duration,
) -> SmokeTest {
    let Some(gst) = detector.streaming_tool() else {
        return SmokeTest {
            success: false,
            exit: None,
            stderr: format!("{} not found", STREAMING_TOOL),
        };
    };
    let spec = PipelineSpec {
        backend: Backend::None,
        stages: vec![CommandSpec {
            program: gst,
            args: args.iter().map(|s| s.to_string()).collect(),
        }],
        pipe: None,
    };
    let supervisor = Supervisor::default();
    let mut handles = match supervisor.launch(&spec) {
        Ok(handles) => handles,
        Err(e) => {
            return SmokeTest {
                success: false,
                exit: None,
                stderr: e.to_string(),
            }
        }
    };

    let Some(handle) = handles.first_mut() else {
        return SmokeTest {
            success: false,
            exit: None,
            stderr: String::new(),
        };
    };
    let exited = handle.wait_timeout(timeout);
    let success = !exited || handle.exit_code() == Some(0);
    let exit = exited.then(|| handle.exit_summary());
    let stderr = handle.diagnostics_prefix(SMOKE_TEST_STDERR_CHARS);
    supervisor.terminate(&mut handles);
    SmokeTest {
        success,
        exit,
        stderr,
    }
}

/// `(card type, driver name)` from `v4l2-ctl --info`.
pub fn parse_v4l2_info(output: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut driver = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.contains("Card type") {
            name = Some(value.trim().to_string());
        } else if key.contains("Driver name") {
            driver = Some(value.trim().to_string());
        }
    }
    (name, driver)
}

pub fn parse_gstreamer_version(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("GStreamer"))
        .map(|line| line.trim().to_string())
}

struct ProbeOutput {
    status: Option<ExitStatus>,
    stdout: String,
    stderr: String,
}

impl ProbeOutput {
    fn succeeded(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }
}

/// Runs a short-lived helper with a deadline. `None` if it could not start.
fn run_probe(program: &Path, args: &[&str], timeout: Duration) -> Option<ProbeOutput> {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            log::debug!("cannot run {}: {}", program.display(), e);
            return None;
        }
    };
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(None) => {
                log::debug!("{} timed out after {:?}", program.display(), timeout);
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            Err(e) => {
                log::debug!("waiting on {} failed: {}", program.display(), e);
                break None;
            }
        }
    };

    Some(ProbeOutput {
        status,
        stdout: stdout.map(collect).unwrap_or_default(),
        stderr: stderr.map(collect).unwrap_or_default(),
    })
}

fn drain(mut source: impl Read + Send + 'static) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut raw = Vec::new();
        let _ = source.read_to_end(&mut raw);
        String::from_utf8_lossy(&raw).into_owned()
    })
}

fn collect(reader: JoinHandle<String>) -> String {
    reader.join().unwrap_or_default()
}
