//! Camera backend detection.
//!
//! Detection is read-only: it looks at the executable search path and the
//! device directory and never opens a device.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{Backend, DEFAULT_DEVICE};

/// Pi camera capture CLIs, modern name first.
pub const PI_CAMERA_TOOLS: [&str; 2] = ["rpicam-vid", "libcamera-vid"];
/// GStreamer pipeline launcher.
pub const STREAMING_TOOL: &str = "gst-launch-1.0";

/// Host queries the detector depends on.
pub trait HostProbe: Send + Sync {
    /// Resolve an executable name against the search path.
    fn find_program(&self, name: &str) -> Option<PathBuf>;

    /// Character-special `video*` device nodes, sorted.
    fn video_devices(&self) -> Vec<PathBuf>;
}

/// Probe backed by the real filesystem.
#[derive(Clone, Debug)]
pub struct SystemProbe {
    search_path: Option<OsString>,
    dev_dir: PathBuf,
}

impl SystemProbe {
    /// Probe using `$PATH` and `/dev`.
    pub fn new() -> Self {
        Self {
            search_path: None,
            dev_dir: PathBuf::from("/dev"),
        }
    }

    /// Override the search path (same syntax as `$PATH`).
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn with_dev_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dir.into();
        self
    }

    fn search_path(&self) -> Option<OsString> {
        self.search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SystemProbe {
    fn find_program(&self, name: &str) -> Option<PathBuf> {
        if name.contains('/') {
            let candidate = PathBuf::from(name);
            return is_executable(&candidate).then_some(candidate);
        }
        let search_path = self.search_path()?;
        std::env::split_paths(&search_path)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    fn video_devices(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("cannot list {}: {}", self.dev_dir.display(), e);
                return Vec::new();
            }
        };
        let mut devices: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("video"))
            .map(|entry| entry.path())
            .filter(|path| is_char_device(path))
            .collect();
        devices.sort();
        devices
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn is_char_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_char_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_char_device(_path: &Path) -> bool {
    false
}

/// Chooses a camera backend from what the host has installed.
#[derive(Clone, Debug, Default)]
pub struct Detector<P = SystemProbe> {
    probe: P,
}

impl<P: HostProbe> Detector<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Pi camera CLI wins over V4L2 devices; no camera yields `Backend::None`.
    pub fn detect(&self) -> Backend {
        if let Some((name, _)) = self.pi_camera_tool() {
            log::info!("{} found, selecting Pi camera backend", name);
            return Backend::PiCamera;
        }
        let devices = self.video_devices();
        if !devices.is_empty() {
            let listed: Vec<String> = devices.iter().map(|d| d.display().to_string()).collect();
            log::info!("USB camera detected ({})", listed.join(", "));
            return Backend::UsbCamera;
        }
        log::warn!("no camera backend detected");
        Backend::None
    }

    /// The Pi camera CLI name and its resolved path, if any.
    pub fn pi_camera_tool(&self) -> Option<(&'static str, PathBuf)> {
        PI_CAMERA_TOOLS
            .iter()
            .find_map(|name| self.probe.find_program(name).map(|path| (*name, path)))
    }

    pub fn pi_camera_tool_available(&self) -> bool {
        self.pi_camera_tool().is_some()
    }

    pub fn streaming_tool(&self) -> Option<PathBuf> {
        self.probe.find_program(STREAMING_TOOL)
    }

    pub fn streaming_tool_available(&self) -> bool {
        self.streaming_tool().is_some()
    }

    pub fn video_devices(&self) -> Vec<PathBuf> {
        self.probe.video_devices()
    }

    /// First video device, or `/dev/video0` when none is present.
    pub fn default_device(&self) -> String {
        self.video_devices()
            .into_iter()
            .next()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
    }
}
