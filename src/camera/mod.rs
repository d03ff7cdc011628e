//! Camera streaming core.
//!
//! The pieces layer leaf-first:
//! - `detect`: decides between the Pi camera CLI and a V4L2 USB device
//! - `pipeline`: turns a backend + `StreamConfig` into external command lines
//! - `supervisor`: spawns, pipes and reaps those commands
//! - `watchdog`: restarts a dead pipeline under a bounded retry policy
//! - `manager`: the start/stop/restart/status facade over all of the above
//!
//! None of these open the network socket or touch frames. RTP/H.264 framing
//! is left entirely to GStreamer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod detect;
pub mod manager;
pub mod pipeline;
pub mod supervisor;
pub mod watchdog;

pub use detect::{Detector, HostProbe, SystemProbe};
pub use manager::{CameraManager, ManagerConfig, SessionState, StreamStatus};
pub use pipeline::{CommandSpec, PipeEdge, PipelineBuilder, PipelineSpec};
pub use supervisor::{ShutdownTimings, SupervisedProcess, Supervisor};
pub use watchdog::{WatchdogConfig, WatchdogPhase};

pub const DEFAULT_TARGET_IP: &str = "127.0.0.1";
pub const DEFAULT_TARGET_PORT: u16 = 5000;
pub const DEFAULT_DEVICE: &str = "/dev/video0";
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_FPS: u32 = 30;
/// kbit/s, handed to `x264enc`.
pub const DEFAULT_BITRATE: u32 = 500;

/// Camera backend used for one streaming session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    PiCamera,
    UsbCamera,
    None,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::PiCamera => "pi_camera",
            Backend::UsbCamera => "usb_camera",
            Backend::None => "none",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pi" | "pi_camera" | "picamera" => Ok(Backend::PiCamera),
            "usb" | "usb_camera" | "usbcamera" => Ok(Backend::UsbCamera),
            "none" => Ok(Backend::None),
            other => Err(anyhow::anyhow!(
                "unknown camera backend '{}' (expected pi, usb or none)",
                other
            )),
        }
    }
}

/// Parses a backend override where `auto` (or an empty value) means "detect".
pub fn parse_backend_override(value: &str) -> anyhow::Result<Option<Backend>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    trimmed.parse().map(Some)
}

/// Stream parameters supplied by the caller.
///
/// Read-only to the core once a session starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub target_ip: String,
    pub target_port: u16,
    /// Forced backend. `None` means auto-detect at start.
    pub backend: Option<Backend>,
    /// V4L2 device node, only used by the USB backend.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// kbit/s
    pub bitrate: u32,
    pub auto_reconnect: bool,
}

impl StreamConfig {
    /// `host:port` of the RTP receiver.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_ip, self.target_port)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_ip: DEFAULT_TARGET_IP.to_string(),
            target_port: DEFAULT_TARGET_PORT,
            backend: None,
            device: DEFAULT_DEVICE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            bitrate: DEFAULT_BITRATE,
            auto_reconnect: true,
        }
    }
}
