//! Rover camera streaming supervisor
//!
//! Streams the rover camera as H.264 over RTP/UDP by driving external tools
//! (`rpicam-vid`/`libcamera-vid` and `gst-launch-1.0`) and keeping them alive.
//!
//! # Lifecycle
//!
//! 1. **Detect**: Pi camera CLI first, then a V4L2 USB device, else nothing.
//! 2. **Build**: one or two command lines, piped when the Pi camera is used.
//! 3. **Supervise**: spawn, capture stderr, stop with SIGINT then SIGKILL.
//! 4. **Watch**: relaunch a dead pipeline up to a fixed attempt ceiling.
//!
//! # Module Structure
//!
//! - `camera`: detection, pipeline building, supervision, watchdog, facade
//! - `config`: TOML file plus `ROVER_CAM_*` environment overrides
//! - `api`: HTTP control surface over `CameraManager`
//! - `diagnostics`: host checks behind `rover-cam doctor`
//! - `dune`: dune confidence scoring from camera and range readings

pub mod api;
pub mod camera;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod dune;
pub mod error;
pub mod ui;

pub use camera::{
    Backend, CameraManager, Detector, HostProbe, ManagerConfig, PipelineBuilder, PipelineSpec,
    SessionState, StreamConfig, StreamStatus, Supervisor, SystemProbe,
};
pub use config::RoverConfig;
pub use error::{StreamError, StreamResult};
