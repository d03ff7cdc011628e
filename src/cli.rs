//! rover-cam - stream the rover camera over RTP/UDP and keep it alive.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use std::io::IsTerminal;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{ApiConfig, ApiServer};
use crate::camera::{parse_backend_override, CameraManager, Detector, SessionState, SystemProbe};
use crate::config::{validate_stream, RoverConfig};
use crate::diagnostics;
use crate::ui::{Ui, UiMode};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    name = "rover-cam",
    version,
    about = "Rover camera streaming supervisor (RTP/H.264 over UDP)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream until Ctrl-C, restarting the pipeline when it dies
    Stream(StreamArgs),

    /// Serve the HTTP control API until Ctrl-C
    Serve {
        #[command(flatten)]
        stream: StreamArgs,
        /// Listen address
        #[arg(long, value_name = "ADDR", env = "ROVER_CAM_API_ADDR")]
        addr: Option<String>,
        /// Start streaming immediately instead of waiting for POST /stream/start
        #[arg(long)]
        autostart: bool,
    },

    /// Check the camera and GStreamer installation
    Doctor {
        /// Print the report as JSON on stdout
        #[arg(long)]
        json: bool,
        /// Skip the videotestsrc and camera capture test pipelines
        #[arg(long)]
        no_smoke_test: bool,
        /// UI mode for stderr progress
        #[arg(long, value_enum, default_value_t = UiMode::Auto)]
        ui: UiMode,
    },

    /// List video devices and the backend auto-detection would pick
    Devices,
}

#[derive(Args, Debug, Default)]
struct StreamArgs {
    /// Receiver address
    #[arg(long)]
    ip: Option<String>,
    /// Receiver UDP port
    #[arg(long)]
    port: Option<u16>,
    /// Camera backend: pi, usb or auto
    #[arg(long, value_name = "BACKEND")]
    camera: Option<String>,
    /// V4L2 device for the USB backend
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    /// H.264 bitrate in kbit/s
    #[arg(long)]
    bitrate: Option<u32>,
    /// Do not relaunch a pipeline that dies
    #[arg(long)]
    no_reconnect: bool,
}

impl StreamArgs {
    fn apply(&self, cfg: &mut RoverConfig) -> Result<()> {
        let stream = cfg.stream_mut();
        if let Some(ip) = &self.ip {
            stream.target_ip = ip.clone();
        }
        if let Some(port) = self.port {
            stream.target_port = port;
        }
        if let Some(camera) = &self.camera {
            stream.backend = parse_backend_override(camera)?;
        }
        if let Some(device) = &self.device {
            stream.device = device.clone();
        }
        if let Some(width) = self.width {
            stream.width = width;
        }
        if let Some(height) = self.height {
            stream.height = height;
        }
        if let Some(fps) = self.fps {
            stream.fps = fps;
        }
        if let Some(bitrate) = self.bitrate {
            stream.bitrate = bitrate;
        }
        if self.no_reconnect {
            stream.auto_reconnect = false;
        }
        validate_stream(stream)
    }
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Stream(args) => cmd_stream(&args),
        Command::Serve {
            stream,
            addr,
            autostart,
        } => cmd_serve(&stream, addr, autostart),
        Command::Doctor {
            json,
            no_smoke_test,
            ui,
        } => cmd_doctor(json, !no_smoke_test, ui),
        Command::Devices => cmd_devices(),
    }
}

fn load_config(args: &StreamArgs) -> Result<RoverConfig> {
    let mut cfg = RoverConfig::load()?;
    args.apply(&mut cfg)?;
    Ok(cfg)
}

fn shutdown_channel() -> Result<crossbeam_channel::Receiver<()>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("error setting Ctrl-C handler")?;
    Ok(rx)
}

fn cmd_stream(args: &StreamArgs) -> Result<()> {
    let cfg = load_config(args)?;
    let shutdown = shutdown_channel()?;
    let mut camera = CameraManager::new(cfg.manager);
    camera.start()?;

    log::info!("streaming, press Ctrl-C to stop");
    loop {
        match shutdown.recv_timeout(STATE_POLL_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if camera.state() == SessionState::Failed {
                    let status = camera.status();
                    camera.stop();
                    return Err(anyhow!(
                        "stream failed: {}",
                        status.last_error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping stream...");
    camera.stop();
    Ok(())
}

fn cmd_serve(args: &StreamArgs, addr: Option<String>, autostart: bool) -> Result<()> {
    let cfg = load_config(args)?;
    let api_cfg = ApiConfig {
        addr: addr.unwrap_or_else(|| cfg.api_addr.clone()),
    };
    let shutdown = shutdown_channel()?;

    let camera = Arc::new(Mutex::new(CameraManager::new(cfg.manager)));
    if autostart {
        camera
            .lock()
            .map_err(|_| anyhow!("camera lock poisoned"))?
            .start()?;
    }
    let api_handle = ApiServer::new(api_cfg, camera.clone()).spawn()?;
    log::info!("control api listening on http://{}", api_handle.addr);

    log::info!("waiting for shutdown signal (Ctrl-C)...");
    let _ = shutdown.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    if let Ok(mut camera) = camera.lock() {
        camera.stop();
    }
    Ok(())
}

fn cmd_doctor(json: bool, smoke_test: bool, ui_mode: UiMode) -> Result<()> {
    let ui = Ui::new(
        ui_mode,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );
    let detector = Detector::new(SystemProbe::new());
    if json {
        let report = diagnostics::run_diagnostics(&detector, smoke_test);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let video_devices = {
        let mut stage = ui.stage("Video devices");
        let devices = diagnostics::list_video_devices(&detector);
        if devices.is_empty() {
            stage.warn("none found");
        } else {
            stage.ok(format!("{} found", devices.len()));
        }
        devices
    };
    let gstreamer = {
        let mut stage = ui.stage("GStreamer");
        let report = diagnostics::check_gstreamer(&detector);
        match (&report.version, report.elements_missing.is_empty()) {
            _ if !report.installed => stage.warn("not installed"),
            (version, true) => stage.ok(version.clone().unwrap_or_default()),
            (_, false) => stage.warn(format!("missing {}", report.elements_missing.join(", "))),
        }
        report
    };
    let pi_camera = {
        let mut stage = ui.stage("Pi camera");
        let report = diagnostics::check_pi_camera(&detector);
        match &report.command {
            Some(command) => stage.ok(command.clone()),
            None => stage.warn("rpicam-vid/libcamera-vid not found"),
        }
        report
    };
    let smoke_test = (smoke_test && gstreamer.installed).then(|| {
        let mut stage = ui.stage("Smoke pipeline");
        let result = diagnostics::run_smoke_test(&detector);
        if result.success {
            stage.ok("");
        } else {
            stage.warn(result.exit.clone().unwrap_or_else(|| "did not start".to_string()));
        }
        result
    });
    let usb_capture = video_devices
        .first()
        .filter(|_| smoke_test.is_some())
        .map(|device| {
            let mut stage = ui.stage(&format!("Capture from {}", device.path));
            let result = diagnostics::run_usb_capture_test(&detector, &device.path);
            if result.success {
                stage.ok("");
            } else {
                stage.warn(result.exit.clone().unwrap_or_else(|| "did not start".to_string()));
            }
            result
        });

    let report = diagnostics::DiagnosticReport {
        detected_backend: detector.detect(),
        video_devices,
        gstreamer,
        pi_camera,
        smoke_test,
        usb_capture,
    };

    println!("detected backend: {}", report.detected_backend);
    for device in &report.video_devices {
        println!("  {}  {} ({})", device.path, device.name, device.driver);
    }
    if let Some(path) = &report.gstreamer.path {
        println!("gst-launch-1.0: {}", path.display());
    }
    for camera in &report.pi_camera.cameras {
        println!("  {}", camera);
    }
    let hints = report.hints();
    if hints.is_empty() {
        println!("all checks passed");
    } else {
        println!();
        for hint in hints {
            println!("hint: {}", hint);
        }
    }
    Ok(())
}

fn cmd_devices() -> Result<()> {
    let detector = Detector::new(SystemProbe::new());
    let devices = diagnostics::list_video_devices(&detector);
    if devices.is_empty() {
        println!("no video devices found");
    }
    for device in &devices {
        println!("{}\t{}\t{}", device.path, device.name, device.driver);
    }
    println!("auto-detected backend: {}", detector.detect());
    Ok(())
}
