//! Command lines for the external encoder/streamer processes.
//!
//! Building is pure: the builder resolves tool paths through the detector's
//! probe but never spawns anything.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use super::detect::{Detector, HostProbe, STREAMING_TOOL};
use super::{Backend, StreamConfig};
use crate::error::{StreamError, StreamResult};

/// RTP payload type for H.264.
pub const RTP_PAYLOAD_TYPE: u8 = 96;
/// Re-send SPS/PPS with every keyframe.
pub const RTP_CONFIG_INTERVAL: u32 = 1;

const GSTREAMER_HINT: &str = "install with: sudo apt install gstreamer1.0-tools gstreamer1.0-plugins-good";
const PI_CAMERA_HINT: &str = "install with: sudo apt install rpicam-apps";

/// One external process: program plus ordered arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Short program name for log lines.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Stage `from` writes its stdout into stage `to`'s stdin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PipeEdge {
    pub from: usize,
    pub to: usize,
}

/// Ordered stages of one streaming pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineSpec {
    pub backend: Backend,
    pub stages: Vec<CommandSpec>,
    pub pipe: Option<PipeEdge>,
}

impl PipelineSpec {
    /// Whether stage `index` reads its stdin from the previous stage.
    pub fn is_piped_into(&self, index: usize) -> bool {
        self.pipe.is_some_and(|edge| edge.to == index)
    }

    pub fn is_piped_from(&self, index: usize) -> bool {
        self.pipe.is_some_and(|edge| edge.from == index)
    }
}

impl fmt::Display for PipelineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 {
                let sep = if self.is_piped_into(index) { " | " } else { " ; " };
                f.write_str(sep)?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

/// Builds `PipelineSpec`s for a host.
pub struct PipelineBuilder<'a, P: HostProbe> {
    detector: &'a Detector<P>,
}

impl<'a, P: HostProbe> PipelineBuilder<'a, P> {
    pub fn new(detector: &'a Detector<P>) -> Self {
        Self { detector }
    }

    pub fn build(&self, backend: Backend, config: &StreamConfig) -> StreamResult<PipelineSpec> {
        match backend {
            Backend::PiCamera => self.build_pi_camera(config),
            Backend::UsbCamera => self.build_usb_camera(config),
            Backend::None => Err(StreamError::UnsupportedBackend(backend)),
        }
    }

    /// `rpicam-vid ... --output - | gst-launch-1.0 fdsrc ! ... ! udpsink`
    fn build_pi_camera(&self, config: &StreamConfig) -> StreamResult<PipelineSpec> {
        let (_, capture_tool) =
            self.detector
                .pi_camera_tool()
                .ok_or_else(|| StreamError::ToolNotFound {
                    tool: "rpicam-vid or libcamera-vid".to_string(),
                    hint: PI_CAMERA_HINT,
                })?;
        let gst = self.streaming_tool()?;

        let capture = CommandSpec::new(capture_tool)
            .args(["-t", "0"])
            .arg("--width")
            .arg(config.width.to_string())
            .arg("--height")
            .arg(config.height.to_string())
            .arg("--framerate")
            .arg(config.fps.to_string())
            .arg("--inline")
            .arg("-n")
            .args(["--codec", "h264"])
            .args(["--output", "-"]);

        let stream = CommandSpec::new(gst)
            .arg("-e")
            .args(["fdsrc", "!", "h264parse", "!"])
            .args(rtp_udp_tail(config));

        Ok(PipelineSpec {
            backend: Backend::PiCamera,
            stages: vec![capture, stream],
            pipe: Some(PipeEdge { from: 0, to: 1 }),
        })
    }

    /// `gst-launch-1.0 v4l2src ! caps ! videoconvert ! x264enc ! ... ! udpsink`
    fn build_usb_camera(&self, config: &StreamConfig) -> StreamResult<PipelineSpec> {
        let gst = self.streaming_tool()?;

        let stream = CommandSpec::new(gst)
            .arg("-e")
            .arg("v4l2src")
            .arg(format!("device={}", config.device))
            .arg("!")
            .arg(format!(
                "video/x-raw,width={},height={},framerate={}/1",
                config.width, config.height, config.fps
            ))
            .args(["!", "videoconvert", "!"])
            .arg("x264enc")
            .arg(format!("bitrate={}", config.bitrate))
            .arg("tune=zerolatency")
            .arg("speed-preset=superfast")
            .arg("!")
            .args(rtp_udp_tail(config));

        Ok(PipelineSpec {
            backend: Backend::UsbCamera,
            stages: vec![stream],
            pipe: None,
        })
    }

    fn streaming_tool(&self) -> StreamResult<PathBuf> {
        self.detector
            .streaming_tool()
            .ok_or_else(|| StreamError::ToolNotFound {
                tool: STREAMING_TOOL.to_string(),
                hint: GSTREAMER_HINT,
            })
    }
}

fn rtp_udp_tail(config: &StreamConfig) -> Vec<String> {
    vec![
        "rtph264pay".to_string(),
        format!("config-interval={}", RTP_CONFIG_INTERVAL),
        format!("pt={}", RTP_PAYLOAD_TYPE),
        "!".to_string(),
        "udpsink".to_string(),
        format!("host={}", config.target_ip),
        format!("port={}", config.target_port),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::detect::tests::FakeProbe;

    fn scenario_config() -> StreamConfig {
        StreamConfig {
            target_ip: "10.0.0.5".to_string(),
            target_port: 5000,
            backend: Some(Backend::UsbCamera),
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            bitrate: 400,
            auto_reconnect: true,
        }
    }

    fn full_host() -> Detector<FakeProbe> {
        Detector::new(FakeProbe::with_programs(&["rpicam-vid", "gst-launch-1.0"]))
    }

    #[test]
    fn usb_pipeline_is_single_stage_with_requested_parameters() {
        let detector = full_host();
        let spec = PipelineBuilder::new(&detector)
            .build(Backend::UsbCamera, &scenario_config())
            .unwrap();

        assert_eq!(spec.stages.len(), 1);
        assert_eq!(spec.pipe, None);
        let args = &spec.stages[0].args;
        assert!(args.contains(&"device=/dev/video0".to_string()));
        let caps = args
            .iter()
            .find(|arg| arg.starts_with("video/x-raw"))
            .expect("caps argument");
        assert!(caps.contains("640") && caps.contains("480") && caps.contains("30"));
        assert!(args.iter().any(|arg| arg.starts_with("bitrate=") && arg.contains("400")));
        let sink = args.iter().position(|arg| arg == "udpsink").expect("udpsink");
        assert_eq!(args[sink + 1], "host=10.0.0.5");
        assert_eq!(args[sink + 2], "port=5000");
    }

    #[test]
    fn pi_pipeline_pipes_capture_into_gstreamer() {
        let detector = full_host();
        let spec = PipelineBuilder::new(&detector)
            .build(Backend::PiCamera, &scenario_config())
            .unwrap();

        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.pipe, Some(PipeEdge { from: 0, to: 1 }));

        let capture = &spec.stages[0];
        assert_eq!(capture.name(), "rpicam-vid");
        assert!(capture.args.windows(2).any(|w| w == ["-t", "0"]));
        assert!(capture.args.windows(2).any(|w| w == ["--codec", "h264"]));
        assert!(capture.args.windows(2).any(|w| w == ["--output", "-"]));
        assert!(capture.args.contains(&"--inline".to_string()));

        let stream = &spec.stages[1].args;
        assert_eq!(&stream[..2], ["-e", "fdsrc"]);
        assert_eq!(&stream[stream.len() - 2..], ["host=10.0.0.5", "port=5000"]);
        assert!(stream.contains(&"pt=96".to_string()));
    }

    #[test]
    fn building_is_deterministic() {
        let detector = full_host();
        let builder = PipelineBuilder::new(&detector);
        let config = scenario_config();
        for backend in [Backend::PiCamera, Backend::UsbCamera] {
            assert_eq!(
                builder.build(backend, &config).unwrap(),
                builder.build(backend, &config).unwrap()
            );
        }
    }

    #[test]
    fn none_backend_is_unsupported() {
        let detector = full_host();
        let err = PipelineBuilder::new(&detector)
            .build(Backend::None, &scenario_config())
            .unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedBackend(Backend::None)));
    }

    #[test]
    fn missing_gstreamer_is_reported_with_hint() {
        let detector = Detector::new(FakeProbe::with_programs(&["rpicam-vid"]));
        let err = PipelineBuilder::new(&detector)
            .build(Backend::PiCamera, &scenario_config())
            .unwrap_err();
        match err {
            StreamError::ToolNotFound { tool, hint } => {
                assert_eq!(tool, "gst-launch-1.0");
                assert!(hint.contains("apt install"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn display_joins_piped_stages() {
        let detector = full_host();
        let spec = PipelineBuilder::new(&detector)
            .build(Backend::PiCamera, &scenario_config())
            .unwrap();
        let rendered = spec.to_string();
        assert!(rendered.contains("--output - | /usr/bin/gst-launch-1.0 -e fdsrc"));
    }
}
