use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::camera::{
    parse_backend_override, Detector, ManagerConfig, ShutdownTimings, StreamConfig, SystemProbe,
    WatchdogConfig,
};

const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RoverConfigFile {
    stream: Option<StreamConfigFile>,
    watchdog: Option<WatchdogConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    target_ip: Option<String>,
    target_port: Option<u16>,
    backend: Option<String>,
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    bitrate: Option<u32>,
    auto_reconnect: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WatchdogConfigFile {
    poll_interval_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    join_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ShutdownConfigFile {
    grace_ms: Option<u64>,
    kill_wait_ms: Option<u64>,
    restart_settle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

/// Runtime configuration: TOML file (`ROVER_CAM_CONFIG`), then environment
/// overrides, then validation.
#[derive(Debug, Clone)]
pub struct RoverConfig {
    pub manager: ManagerConfig,
    pub api_addr: String,
}

impl RoverConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROVER_CAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.manager.stream
    }

    pub fn stream_mut(&mut self) -> &mut StreamConfig {
        &mut self.manager.stream
    }

    fn from_file(file: RoverConfigFile) -> Result<Self> {
        let defaults = ManagerConfig::default();
        let stream_file = file.stream.unwrap_or_default();
        let backend = match stream_file.backend.as_deref() {
            Some(value) => parse_backend_override(value)?,
            None => None,
        };
        let device = stream_file
            .device
            .unwrap_or_else(|| Detector::new(SystemProbe::new()).default_device());
        let stream = StreamConfig {
            target_ip: stream_file
                .target_ip
                .unwrap_or(defaults.stream.target_ip),
            target_port: stream_file.target_port.unwrap_or(defaults.stream.target_port),
            backend,
            device,
            width: stream_file.width.unwrap_or(defaults.stream.width),
            height: stream_file.height.unwrap_or(defaults.stream.height),
            fps: stream_file.fps.unwrap_or(defaults.stream.fps),
            bitrate: stream_file.bitrate.unwrap_or(defaults.stream.bitrate),
            auto_reconnect: stream_file
                .auto_reconnect
                .unwrap_or(defaults.stream.auto_reconnect),
        };

        let watchdog_file = file.watchdog.unwrap_or_default();
        let watchdog = WatchdogConfig {
            poll_interval: millis_or(watchdog_file.poll_interval_ms, defaults.watchdog.poll_interval),
            reconnect_delay: millis_or(
                watchdog_file.reconnect_delay_ms,
                defaults.watchdog.reconnect_delay,
            ),
            max_reconnect_attempts: watchdog_file
                .max_reconnect_attempts
                .unwrap_or(defaults.watchdog.max_reconnect_attempts),
            ..defaults.watchdog
        };

        let shutdown_file = file.shutdown.unwrap_or_default();
        let shutdown = ShutdownTimings {
            grace: millis_or(shutdown_file.grace_ms, defaults.shutdown.grace),
            kill_wait: millis_or(shutdown_file.kill_wait_ms, defaults.shutdown.kill_wait),
        };

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        Ok(Self {
            manager: ManagerConfig {
                stream,
                watchdog,
                shutdown,
                join_timeout: millis_or(watchdog_file.join_timeout_ms, defaults.join_timeout),
                settle_delay: millis_or(shutdown_file.restart_settle_ms, defaults.settle_delay),
            },
            api_addr,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        let stream = &mut self.manager.stream;
        if let Ok(ip) = std::env::var("ROVER_CAM_TARGET_IP") {
            if !ip.trim().is_empty() {
                stream.target_ip = ip.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("ROVER_CAM_TARGET_PORT") {
            stream.target_port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROVER_CAM_TARGET_PORT must be a UDP port number"))?;
        }
        if let Ok(backend) = std::env::var("ROVER_CAM_BACKEND") {
            stream.backend = parse_backend_override(&backend)?;
        }
        if let Ok(device) = std::env::var("ROVER_CAM_DEVICE") {
            if !device.trim().is_empty() {
                stream.device = device.trim().to_string();
            }
        }
        if let Ok(flag) = std::env::var("ROVER_CAM_AUTO_RECONNECT") {
            stream.auto_reconnect = parse_bool(&flag).ok_or_else(|| {
                anyhow!("ROVER_CAM_AUTO_RECONNECT must be one of true/false/1/0/yes/no")
            })?;
        }
        if let Ok(addr) = std::env::var("ROVER_CAM_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_stream(&self.manager.stream)?;
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.api_addr, e))?;
        if self.manager.watchdog.poll_interval.is_zero() {
            return Err(anyhow!("watchdog poll interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Checks caller-supplied stream parameters before they reach a command line.
pub fn validate_stream(stream: &StreamConfig) -> Result<()> {
    let ip = stream.target_ip.as_str();
    if ip.is_empty() || ip.chars().any(|c| c.is_whitespace() || c == '!') {
        return Err(anyhow!("invalid target address '{}'", ip));
    }
    if stream.target_port == 0 {
        return Err(anyhow!("target port must be greater than zero"));
    }
    if stream.device.is_empty() || stream.device.chars().any(char::is_whitespace) {
        return Err(anyhow!("invalid video device '{}'", stream.device));
    }
    for (name, value) in [
        ("width", stream.width),
        ("height", stream.height),
        ("fps", stream.fps),
        ("bitrate", stream.bitrate),
    ] {
        if value == 0 {
            return Err(anyhow!("{} must be greater than zero", name));
        }
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<RoverConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Backend;

    #[test]
    fn empty_file_yields_defaults() {
        let file: RoverConfigFile = toml::from_str("").unwrap();
        let cfg = RoverConfig::from_file(file).unwrap();
        assert_eq!(cfg.stream().target(), "127.0.0.1:5000");
        assert_eq!(cfg.stream().backend, None);
        assert_eq!(cfg.manager.watchdog.max_reconnect_attempts, 5);
        assert_eq!(cfg.manager.shutdown, ShutdownTimings::default());
        assert_eq!(cfg.manager.join_timeout, Duration::from_secs(5));
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
    }

    #[test]
    fn file_sections_override_defaults() {
        let file: RoverConfigFile = toml::from_str(
            r#"
            [stream]
            backend = "usb"
            device = "/dev/video2"
            bitrate = 800

            [watchdog]
            max_reconnect_attempts = 2
            reconnect_delay_ms = 250

            [shutdown]
            grace_ms = 1000
            "#,
        )
        .unwrap();
        let cfg = RoverConfig::from_file(file).unwrap();
        assert_eq!(cfg.stream().backend, Some(Backend::UsbCamera));
        assert_eq!(cfg.stream().device, "/dev/video2");
        assert_eq!(cfg.stream().bitrate, 800);
        assert_eq!(cfg.manager.watchdog.max_reconnect_attempts, 2);
        assert_eq!(cfg.manager.watchdog.reconnect_delay, Duration::from_millis(250));
        assert_eq!(cfg.manager.shutdown.grace, Duration::from_secs(1));
        assert_eq!(cfg.manager.shutdown.kill_wait, Duration::from_secs(2));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<RoverConfigFile>("[stream]\nframerate = 30\n").is_err());
    }

    #[test]
    fn stream_validation_rejects_pipeline_injection() {
        let mut stream = StreamConfig::default();
        assert!(validate_stream(&stream).is_ok());
        stream.target_ip = "10.0.0.5 ! fakesink".to_string();
        assert!(validate_stream(&stream).is_err());
        stream.target_ip = "10.0.0.5".to_string();
        stream.fps = 0;
        assert!(validate_stream(&stream).is_err());
    }

    #[test]
    fn parses_boolean_flags() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
