use thiserror::Error;

use crate::camera::Backend;

/// Failures surfaced by the streaming core.
///
/// Transient process crashes never show up here: the watchdog absorbs them
/// until its attempt ceiling is reached.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no camera detected; attach a USB webcam or enable the Pi camera")]
    NoBackendAvailable,

    #[error("{tool} not found on the search path; {hint}")]
    ToolNotFound { tool: String, hint: &'static str },

    #[error("unsupported camera backend: {0}")]
    UnsupportedBackend(Backend),

    #[error("failed to launch {program}: {source}")]
    ProcessLaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline kept failing; gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("pipeline exited and auto-reconnect is disabled")]
    ReconnectDisabled,

    #[error("stream session lock poisoned")]
    SessionPoisoned,
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
