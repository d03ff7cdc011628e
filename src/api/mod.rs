//! HTTP control surface for the camera stream.
//!
//! Routes:
//! - `GET /health`
//! - `POST /stream/start` with an optional `{"ip": "...", "port": N}` body
//! - `POST /stream/stop`
//! - `GET /stream/status`
//!
//! One listener thread serves requests sequentially; every route is a thin
//! translation onto `CameraManager`.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::camera::{CameraManager, HostProbe};
use crate::config::validate_stream;

const MAX_REQUEST_BYTES: usize = 8192;

/// Requests answered with a 4xx before routing.
#[derive(Debug, thiserror::Error)]
enum RequestRejected {
    #[error("request too large")]
    TooLarge,
    #[error("{0}")]
    Malformed(&'static str),
}

impl RequestRejected {
    fn status(&self) -> u16 {
        match self {
            RequestRejected::TooLarge => 413,
            RequestRejected::Malformed(_) => 400,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("control api thread panicked"))?;
        }
        Ok(())
    }
}

/// Body of `POST /stream/start`.
#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    ip: Option<String>,
    port: Option<u16>,
}

pub struct ApiServer<P: HostProbe + 'static> {
    cfg: ApiConfig,
    manager: Arc<Mutex<CameraManager<P>>>,
}

impl<P: HostProbe + 'static> ApiServer<P> {
    pub fn new(cfg: ApiConfig, manager: Arc<Mutex<CameraManager<P>>>) -> Self {
        Self { cfg, manager }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let manager = self.manager;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &manager, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api<P: HostProbe>(
    listener: TcpListener,
    manager: &Mutex<CameraManager<P>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, manager) {
                    log::warn!("control api request from {} rejected: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection<P: HostProbe>(
    mut stream: TcpStream,
    manager: &Mutex<CameraManager<P>>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            if let Some(rejected) = err.downcast_ref::<RequestRejected>() {
                let body = json!({"error": rejected.to_string()});
                write_json_response(&mut stream, rejected.status(), &body)?;
            }
            return Err(err);
        }
    };
    let route = (request.method.as_str(), request.path.as_str());
    log::debug!("control api {} {}", route.0, route.1);

    let known_path = matches!(
        route.1,
        "/health" | "/stream/start" | "/stream/stop" | "/stream/status"
    );
    let (status, body) = match route {
        ("GET", "/health") => (200, json!({"status": "ok"})),
        ("GET", "/stream/status") => {
            let cam = lock_manager(manager)?;
            (200, serde_json::to_value(cam.status())?)
        }
        ("POST", "/stream/start") => start_stream(manager, &request.body)?,
        ("POST", "/stream/stop") => {
            lock_manager(manager)?.stop();
            (200, json!({"status": "stopped"}))
        }
        _ if known_path => (405, json!({"error": "method_not_allowed"})),
        _ => (404, json!({"error": "not_found"})),
    };
    write_json_response(&mut stream, status, &body)
}

fn start_stream<P: HostProbe>(
    manager: &Mutex<CameraManager<P>>,
    body: &[u8],
) -> Result<(u16, serde_json::Value)> {
    let start: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice(body) {
            Ok(start) => start,
            Err(e) => return Ok((400, json!({"error": format!("invalid body: {e}")}))),
        }
    };

    let mut cam = lock_manager(manager)?;
    let mut config = cam.config().clone();
    if let Some(ip) = start.ip {
        config.target_ip = ip;
    }
    if let Some(port) = start.port {
        config.target_port = port;
    }
    if let Err(e) = validate_stream(&config) {
        return Ok((400, json!({"error": e.to_string()})));
    }

    match cam.start_with(config) {
        Ok(()) => {
            let status = cam.status();
            Ok((
                200,
                json!({"status": status.state, "target": status.target}),
            ))
        }
        Err(e) => Ok((500, json!({"error": e.to_string()}))),
    }
}

fn lock_manager<P: HostProbe>(
    manager: &Mutex<CameraManager<P>>,
) -> Result<std::sync::MutexGuard<'_, CameraManager<P>>> {
    manager
        .lock()
        .map_err(|_| anyhow!("camera manager lock poisoned"))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break None;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(RequestRejected::TooLarge.into());
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break Some(pos + 4);
        }
    };
    let header_end = header_end.unwrap_or(data.len());

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or(RequestRejected::Malformed("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or(RequestRejected::Malformed("missing method"))?;
    let raw_path = parts
        .next()
        .ok_or(RequestRejected::Malformed("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| RequestRejected::Malformed("invalid content-length"))?,
        None => 0,
    };
    if header_end
        .checked_add(content_length)
        .map_or(true, |total| total > MAX_REQUEST_BYTES)
    {
        return Err(RequestRejected::TooLarge.into());
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(
    stream: &mut TcpStream,
    status: u16,
    body: &serde_json::Value,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
