//! MJPEG streaming server.
//!
//! Plain `std::net` HTTP/1.1: a non-blocking accept loop polls a shutdown flag
//! and hands each connection to its own worker thread. Routes:
//! - `GET /`           HTML viewer page
//! - `GET /video_feed` endless `multipart/x-mixed-replace` JPEG stream
//! - `GET /health`     JSON liveness and counters
//!
//! Every `/video_feed` connection owns its own `FrameBuffer` and captures
//! through the shared `Camera`, which serializes access to the sensor. The
//! camera lock is never held while writing to a socket. Frame pacing happens
//! under that lock, so N concurrent viewers each get about `frame_rate / N`.

mod page;

use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{Camera, StreamConfig};
use crate::error::CaptureError;
use crate::frame::{self, FrameBuffer};

pub use page::index_html;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Backoff after the sensor returned an empty frame.
pub const EMPTY_FRAME_BACKOFF: Duration = Duration::from_millis(50);
/// Backoff after a failed capture.
pub const CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Log achieved FPS every this many frames per connection.
pub const FPS_LOG_INTERVAL: u64 = 50;

#[derive(Clone, Debug)]
pub struct MjpegConfig {
    pub addr: String,
    /// Socket write timeout; a client that stops reading for this long is
    /// treated as disconnected.
    pub write_timeout: Duration,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct ServerStats {
    active_streams: AtomicUsize,
    frames_served: AtomicU64,
}

/// Handle to a running server.
pub struct MjpegHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    join: Option<JoinHandle<()>>,
}

impl MjpegHandle {
    /// Stop accepting, end every stream loop and wait for the workers.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("mjpeg server thread panicked"))?;
        }
        log::info!(
            "MjpegServer: stopped after serving {} frames",
            self.frames_served()
        );
        Ok(())
    }

    /// Number of `/video_feed` loops currently running.
    pub fn active_streams(&self) -> usize {
        self.stats.active_streams.load(Ordering::SeqCst)
    }

    /// Frames written across all connections since start.
    pub fn frames_served(&self) -> u64 {
        self.stats.frames_served.load(Ordering::SeqCst)
    }
}

pub struct MjpegServer {
    cfg: MjpegConfig,
    camera: Camera,
    stream: StreamConfig,
}

impl MjpegServer {
    /// `stream` is the configuration the camera was set up with; the server
    /// uses its quality for every capture and shows it on the index page.
    pub fn new(cfg: MjpegConfig, camera: Camera, stream: StreamConfig) -> Self {
        Self {
            cfg,
            camera,
            stream,
        }
    }

    pub fn spawn(self) -> Result<MjpegHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ServerStats::default());
        let ctx = Arc::new(ConnectionContext {
            camera: self.camera,
            stream: self.stream,
            write_timeout: self.cfg.write_timeout,
            shutdown: shutdown.clone(),
            stats: stats.clone(),
        });
        let join = std::thread::Builder::new()
            .name("mjpeg-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_acceptor(listener, ctx) {
                    log::error!("MjpegServer: accept loop stopped: {}", err);
                }
            })?;
        log::info!("MjpegServer: listening on http://{}", addr);

        Ok(MjpegHandle {
            addr,
            shutdown,
            stats,
            join: Some(join),
        })
    }
}

struct ConnectionContext {
    camera: Camera,
    stream: StreamConfig,
    write_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

fn run_acceptor(listener: TcpListener, ctx: Arc<ConnectionContext>) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("mjpeg-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, peer, &ctx) {
                            log::warn!("MjpegServer: request from {} failed: {}", peer, err);
                        }
                    });
                match spawned {
                    Ok(join) => {
                        workers.retain(|w| !w.is_finished());
                        workers.push(join);
                    }
                    Err(err) => log::error!("MjpegServer: cannot spawn worker: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => break Err(err.into()),
        }
    };

    for worker in workers {
        if worker.join().is_err() {
            log::error!("MjpegServer: connection worker panicked");
        }
    }
    result
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_response(&mut stream, 405, "text/plain", b"method not allowed")?;
        return Ok(());
    }
    match request.path.as_str() {
        "/" => {
            log::info!("MjpegServer: client {} requested index", peer);
            let html = index_html(&ctx.stream);
            write_response(&mut stream, 200, "text/html; charset=utf-8", html.as_bytes())
        }
        "/video_feed" => {
            log::info!("MjpegServer: client {} connected to /video_feed", peer);
            stream.set_write_timeout(Some(ctx.write_timeout))?;
            let _active = ActiveStream::enter(&ctx.stats);
            let outcome = stream_frames(&mut stream, peer, ctx);
            log::info!("MjpegServer: stream to {} ended: {}", peer, outcome);
            Ok(())
        }
        "/health" => {
            let body = serde_json::json!({
                "status": "ok",
                "active_streams": ctx.stats.active_streams.load(Ordering::SeqCst),
                "frames_served": ctx.stats.frames_served.load(Ordering::SeqCst),
            });
            write_response(&mut stream, 200, "application/json", body.to_string().as_bytes())
        }
        _ => write_response(&mut stream, 404, "text/plain", b"not found"),
    }
}

/// Why a `/video_feed` loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    ClientDisconnected,
    ServerShutdown,
    CameraStopped,
}

impl std::fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEnd::ClientDisconnected => f.write_str("client disconnected"),
            StreamEnd::ServerShutdown => f.write_str("server shutdown"),
            StreamEnd::CameraStopped => f.write_str("camera stopped"),
        }
    }
}

/// Decrements the active stream count when the loop exits, however it exits.
struct ActiveStream<'a>(&'a ServerStats);

impl<'a> ActiveStream<'a> {
    fn enter(stats: &'a ServerStats) -> Self {
        stats.active_streams.fetch_add(1, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveStream<'_> {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

fn stream_frames(stream: &mut TcpStream, peer: SocketAddr, ctx: &ConnectionContext) -> StreamEnd {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
        frame::MULTIPART_CONTENT_TYPE
    );
    if stream.write_all(header.as_bytes()).is_err() {
        return StreamEnd::ClientDisconnected;
    }

    let mut buffer = FrameBuffer::with_capacity(64 * 1024);
    let quality = ctx.stream.quality;
    let started = Instant::now();
    let mut frames = 0u64;

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            return StreamEnd::ServerShutdown;
        }
        match ctx.camera.capture_frame(quality, &mut buffer) {
            Ok(()) if buffer.is_empty() => {
                log::debug!("MjpegServer: empty frame for {}, retrying", peer);
                std::thread::sleep(EMPTY_FRAME_BACKOFF);
                continue;
            }
            Ok(()) => {}
            Err(CaptureError::Stopped) => return StreamEnd::CameraStopped,
            Err(err) => {
                log::warn!("MjpegServer: capture for {} failed: {}", peer, err);
                std::thread::sleep(CAPTURE_ERROR_BACKOFF);
                continue;
            }
        }

        if let Err(err) = frame::write_part(stream, buffer.as_bytes()) {
            log::debug!("MjpegServer: write to {} failed: {}", peer, err);
            return StreamEnd::ClientDisconnected;
        }
        frames += 1;
        ctx.stats.frames_served.fetch_add(1, Ordering::SeqCst);

        if frames % FPS_LOG_INTERVAL == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            log::info!(
                "MjpegServer: {} streaming at {:.2} fps ({} frames / {:.2} s)",
                peer,
                frames as f64 / elapsed.max(f64::EPSILON),
                frames,
                elapsed
            );
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
}
