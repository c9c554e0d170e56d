//! Muxer sink: the external process that turns an H.264 byte stream into RTSP.
//!
//! The process is a black box behind `Sink`. Its input is single-writer and
//! closed exactly once; after `close_input` every write fails with
//! `SinkError::InputClosed`, and a dead process surfaces as a broken pipe.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::error::SinkError;

const EXIT_POLL: Duration = Duration::from_millis(50);
/// How long a muxer whose input is closed gets to exit on EOF before SIGTERM.
const EOF_GRACE: Duration = Duration::from_millis(500);

/// Program and arguments used to start the sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SinkCommand {
    /// `<program> -f h264 -framerate <fps> -i - -c:v copy -f rtsp -rtsp_transport tcp <url>`
    pub fn ffmpeg_rtsp(program: &str, frame_rate: f32, url: &str) -> Self {
        let args = [
            "-f",
            "h264",
            "-framerate",
            &frame_rate.to_string(),
            "-i",
            "-",
            "-c:v",
            "copy",
            "-f",
            "rtsp",
            "-rtsp_transport",
            "tcp",
            url,
        ];
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl fmt::Display for SinkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A running sink.
pub trait Sink: Send + Sync {
    /// Write one chunk of the elementary stream.
    fn write(&self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Close the input stream (EOF). Returns `true` for the call that closed it.
    fn close_input(&self) -> bool;

    /// Ask the process to exit, waiting up to `timeout` before killing it.
    /// Returns `true` when the kill was needed.
    fn terminate(&self, timeout: Duration) -> Result<bool>;

    /// Exit status if the process has already exited.
    fn try_exit(&self) -> Option<String>;
}

/// Starts sinks. Tests substitute a launcher that records the command.
pub trait SinkLauncher: Send + Sync {
    fn launch(&self, command: &SinkCommand) -> Result<Arc<dyn Sink>>;
}

/// `io::Write` adapter so the encoder pump can write straight into a sink.
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf).map_err(|err| match err {
            SinkError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::BrokenPipe, other.to_string()),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Input stream that is closed exactly once.
///
/// `close` never waits on a writer stuck in a full pipe: it marks the pipe
/// closed and the writer drops the handle when its write returns or on its
/// next write. `release` waits for the writer once the reader has exited.
pub(crate) struct InputPipe<W: Write> {
    closed: AtomicBool,
    writer: Mutex<Option<W>>,
}

impl<W: Write> InputPipe<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub(crate) fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            // `close` may have found the lock held; drop the handle here.
            guard.take();
            return Err(SinkError::InputClosed);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(SinkError::InputClosed);
        };
        let result = writer.write_all(bytes).and_then(|_| writer.flush());
        if self.closed.load(Ordering::SeqCst) {
            guard.take();
        }
        result.map_err(SinkError::from)
    }

    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.writer.try_lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            // A write is in flight; it drops the handle when it returns.
            Err(TryLockError::WouldBlock) => {}
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop the handle of a closed pipe if no write holds it.
    pub(crate) fn try_release(&self) -> bool {
        if !self.is_closed() {
            return false;
        }
        match self.writer.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
                true
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    /// Drop the handle of a closed pipe, waiting for an in-flight write.
    /// Only safe once the reader is gone, otherwise the write may never return.
    pub(crate) fn release(&self) {
        if self.is_closed() {
            self.writer.lock().unwrap_or_else(|p| p.into_inner()).take();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        match self.writer.try_lock() {
            Ok(guard) => guard.is_none(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_none(),
            Err(TryLockError::WouldBlock) => false,
        }
    }
}

/// Spawns the sink as a child process with piped stdin.
#[derive(Clone, Debug, Default)]
pub struct ProcessLauncher;

impl SinkLauncher for ProcessLauncher {
    fn launch(&self, command: &SinkCommand) -> Result<Arc<dyn Sink>> {
        log::info!("RtspPublisher: launching muxer: {}", command);
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn {} (is it installed and on PATH?)", command.program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} stdin not available", command.program))?;
        Ok(Arc::new(ProcessSink {
            program: command.program.clone(),
            input: InputPipe::new(stdin),
            child: Mutex::new(child),
            exit: Mutex::new(None),
        }))
    }
}

pub struct ProcessSink {
    program: String,
    input: InputPipe<ChildStdin>,
    child: Mutex<Child>,
    exit: Mutex<Option<String>>,
}

impl ProcessSink {
    pub fn pid(&self) -> u32 {
        self.child.lock().unwrap_or_else(|p| p.into_inner()).id()
    }

    fn poll_exit(&self) -> Option<String> {
        let mut exit = self.exit.lock().unwrap_or_else(|p| p.into_inner());
        if exit.is_some() {
            return exit.clone();
        }
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        match child.try_wait() {
            Ok(Some(status)) => *exit = Some(status.to_string()),
            Ok(None) => {}
            Err(err) => *exit = Some(format!("wait failed: {}", err)),
        }
        exit.clone()
    }

    fn wait_exit_until(&self, deadline: Instant) -> Option<String> {
        loop {
            if let Some(status) = self.poll_exit() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    fn request_stop(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            let pid = self.pid() as libc::pid_t;
            // SAFETY: plain kill(2) on a child we spawned and have not reaped.
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.child.lock().unwrap_or_else(|p| p.into_inner()).kill()
        }
    }

    fn force_kill(&self) -> Result<()> {
        // Same lock order as poll_exit: exit before child.
        let mut exit = self.exit.lock().unwrap_or_else(|p| p.into_inner());
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        child
            .kill()
            .with_context(|| format!("failed to kill {}", self.program))?;
        let status = child
            .wait()
            .with_context(|| format!("failed to reap {}", self.program))?;
        *exit = Some(status.to_string());
        Ok(())
    }
}

impl Sink for ProcessSink {
    fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        if let Some(status) = self.poll_exit() {
            return Err(SinkError::Exited(status));
        }
        self.input.write(bytes)
    }

    fn close_input(&self) -> bool {
        self.input.close()
    }

    fn terminate(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        if self.input.is_closed() {
            let grace = Instant::now() + EOF_GRACE.min(timeout / 2);
            if !self.input.try_release() {
                log::debug!("RtspPublisher: write in flight, EOF follows when it returns");
            }
            if let Some(status) = self.wait_exit_until(grace) {
                log::info!("RtspPublisher: {} exited ({})", self.program, status);
                self.input.release();
                return Ok(false);
            }
        }
        if let Err(err) = self.request_stop() {
            log::warn!("RtspPublisher: SIGTERM to {} failed: {}", self.program, err);
        }
        if let Some(status) = self.wait_exit_until(deadline) {
            log::info!("RtspPublisher: {} exited ({})", self.program, status);
            self.input.release();
            return Ok(false);
        }
        log::warn!(
            "RtspPublisher: {} ignored termination for {:?}, killing",
            self.program,
            timeout
        );
        self.force_kill()?;
        self.input.release();
        Ok(true)
    }

    fn try_exit(&self) -> Option<String> {
        self.poll_exit()
    }
}

impl Drop for ProcessSink {
    fn drop(&mut self) {
        self.input.close();
        if self.poll_exit().is_none() {
            if let Err(err) = self.force_kill() {
                log::warn!("RtspPublisher: {}", err);
            }
        }
    }
}
