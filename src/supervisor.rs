//! Process lifecycle: termination signals, shutdown reasons, run-once teardown.
//!
//! Signal handlers only send on a channel. The main thread blocks in
//! `Supervisor::wait` and runs teardown itself behind a `ShutdownGuard`.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::rtsp::Sink;

/// Watchdog poll interval for the muxer process.
pub const SINK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM.
    Signal,
    /// The muxer process exited on its own.
    SinkExited(String),
    /// An unrecoverable error after the process started serving.
    StartupFailed(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Signal => 0,
            ShutdownReason::SinkExited(_) | ShutdownReason::StartupFailed(_) => 1,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => f.write_str("termination signal"),
            ShutdownReason::SinkExited(status) => write!(f, "muxer exited ({})", status),
            ShutdownReason::StartupFailed(err) => write!(f, "startup failed: {}", err),
        }
    }
}

/// Cloneable handle that requests shutdown. Only the first request counts.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Sender<ShutdownReason>,
    fired: Arc<AtomicBool>,
}

impl ShutdownTrigger {
    /// Returns `true` if this call was the one that requested shutdown.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The receiver lives as long as the supervisor; a send error means
        // nobody is waiting any more.
        let _ = self.tx.send(reason);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

pub struct Supervisor {
    trigger: ShutdownTrigger,
    rx: Mutex<Receiver<ShutdownReason>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            trigger: ShutdownTrigger {
                tx,
                fired: Arc::new(AtomicBool::new(false)),
            },
            rx: Mutex::new(rx),
        }
    }

    /// Route SIGINT and SIGTERM to `ShutdownReason::Signal`.
    ///
    /// Can be installed once per process.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let trigger = self.trigger.clone();
        ctrlc::set_handler(move || {
            if !trigger.fire(ShutdownReason::Signal) {
                log::warn!("Supervisor: shutdown already in progress");
            }
        })
        .context("error setting SIGINT/SIGTERM handler")?;
        Ok(())
    }

    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.trigger.fire(reason)
    }

    pub fn handle(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.trigger.is_fired()
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) -> ShutdownReason {
        let rx = self.rx.lock().unwrap_or_else(|p| p.into_inner());
        rx.recv().unwrap_or(ShutdownReason::Signal)
    }

    /// Like `wait`, giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ShutdownReason> {
        let rx = self.rx.lock().unwrap_or_else(|p| p.into_inner());
        match rx.recv_timeout(timeout) {
            Ok(reason) => Some(reason),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ShutdownReason::Signal),
        }
    }

    /// Poll `sink` until it exits or shutdown starts. An exit while nothing
    /// has requested shutdown triggers `SinkExited`.
    pub fn watch_sink(&self, sink: Arc<dyn Sink>) -> Result<JoinHandle<()>> {
        self.watch_sink_every(sink, SINK_POLL_INTERVAL)
    }

    pub fn watch_sink_every(&self, sink: Arc<dyn Sink>, interval: Duration) -> Result<JoinHandle<()>> {
        let trigger = self.trigger.clone();
        std::thread::Builder::new()
            .name("sink-watchdog".to_string())
            .spawn(move || {
                while !trigger.is_fired() {
                    if let Some(status) = sink.try_exit() {
                        if trigger.fire(ShutdownReason::SinkExited(status.clone())) {
                            log::error!("Supervisor: muxer exited unexpectedly ({})", status);
                        }
                        return;
                    }
                    std::thread::sleep(interval);
                }
            })
            .context("spawn sink watchdog")
    }
}

/// Runs teardown at most once, however many paths reach it.
#[derive(Debug, Default)]
pub struct ShutdownGuard {
    done: AtomicBool,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `teardown` if no earlier call did; otherwise return `None`.
    pub fn run_once<T>(&self, teardown: impl FnOnce() -> T) -> Option<T> {
        if self.done.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(teardown())
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
