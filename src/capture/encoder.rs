//! Continuous encoder pump.
//!
//! Moves H.264 chunks from the camera into the configured output on a
//! dedicated thread. A write failure ends the pump with the error recorded; it
//! never retries into a dead pipe.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::Camera;
use crate::error::CaptureError;

/// Poll interval while the encoder runs ahead of `Camera::start`.
const IDLE_POLL: Duration = Duration::from_millis(10);
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct PumpStats {
    chunks: AtomicU64,
    bytes: AtomicU64,
    fault: Mutex<Option<String>>,
}

/// Summary returned when the encoder stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncoderReport {
    pub chunks_written: u64,
    pub bytes_written: u64,
    /// Why the pump ended early, if it did.
    pub fault: Option<String>,
}

/// Running encoder. Dropping it without `stop()` detaches the pump thread.
pub struct Encoder {
    stop: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
    join: Option<JoinHandle<()>>,
}

impl Encoder {
    pub(super) fn spawn(
        camera: Camera,
        output: Box<dyn Write + Send>,
    ) -> Result<Self, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PumpStats::default());
        let stop_thread = stop.clone();
        let stats_thread = stats.clone();
        let join = std::thread::Builder::new()
            .name("h264-encoder".to_string())
            .spawn(move || {
                if let Err(err) = run_pump(&camera, output, &stop_thread, &stats_thread) {
                    if stop_thread.load(Ordering::SeqCst) {
                        log::debug!("Encoder: output closed during shutdown: {}", err);
                    } else {
                        log::warn!("Encoder: output failed, stopping pump: {}", err);
                        *lock_fault(&stats_thread) = Some(err.to_string());
                    }
                }
            })
            .map_err(|e| CaptureError::Device(format!("spawn encoder thread: {}", e)))?;
        Ok(Self {
            stop,
            stats,
            join: Some(join),
        })
    }

    /// False once the pump has exited, either via `stop()` or a fault.
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// The error that ended the pump, if any.
    pub fn fault(&self) -> Option<String> {
        lock_fault(&self.stats).clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes.load(Ordering::SeqCst)
    }

    /// Ask the pump to stop after its current chunk without waiting for it.
    /// A write that fails from here on is not recorded as a fault.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop the pump and wait for its last write to finish.
    pub fn stop(mut self) -> EncoderReport {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                *lock_fault(&self.stats) = Some("encoder thread panicked".to_string());
            }
        }
        EncoderReport {
            chunks_written: self.stats.chunks.load(Ordering::SeqCst),
            bytes_written: self.stats.bytes.load(Ordering::SeqCst),
            fault: lock_fault(&self.stats).clone(),
        }
    }
}

fn lock_fault(stats: &PumpStats) -> std::sync::MutexGuard<'_, Option<String>> {
    stats
        .fault
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_pump(
    camera: &Camera,
    mut output: Box<dyn Write + Send>,
    stop: &AtomicBool,
    stats: &PumpStats,
) -> anyhow::Result<()> {
    let mut chunk = Vec::with_capacity(64 * 1024);
    while !stop.load(Ordering::SeqCst) {
        match camera.read_chunk(&mut chunk) {
            Ok(()) if chunk.is_empty() => std::thread::sleep(IDLE_POLL),
            Ok(()) => {
                output.write_all(&chunk)?;
                stats.chunks.fetch_add(1, Ordering::SeqCst);
                stats
                    .bytes
                    .fetch_add(chunk.len() as u64, Ordering::SeqCst);
            }
            Err(CaptureError::NotStarted) => std::thread::sleep(IDLE_POLL),
            Err(CaptureError::Stopped) => break,
            Err(err) if err.is_retryable() => {
                log::warn!("Encoder: {}", err);
                std::thread::sleep(RETRY_BACKOFF);
            }
            Err(err) => return Err(err.into()),
        }
    }
    if let Err(err) = output.flush() {
        log::debug!("Encoder: flush on stop failed: {}", err);
    }
    Ok(())
}
