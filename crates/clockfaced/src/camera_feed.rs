//! Continuous frame pump over an acquired camera.
//!
//! The latest frame is published on a `watch` channel, so the detection
//! poll and explicit captures read frames without waiting on each other.

use clockface_hw::{CameraError, CameraSource, CaptureConstraints, Frame, FrameStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consecutive read failures after which the camera is considered lost.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const FAILURE_BACKOFF: Duration = Duration::from_millis(50);

pub type LatestFrame = watch::Receiver<Option<Arc<Frame>>>;

/// Exclusive handle on an acquired camera.
pub struct CameraFeed {
    frames: LatestFrame,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl CameraFeed {
    /// Acquire the camera and start pumping frames.
    pub async fn acquire(
        source: Arc<dyn CameraSource>,
        constraints: CaptureConstraints,
    ) -> Result<Self, CameraError> {
        let stream = tokio::task::spawn_blocking(move || source.acquire(&constraints))
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("camera open task failed: {e}")))??;

        let (tx, rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let pump = tokio::task::spawn_blocking({
            let stop = Arc::clone(&stop);
            move || run_pump(stream, tx, stop)
        });

        tracing::debug!("camera feed started");
        Ok(Self {
            frames: rx,
            stop,
            pump: Some(pump),
        })
    }

    /// Receiver for the latest frame. Reports an error once the pump has ended.
    pub fn subscribe(&self) -> LatestFrame {
        self.frames.clone()
    }

    /// Stop the pump and wait until the device has been closed.
    pub async fn release(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "camera pump task failed");
            }
        }
        tracing::debug!("camera feed released");
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn run_pump(
    mut stream: Box<dyn FrameStream>,
    tx: watch::Sender<Option<Arc<Frame>>>,
    stop: Arc<AtomicBool>,
) {
    let mut failures = 0u32;
    while !stop.load(Ordering::Relaxed) {
        match stream.next_frame() {
            Ok(frame) => {
                failures = 0;
                if tx.send(Some(Arc::new(frame))).is_err() {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "frame read failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!("camera lost; stopping feed");
                    break;
                }
                std::thread::sleep(FAILURE_BACKOFF);
            }
        }
    }
    // Dropping the stream closes the device; dropping `tx` tells subscribers.
    drop(stream);
}
