//! Periodic face-presence poll over the live camera feed.
//!
//! Only reports presence; it never advances session state itself.

use crate::camera_feed::LatestFrame;
use crate::extractor::DescriptorExtractor;
use crate::kiosk::Event;
use clockface_core::BoundingBox;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionUpdate {
    Presence(Option<BoundingBox>),
    /// The feed ended underneath the poll.
    CameraLost,
}

/// Spawn the poll for one camera acquisition, tagged with its `epoch`.
///
/// The task ends when the feed ends, when the event channel closes, or when
/// the returned handle is aborted.
pub fn spawn_detection_poll(
    epoch: u64,
    mut frames: LatestFrame,
    extractor: Arc<dyn DescriptorExtractor>,
    interval: Duration,
    events: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let update = match frames.has_changed() {
                Err(_) => DetectionUpdate::CameraLost,
                Ok(false) => continue,
                Ok(true) => {
                    let frame = frames.borrow_and_update().clone();
                    let Some(frame) = frame else { continue };
                    if frame.is_dark {
                        DetectionUpdate::Presence(None)
                    } else {
                        match extractor.detect(&frame).await {
                            Ok(detection) => {
                                DetectionUpdate::Presence(detection.map(|d| d.bounding_box))
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "detection poll failed");
                                DetectionUpdate::Presence(None)
                            }
                        }
                    }
                }
            };

            let lost = update == DetectionUpdate::CameraLost;
            if events.send(Event::Detection { epoch, update }).await.is_err() || lost {
                break;
            }
        }
        tracing::trace!(epoch, "detection poll stopped");
    })
}
