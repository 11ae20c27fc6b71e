//! Enrollment and check-in state machines.
//!
//! Both machines are synchronous and own no I/O. The kiosk actor drives
//! them: it performs camera, extraction and store calls, then feeds the
//! outcomes back through the `finish_*` transitions.

pub mod checkin;
pub mod enrollment;

pub use checkin::{CheckInSession, CheckInSnapshot, CheckInState};
pub use enrollment::{EnrollmentSession, EnrollmentSnapshot, EnrollmentState};

use crate::employee::FieldErrors;
use clockface_core::DEFAULT_MIN_SAMPLES;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Session tunables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Samples required before a signature may be computed.
    pub min_samples: usize,
    /// Capture is disabled once this many samples are held.
    pub max_samples: usize,
    /// Maximum Euclidean distance accepted as a match.
    pub match_threshold: f32,
    pub detection_poll_interval_ms: u64,
    /// Delay before a confirmed check-in returns to live detection.
    pub confirmed_auto_reset_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            max_samples: 5,
            // Conventional cutoff for 128-d dlib-style descriptors.
            match_threshold: 0.6,
            detection_poll_interval_ms: 100,
            confirmed_auto_reset_ms: 3000,
        }
    }
}

impl SessionConfig {
    pub fn detection_poll_interval(&self) -> Duration {
        Duration::from_millis(self.detection_poll_interval_ms)
    }

    pub fn confirmed_auto_reset(&self) -> Duration {
        Duration::from_millis(self.confirmed_auto_reset_ms)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("no face found in the captured frame")]
    ExtractionFailed,
    #[error("descriptor extraction unavailable: {0}")]
    Extractor(String),
    #[error("validation failed: {0}")]
    Validation(FieldErrors),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("another operation is still in progress")]
    Busy,
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("sample limit of {max} reached; remove a sample first")]
    SampleLimitReached { max: usize },
    #[error("no sample at index {index}")]
    NoSuchSample { index: usize },
    #[error("no active session")]
    NoActiveSession,
    #[error("operation cancelled by session teardown")]
    Cancelled,
}
