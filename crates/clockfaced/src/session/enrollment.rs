//! Enrollment: capture 3–5 samples, validate the form, submit one signature.
//!
//! ```text
//! Idle → CameraActive ⇄ Capturing → SampleCollected / ReadyToSubmit
//!      → Submitting → Submitted | SubmitFailed
//! ```
//!
//! `CameraActive`, `SampleCollected` and `ReadyToSubmit` are the live
//! states; which one applies follows from the sample count. Face presence
//! is tracked alongside the state and only gates capture. Capturing or
//! removing a sample from `SubmitFailed` returns to the live state.

use super::{SessionConfig, SessionError};
use crate::employee::{self, EmployeeMetadata, FieldErrors};
use chrono::{DateTime, Utc};
use clockface_core::{AggregateError, BoundingBox, CapturedSample, CentroidAggregator, FaceDescriptor};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum EnrollmentState {
    Idle,
    CameraActive,
    Capturing,
    SampleCollected,
    ReadyToSubmit,
    Submitting,
    Submitted,
    SubmitFailed { reason: String },
}

impl EnrollmentState {
    pub fn name(&self) -> &'static str {
        match self {
            EnrollmentState::Idle => "idle",
            EnrollmentState::CameraActive => "camera_active",
            EnrollmentState::Capturing => "capturing",
            EnrollmentState::SampleCollected => "sample_collected",
            EnrollmentState::ReadyToSubmit => "ready_to_submit",
            EnrollmentState::Submitting => "submitting",
            EnrollmentState::Submitted => "submitted",
            EnrollmentState::SubmitFailed { .. } => "submit_failed",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            EnrollmentState::CameraActive
                | EnrollmentState::SampleCollected
                | EnrollmentState::ReadyToSubmit
        )
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, EnrollmentState::Capturing | EnrollmentState::Submitting)
    }

    /// Live states plus `SubmitFailed`, where the camera stays open and the
    /// sample set can still be edited before resubmitting.
    pub fn accepts_samples(&self) -> bool {
        self.is_live() || matches!(self, EnrollmentState::SubmitFailed { .. })
    }
}

/// Metadata and signature handed to the store on submit.
#[derive(Debug, Clone)]
pub struct Submission {
    pub metadata: EmployeeMetadata,
    pub signature: FaceDescriptor,
}

/// Thumbnail listing entry; the image itself is fetched by index.
#[derive(Debug, Clone, Serialize)]
pub struct SampleThumbnail {
    pub index: usize,
    pub captured_at: DateTime<Utc>,
    pub png_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentSnapshot {
    pub camera_active: bool,
    pub state: EnrollmentState,
    pub face_detected: bool,
    pub face_box: Option<BoundingBox>,
    pub samples: Vec<SampleThumbnail>,
    pub min_samples: usize,
    pub max_samples: usize,
    pub can_capture: bool,
    pub is_processing: bool,
    pub field_errors: FieldErrors,
    pub last_error: Option<String>,
}

pub struct EnrollmentSession {
    min_samples: usize,
    max_samples: usize,
    state: EnrollmentState,
    face: Option<BoundingBox>,
    samples: Vec<CapturedSample>,
    field_errors: FieldErrors,
    last_error: Option<SessionError>,
    /// Metadata of the last submission, reused on retry.
    submitted: Option<EmployeeMetadata>,
}

impl EnrollmentSession {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            min_samples: config.min_samples.max(1),
            max_samples: config.max_samples.max(config.min_samples.max(1)),
            state: EnrollmentState::Idle,
            face: None,
            samples: Vec::new(),
            field_errors: FieldErrors::default(),
            last_error: None,
            submitted: None,
        }
    }

    pub fn state(&self) -> &EnrollmentState {
        &self.state
    }

    pub fn samples(&self) -> &[CapturedSample] {
        &self.samples
    }

    pub fn face_detected(&self) -> bool {
        self.face.is_some()
    }

    pub fn field_errors(&self) -> &FieldErrors {
        &self.field_errors
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    /// Whether the capture command is currently enabled.
    pub fn can_capture(&self) -> bool {
        self.state.accepts_samples()
            && self.face.is_some()
            && self.samples.len() < self.max_samples
    }

    /// `Idle → CameraActive` once the camera has been acquired.
    pub fn camera_started(&mut self) -> Result<(), SessionError> {
        if self.state != EnrollmentState::Idle {
            return Err(self.invalid("start camera"));
        }
        self.last_error = None;
        self.state = self.live_state();
        Ok(())
    }

    /// The camera could not be acquired or was lost. Fatal to the session:
    /// back to `Idle` with samples discarded and the error surfaced.
    pub fn camera_failed(&mut self, error: SessionError) {
        self.reset();
        self.last_error = Some(error);
    }

    /// Update the live detection flag. Never changes the state.
    pub fn set_face(&mut self, face: Option<BoundingBox>) {
        if self.state.accepts_samples() || self.state.is_processing() {
            self.face = face;
        }
    }

    /// Live state or `SubmitFailed` → `Capturing`. Rejected unless a face is currently detected
    /// and fewer than `max_samples` are held.
    pub fn begin_capture(&mut self) -> Result<(), SessionError> {
        if self.state.is_processing() {
            return Err(SessionError::Busy);
        }
        if !self.state.accepts_samples() {
            return Err(self.invalid("capture"));
        }
        if self.samples.len() >= self.max_samples {
            return Err(SessionError::SampleLimitReached {
                max: self.max_samples,
            });
        }
        if self.face.is_none() {
            return Err(SessionError::NoFaceDetected);
        }
        self.last_error = None;
        self.state = EnrollmentState::Capturing;
        Ok(())
    }

    /// `Capturing → live state`. A failed extraction drops the capture and
    /// records the reason; nothing partial is stored.
    pub fn finish_capture(
        &mut self,
        outcome: Result<CapturedSample, SessionError>,
    ) -> Result<(), SessionError> {
        if self.state != EnrollmentState::Capturing {
            return Err(self.invalid("finish capture"));
        }
        match outcome {
            Ok(sample) => {
                self.samples.push(sample);
                tracing::info!(count = self.samples.len(), "enrollment sample accepted");
            }
            Err(error) => {
                tracing::warn!(%error, "enrollment capture dropped");
                self.last_error = Some(error);
            }
        }
        self.state = self.live_state();
        Ok(())
    }

    /// Remove sample `index`; the remaining samples keep their data and order.
    pub fn remove_sample(&mut self, index: usize) -> Result<CapturedSample, SessionError> {
        if self.state.is_processing() {
            return Err(SessionError::Busy);
        }
        if !self.state.accepts_samples() {
            return Err(self.invalid("remove sample"));
        }
        if index >= self.samples.len() {
            return Err(SessionError::NoSuchSample { index });
        }
        let removed = self.samples.remove(index);
        self.state = self.live_state();
        Ok(removed)
    }

    /// Validate form and sample count as one check, then compute the signature.
    ///
    /// On any violation every failing field is reported and the state is
    /// unchanged. On success the session enters `Submitting`.
    pub fn begin_submit(&mut self, metadata: EmployeeMetadata) -> Result<Submission, SessionError> {
        if self.state.is_processing() {
            return Err(SessionError::Busy);
        }
        let retrying = matches!(self.state, EnrollmentState::SubmitFailed { .. });
        if !self.state.is_live() && !retrying {
            return Err(self.invalid("submit"));
        }

        let errors = employee::validate(&metadata, self.samples.len(), self.min_samples);
        if !errors.is_empty() {
            self.field_errors = errors.clone();
            return Err(SessionError::Validation(errors));
        }

        let signature = match CentroidAggregator::new(self.min_samples).aggregate(&self.samples) {
            Ok(signature) => signature,
            Err(AggregateError::InsufficientSamples { required, actual }) => {
                let errors = employee::validate(&metadata, actual, required);
                self.field_errors = errors.clone();
                return Err(SessionError::Validation(errors));
            }
        };

        self.field_errors = FieldErrors::default();
        self.last_error = None;
        self.submitted = Some(metadata.clone());
        self.state = EnrollmentState::Submitting;
        tracing::info!(
            employee_id = %metadata.employee_id,
            name = %metadata.display_name(),
            samples = self.samples.len(),
            "submitting enrollment"
        );
        Ok(Submission {
            metadata,
            signature,
        })
    }

    /// `SubmitFailed → Submitting` with the metadata of the failed attempt.
    pub fn retry_submit(&mut self) -> Result<Submission, SessionError> {
        let metadata = match (&self.state, &self.submitted) {
            (EnrollmentState::SubmitFailed { .. }, Some(m)) => m.clone(),
            _ => return Err(self.invalid("retry submit")),
        };
        self.begin_submit(metadata)
    }

    /// `Submitting → Submitted | SubmitFailed`.
    pub fn finish_submit(&mut self, result: Result<(), String>) -> Result<(), SessionError> {
        if self.state != EnrollmentState::Submitting {
            return Err(self.invalid("finish submit"));
        }
        match result {
            Ok(()) => {
                tracing::info!("enrollment submitted");
                self.samples.clear();
                self.face = None;
                self.state = EnrollmentState::Submitted;
            }
            Err(reason) => {
                tracing::warn!(%reason, "enrollment submit failed");
                self.last_error = Some(SessionError::Persistence(reason.clone()));
                self.state = EnrollmentState::SubmitFailed { reason };
            }
        }
        Ok(())
    }

    /// Discard everything and return to `Idle`. Never touches the store.
    pub fn reset(&mut self) {
        self.state = EnrollmentState::Idle;
        self.face = None;
        self.samples.clear();
        self.field_errors = FieldErrors::default();
        self.last_error = None;
        self.submitted = None;
    }

    pub fn snapshot(&self, camera_active: bool) -> EnrollmentSnapshot {
        EnrollmentSnapshot {
            camera_active,
            state: self.state.clone(),
            face_detected: self.face.is_some(),
            face_box: self.face,
            samples: self
                .samples
                .iter()
                .enumerate()
                .map(|(index, s)| SampleThumbnail {
                    index,
                    captured_at: s.captured_at,
                    png_bytes: s.image.len(),
                })
                .collect(),
            min_samples: self.min_samples,
            max_samples: self.max_samples,
            can_capture: self.can_capture(),
            is_processing: self.is_processing(),
            field_errors: self.field_errors.clone(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    fn live_state(&self) -> EnrollmentState {
        match self.samples.len() {
            0 => EnrollmentState::CameraActive,
            n if n < self.min_samples => EnrollmentState::SampleCollected,
            _ => EnrollmentState::ReadyToSubmit,
        }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}
