//! Check-in: capture one face, match it, and record it only after an explicit
//! confirmation.
//!
//! ```text
//! Idle → CameraActive → Capturing → Matching → Matched | NotMatched
//! Matched → Confirming → Confirmed | ConfirmFailed
//! NotMatched | Matched | ConfirmFailed --cancel/retry--> CameraActive
//! ```

use super::SessionError;
use chrono::{DateTime, Utc};
use clockface_core::{
    BoundingBox, CapturedSample, CheckInRecord, EmployeeIdentity, FaceDescriptor, Matcher,
    StillImage,
};
use serde::Serialize;

/// What the kiosk shows for a recognized employee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeSummary {
    pub employee_id: String,
    pub display_name: String,
}

impl From<&EmployeeIdentity> for EmployeeSummary {
    fn from(identity: &EmployeeIdentity) -> Self {
        Self {
            employee_id: identity.employee_id.clone(),
            display_name: identity.display_name.clone(),
        }
    }
}

/// Why a capture did not produce a match. Both mean "cannot check in".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoMatchReason {
    /// The captured frame yielded no descriptor; no distance was computed.
    NoFace,
    /// The extractor could not be reached.
    ExtractionError { message: String },
    /// Nearest enrolled signature was farther than the threshold.
    Unrecognized { distance: f32 },
}

impl NoMatchReason {
    pub fn message(&self) -> String {
        match self {
            NoMatchReason::NoFace => "No face found in the captured photo".to_string(),
            NoMatchReason::ExtractionError { message } => {
                format!("Face recognition is unavailable: {message}")
            }
            NoMatchReason::Unrecognized { .. } => "Face not recognized".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum CheckInState {
    Idle,
    CameraActive,
    Capturing,
    Matching,
    Matched {
        employee: EmployeeSummary,
        distance: f32,
    },
    NotMatched {
        reason: NoMatchReason,
    },
    Confirming {
        employee: EmployeeSummary,
    },
    Confirmed {
        employee: EmployeeSummary,
        at: DateTime<Utc>,
    },
    ConfirmFailed {
        employee: EmployeeSummary,
        reason: String,
    },
}

impl CheckInState {
    pub fn name(&self) -> &'static str {
        match self {
            CheckInState::Idle => "idle",
            CheckInState::CameraActive => "camera_active",
            CheckInState::Capturing => "capturing",
            CheckInState::Matching => "matching",
            CheckInState::Matched { .. } => "matched",
            CheckInState::NotMatched { .. } => "not_matched",
            CheckInState::Confirming { .. } => "confirming",
            CheckInState::Confirmed { .. } => "confirmed",
            CheckInState::ConfirmFailed { .. } => "confirm_failed",
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            CheckInState::Capturing | CheckInState::Matching | CheckInState::Confirming { .. }
        )
    }

    /// The employee currently on screen, if any.
    pub fn employee(&self) -> Option<&EmployeeSummary> {
        match self {
            CheckInState::Matched { employee, .. }
            | CheckInState::Confirming { employee }
            | CheckInState::Confirmed { employee, .. }
            | CheckInState::ConfirmFailed { employee, .. } => Some(employee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckInSnapshot {
    pub camera_active: bool,
    pub state: CheckInState,
    pub face_detected: bool,
    pub face_box: Option<BoundingBox>,
    pub matched_employee: Option<EmployeeSummary>,
    pub can_capture: bool,
    pub is_processing: bool,
    pub message: Option<String>,
    pub last_error: Option<String>,
}

pub struct CheckInSession {
    threshold: f32,
    state: CheckInState,
    face: Option<BoundingBox>,
    /// Photo of the capture in flight or on screen.
    photo: Option<StillImage>,
    /// Descriptor awaiting `run_match`.
    query: Option<FaceDescriptor>,
    last_error: Option<SessionError>,
}

impl CheckInSession {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            state: CheckInState::Idle,
            face: None,
            photo: None,
            query: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> &CheckInState {
        &self.state
    }

    pub fn face_detected(&self) -> bool {
        self.face.is_some()
    }

    pub fn photo(&self) -> Option<&StillImage> {
        self.photo.as_ref()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    pub fn can_capture(&self) -> bool {
        self.state == CheckInState::CameraActive && self.face.is_some()
    }

    /// `Idle → CameraActive` once the camera has been acquired.
    pub fn camera_started(&mut self) -> Result<(), SessionError> {
        if self.state != CheckInState::Idle {
            return Err(self.invalid("start camera"));
        }
        self.last_error = None;
        self.state = CheckInState::CameraActive;
        Ok(())
    }

    /// Camera or roster unavailable: back to `Idle` with the error surfaced.
    pub fn camera_failed(&mut self, error: SessionError) {
        self.reset();
        self.last_error = Some(error);
    }

    /// Update the live detection flag. Never changes the state.
    pub fn set_face(&mut self, face: Option<BoundingBox>) {
        if self.state != CheckInState::Idle {
            self.face = face;
        }
    }

    /// `CameraActive → Capturing`, gated on a detected face.
    pub fn begin_capture(&mut self) -> Result<(), SessionError> {
        if self.state.is_processing() {
            return Err(SessionError::Busy);
        }
        if self.state != CheckInState::CameraActive {
            return Err(self.invalid("capture"));
        }
        if self.face.is_none() {
            return Err(SessionError::NoFaceDetected);
        }
        self.last_error = None;
        self.state = CheckInState::Capturing;
        Ok(())
    }

    /// `Capturing → Matching` when a descriptor was extracted, otherwise
    /// straight to `NotMatched` without a distance.
    pub fn finish_capture(
        &mut self,
        photo: Option<StillImage>,
        outcome: Result<CapturedSample, SessionError>,
    ) -> Result<(), SessionError> {
        if self.state != CheckInState::Capturing {
            return Err(self.invalid("finish capture"));
        }
        match outcome {
            Ok(sample) => {
                self.photo = Some(sample.image);
                self.query = Some(sample.descriptor);
                self.state = CheckInState::Matching;
            }
            Err(error) => {
                self.photo = photo;
                let reason = match &error {
                    SessionError::ExtractionFailed => NoMatchReason::NoFace,
                    other => NoMatchReason::ExtractionError {
                        message: other.to_string(),
                    },
                };
                tracing::info!(%error, "check-in capture produced no descriptor");
                self.state = CheckInState::NotMatched { reason };
            }
        }
        Ok(())
    }

    /// `Matching → Matched | NotMatched` against a read-only roster.
    pub fn run_match(
        &mut self,
        matcher: &dyn Matcher,
        roster: &[EmployeeIdentity],
    ) -> Result<(), SessionError> {
        if self.state != CheckInState::Matching {
            return Err(self.invalid("match"));
        }
        let Some(query) = self.query.take() else {
            return Err(self.invalid("match"));
        };

        let result = matcher.best_match(&query, roster, self.threshold);
        self.state = match (result.matched, result.employee) {
            (true, Some(employee)) => {
                tracing::info!(
                    employee_id = %employee.employee_id,
                    distance = result.distance,
                    "face matched"
                );
                CheckInState::Matched {
                    employee: EmployeeSummary::from(&employee),
                    distance: result.distance,
                }
            }
            _ => {
                tracing::info!(
                    distance = result.distance,
                    roster = roster.len(),
                    "face not recognized"
                );
                CheckInState::NotMatched {
                    reason: NoMatchReason::Unrecognized {
                        distance: result.distance,
                    },
                }
            }
        };
        Ok(())
    }

    /// `Matched | ConfirmFailed → Confirming`. Builds the record to persist.
    pub fn begin_confirm(&mut self, now: DateTime<Utc>) -> Result<CheckInRecord, SessionError> {
        if self.state.is_processing() {
            return Err(SessionError::Busy);
        }
        let employee = match &self.state {
            CheckInState::Matched { employee, .. } | CheckInState::ConfirmFailed { employee, .. } => {
                employee.clone()
            }
            _ => return Err(self.invalid("confirm")),
        };
        let Some(photo) = self.photo.clone() else {
            return Err(self.invalid("confirm"));
        };

        self.last_error = None;
        let record = CheckInRecord {
            employee_id: employee.employee_id.clone(),
            timestamp: now,
            image_proof: photo,
        };
        self.state = CheckInState::Confirming { employee };
        Ok(record)
    }

    /// `Confirming → Confirmed | ConfirmFailed`.
    pub fn finish_confirm(
        &mut self,
        at: DateTime<Utc>,
        result: Result<(), String>,
    ) -> Result<(), SessionError> {
        let CheckInState::Confirming { employee } = &self.state else {
            return Err(self.invalid("finish confirm"));
        };
        let employee = employee.clone();
        self.state = match result {
            Ok(()) => {
                tracing::info!(employee_id = %employee.employee_id, "check-in recorded");
                CheckInState::Confirmed { employee, at }
            }
            Err(reason) => {
                tracing::warn!(employee_id = %employee.employee_id, %reason, "check-in failed");
                self.last_error = Some(SessionError::Persistence(reason.clone()));
                CheckInState::ConfirmFailed { employee, reason }
            }
        };
        Ok(())
    }

    /// Discard the capture and resume live detection (cancel / retry).
    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.state.is_processing() {
            return Err(SessionError::Busy);
        }
        match self.state {
            CheckInState::Matched { .. }
            | CheckInState::NotMatched { .. }
            | CheckInState::ConfirmFailed { .. }
            | CheckInState::Confirmed { .. } => {
                self.photo = None;
                self.query = None;
                self.last_error = None;
                self.state = CheckInState::CameraActive;
                Ok(())
            }
            CheckInState::CameraActive => Ok(()),
            _ => Err(self.invalid("resume")),
        }
    }

    pub fn reset(&mut self) {
        self.state = CheckInState::Idle;
        self.face = None;
        self.photo = None;
        self.query = None;
        self.last_error = None;
    }

    pub fn snapshot(&self, camera_active: bool) -> CheckInSnapshot {
        let message = match &self.state {
            CheckInState::NotMatched { reason } => Some(reason.message()),
            CheckInState::Confirmed { employee, .. } => {
                Some(format!("Checked in {}", employee.display_name))
            }
            _ => None,
        };
        CheckInSnapshot {
            camera_active,
            state: self.state.clone(),
            face_detected: self.face.is_some(),
            face_box: self.face,
            matched_employee: self.state.employee().cloned(),
            can_capture: self.can_capture(),
            is_processing: self.is_processing(),
            message,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}
