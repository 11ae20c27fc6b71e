//! Kiosk actor: owns the active session, the camera and the in-flight
//! operation.
//!
//! D-Bus handlers talk to it through a cloneable [`KioskHandle`]. Long
//! operations (capture, submit, confirm) run as spawned tasks and report
//! back as [`Event`]s. Detection and capture events carry the camera epoch
//! they were started under; store results carry the session generation.
//! Releasing the camera bumps the epoch and discarding the session bumps
//! the generation, so late events are dropped instead of being applied to
//! a successor. A store call in flight when the camera is lost still lands.

use crate::camera_feed::{CameraFeed, LatestFrame};
use crate::detection::{spawn_detection_poll, DetectionUpdate};
use crate::employee::EmployeeMetadata;
use crate::extractor::DescriptorExtractor;
use crate::session::{
    CheckInSession, CheckInSnapshot, CheckInState, EnrollmentSession, EnrollmentSnapshot,
    EnrollmentState, SessionConfig, SessionError,
};
use crate::store::EmployeeStore;
use chrono::{DateTime, Utc};
use clockface_core::{
    BoundingBox, CapturedSample, EmployeeIdentity, EuclideanMatcher, StillImage,
};
use clockface_hw::{CameraSource, CaptureConstraints};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum KioskError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("kiosk task exited")]
    ChannelClosed,
}

/// External collaborators the kiosk drives.
pub struct Collaborators {
    pub camera: Arc<dyn CameraSource>,
    pub extractor: Arc<dyn DescriptorExtractor>,
    pub store: Arc<dyn EmployeeStore>,
}

/// Externally visible view of whatever session is active.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionSnapshot {
    None,
    Enrollment(EnrollmentSnapshot),
    CheckIn(CheckInSnapshot),
}

impl SessionSnapshot {
    pub fn state_name(&self) -> &'static str {
        match self {
            SessionSnapshot::None => "none",
            SessionSnapshot::Enrollment(s) => s.state.name(),
            SessionSnapshot::CheckIn(s) => s.state.name(),
        }
    }

    pub fn camera_active(&self) -> bool {
        match self {
            SessionSnapshot::None => false,
            SessionSnapshot::Enrollment(s) => s.camera_active,
            SessionSnapshot::CheckIn(s) => s.camera_active,
        }
    }

    pub fn face_detected(&self) -> bool {
        match self {
            SessionSnapshot::None => false,
            SessionSnapshot::Enrollment(s) => s.face_detected,
            SessionSnapshot::CheckIn(s) => s.face_detected,
        }
    }
}

/// Result of one explicit capture: the encoded still (when a frame was
/// available) and the extracted sample or the reason there is none.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub photo: Option<StillImage>,
    pub sample: Result<CapturedSample, SessionError>,
}

/// Completions and ticks fed back into the actor loop.
#[derive(Debug)]
pub enum Event {
    Detection {
        epoch: u64,
        update: DetectionUpdate,
    },
    Captured {
        epoch: u64,
        outcome: CaptureOutcome,
    },
    Submitted {
        generation: u64,
        result: Result<(), String>,
    },
    Confirmed {
        generation: u64,
        at: DateTime<Utc>,
        result: Result<(), String>,
    },
    AutoReset {
        epoch: u64,
    },
}

impl Event {
    /// Whether this event still belongs to the current camera acquisition
    /// (detection, capture, auto-reset) or session (store results).
    fn is_current(&self, epoch: u64, generation: u64) -> bool {
        match self {
            Event::Detection { epoch: e, .. }
            | Event::Captured { epoch: e, .. }
            | Event::AutoReset { epoch: e } => *e == epoch,
            Event::Submitted { generation: g, .. } | Event::Confirmed { generation: g, .. } => {
                *g == generation
            }
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Messages sent from D-Bus handlers to the kiosk task.
enum Command {
    StartEnrollment { reply: Reply<SessionSnapshot> },
    StartCheckIn { reply: Reply<SessionSnapshot> },
    Capture { reply: Reply<SessionSnapshot> },
    RemoveSample { index: usize, reply: Reply<SessionSnapshot> },
    Submit { metadata: EmployeeMetadata, reply: Reply<SessionSnapshot> },
    Confirm { reply: Reply<SessionSnapshot> },
    Cancel { reply: Reply<SessionSnapshot> },
    Retry { reply: Reply<SessionSnapshot> },
    Reset { reply: Reply<SessionSnapshot> },
    Snapshot { reply: Reply<SessionSnapshot> },
    SampleImage { index: usize, reply: Reply<StillImage> },
    Shutdown { reply: Reply<()> },
}

/// Clone-safe handle to the kiosk task.
#[derive(Clone)]
pub struct KioskHandle {
    tx: mpsc::Sender<Command>,
}

impl KioskHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, KioskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| KioskError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| KioskError::ChannelClosed)??)
    }

    /// Tear down any session, acquire the camera and start enrolling.
    pub async fn start_enrollment(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::StartEnrollment { reply }).await
    }

    /// Tear down any session, load the roster, acquire the camera.
    pub async fn start_check_in(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::StartCheckIn { reply }).await
    }

    /// Capture the current frame. Resolves once extraction (and, for
    /// check-in, matching) has finished.
    pub async fn capture(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Capture { reply }).await
    }

    pub async fn remove_sample(&self, index: usize) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::RemoveSample { index, reply })
            .await
    }

    /// Validate and submit the enrollment. Resolves once the store answered.
    pub async fn submit(&self, metadata: EmployeeMetadata) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Submit { metadata, reply })
            .await
    }

    /// Record the check-in of the matched employee.
    pub async fn confirm(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Confirm { reply }).await
    }

    pub async fn cancel(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    pub async fn retry(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Retry { reply }).await
    }

    /// Release the camera and return the session to `Idle`.
    pub async fn reset(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, KioskError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// PNG of enrollment sample `index`, or of the check-in photo (index 0).
    pub async fn sample_image(&self, index: usize) -> Result<StillImage, KioskError> {
        self.request(|reply| Command::SampleImage { index, reply })
            .await
    }

    /// Release the camera and stop the kiosk task.
    pub async fn shutdown(&self) -> Result<(), KioskError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Spawn the kiosk task. Nothing is acquired until a session starts.
pub fn spawn_kiosk(
    collaborators: Collaborators,
    config: SessionConfig,
    constraints: CaptureConstraints,
) -> KioskHandle {
    let (tx, rx) = mpsc::channel::<Command>(8);
    let (events_tx, events_rx) = mpsc::channel::<Event>(64);

    let kiosk = Kiosk {
        camera: collaborators.camera,
        extractor: collaborators.extractor,
        store: collaborators.store,
        config,
        constraints,
        events: events_tx,
        epoch: 0,
        generation: 0,
        session: None,
        feed: None,
        poll: None,
        roster: Arc::new(Vec::new()),
        pending: None,
    };
    tokio::spawn(kiosk.run(rx, events_rx));

    KioskHandle { tx }
}

enum Session {
    Enrollment(EnrollmentSession),
    CheckIn(CheckInSession),
}

impl Session {
    fn state_name(&self) -> &'static str {
        match self {
            Session::Enrollment(s) => s.state().name(),
            Session::CheckIn(s) => s.state().name(),
        }
    }

    fn camera_failed(&mut self, error: SessionError) {
        match self {
            Session::Enrollment(s) => s.camera_failed(error),
            Session::CheckIn(s) => s.camera_failed(error),
        }
    }

    fn set_face(&mut self, face: Option<BoundingBox>) {
        match self {
            Session::Enrollment(s) => s.set_face(face),
            Session::CheckIn(s) => s.set_face(face),
        }
    }

    /// A submit or confirm is waiting on the store.
    fn awaits_store(&self) -> bool {
        match self {
            Session::Enrollment(s) => *s.state() == EnrollmentState::Submitting,
            Session::CheckIn(s) => matches!(s.state(), CheckInState::Confirming { .. }),
        }
    }

    /// States that keep the camera open.
    fn wants_camera(&self) -> bool {
        match self {
            Session::Enrollment(s) => s.state().accepts_samples(),
            Session::CheckIn(s) => matches!(
                s.state(),
                CheckInState::CameraActive
                    | CheckInState::Matched { .. }
                    | CheckInState::NotMatched { .. }
                    | CheckInState::ConfirmFailed { .. }
            ),
        }
    }
}

struct Kiosk {
    camera: Arc<dyn CameraSource>,
    extractor: Arc<dyn DescriptorExtractor>,
    store: Arc<dyn EmployeeStore>,
    config: SessionConfig,
    constraints: CaptureConstraints,
    events: mpsc::Sender<Event>,
    /// Incremented on every camera acquisition and release.
    epoch: u64,
    /// Incremented whenever the session is discarded or reset.
    generation: u64,
    session: Option<Session>,
    feed: Option<CameraFeed>,
    poll: Option<JoinHandle<()>>,
    /// Read-only for the lifetime of one check-in acquisition.
    roster: Arc<Vec<EmployeeIdentity>>,
    /// Caller waiting on the in-flight capture, submit or confirm.
    pending: Option<Reply<SessionSnapshot>>,
}

impl Kiosk {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::Receiver<Event>) {
        tracing::info!("kiosk started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        self.teardown().await;
        tracing::info!("kiosk stopped");
    }

    /// Returns `false` once the kiosk should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartEnrollment { reply } => {
                let _ = reply.send(self.start_enrollment().await);
            }
            Command::StartCheckIn { reply } => {
                let _ = reply.send(self.start_check_in().await);
            }
            Command::Capture { reply } => {
                let started = match self.ensure_camera().await {
                    Ok(()) => self.begin_capture(),
                    Err(e) => Err(e),
                };
                self.defer(started, reply);
            }
            Command::RemoveSample { index, reply } => {
                let _ = reply.send(self.remove_sample(index));
            }
            Command::Submit { metadata, reply } => {
                let started = self.begin_submit(Some(metadata));
                self.defer(started, reply);
            }
            Command::Confirm { reply } => {
                let started = self.begin_confirm();
                self.defer(started, reply);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel().await);
            }
            Command::Retry { reply } => match self.retry().await {
                Ok(true) => self.pending = Some(reply),
                Ok(false) => {
                    let _ = reply.send(Ok(self.snapshot()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Reset { reply } => {
                self.reset().await;
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::SampleImage { index, reply } => {
                let _ = reply.send(self.sample_image(index));
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    /// Park `reply` until the spawned operation reports back.
    fn defer(&mut self, started: Result<(), SessionError>, reply: Reply<SessionSnapshot>) {
        match started {
            Ok(()) => self.pending = Some(reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let camera_active = self.feed.is_some();
        match &self.session {
            None => SessionSnapshot::None,
            Some(Session::Enrollment(s)) => SessionSnapshot::Enrollment(s.snapshot(camera_active)),
            Some(Session::CheckIn(s)) => SessionSnapshot::CheckIn(s.snapshot(camera_active)),
        }
    }

    // --- camera ---

    async fn acquire_camera(&mut self) -> Result<(), SessionError> {
        self.epoch += 1;
        match CameraFeed::acquire(Arc::clone(&self.camera), self.constraints).await {
            Ok(feed) => {
                self.poll = Some(spawn_detection_poll(
                    self.epoch,
                    feed.subscribe(),
                    Arc::clone(&self.extractor),
                    self.config.detection_poll_interval(),
                    self.events.clone(),
                ));
                self.feed = Some(feed);
                tracing::info!(epoch = self.epoch, "camera acquired");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "camera acquisition failed");
                Err(SessionError::CameraUnavailable(e.to_string()))
            }
        }
    }

    /// Stop detection and close the device.
    async fn release_camera(&mut self) {
        self.epoch += 1;
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        if let Some(feed) = self.feed.take() {
            feed.release().await;
            tracing::info!(epoch = self.epoch, "camera released");
        }
    }

    /// Reacquire the camera for a session that outlived it. Leaves the
    /// session untouched when acquisition fails.
    async fn ensure_camera(&mut self) -> Result<(), SessionError> {
        let wanted = self.session.as_ref().is_some_and(Session::wants_camera);
        if self.feed.is_some() || !wanted {
            return Ok(());
        }
        tracing::info!("reacquiring camera");
        self.acquire_camera().await
    }

    fn cancel_pending(&mut self, error: SessionError) {
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(error));
        }
    }

    /// Release the camera and invalidate everything in flight.
    async fn discard_in_flight(&mut self) {
        self.release_camera().await;
        self.generation += 1;
        self.cancel_pending(SessionError::Cancelled);
    }

    async fn teardown(&mut self) {
        self.discard_in_flight().await;
        self.session = None;
    }

    // --- commands ---

    async fn start_enrollment(&mut self) -> Result<SessionSnapshot, SessionError> {
        self.teardown().await;
        let mut session = EnrollmentSession::new(&self.config);
        let acquired = self.acquire_camera().await;
        let result = match acquired {
            Ok(()) => session.camera_started(),
            Err(e) => {
                session.camera_failed(e.clone());
                Err(e)
            }
        };
        self.session = Some(Session::Enrollment(session));
        result.map(|()| self.snapshot())
    }

    async fn start_check_in(&mut self) -> Result<SessionSnapshot, SessionError> {
        self.teardown().await;
        let mut session = CheckInSession::new(self.config.match_threshold);

        let result = match self.store.fetch_roster().await {
            Ok(roster) => {
                self.roster = Arc::new(roster);
                match self.acquire_camera().await {
                    Ok(()) => session.camera_started(),
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "roster fetch failed");
                Err(SessionError::Persistence(e.to_string()))
            }
        };
        if let Err(e) = &result {
            session.camera_failed(e.clone());
        }
        self.session = Some(Session::CheckIn(session));
        result.map(|()| self.snapshot())
    }

    fn begin_capture(&mut self) -> Result<(), SessionError> {
        let frames = self.feed.as_ref().map(CameraFeed::subscribe);
        match self.session.as_mut() {
            None => return Err(SessionError::NoActiveSession),
            Some(Session::Enrollment(s)) => s.begin_capture()?,
            Some(Session::CheckIn(s)) => s.begin_capture()?,
        }
        let Some(frames) = frames else {
            let error = SessionError::CameraUnavailable("camera not acquired".into());
            self.fail_session(error.clone());
            return Err(error);
        };

        let epoch = self.epoch;
        let extractor = Arc::clone(&self.extractor);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = capture(frames, extractor.as_ref()).await;
            let _ = events.send(Event::Captured { epoch, outcome }).await;
        });
        Ok(())
    }

    fn remove_sample(&mut self, index: usize) -> Result<SessionSnapshot, SessionError> {
        match self.session.as_mut() {
            None => Err(SessionError::NoActiveSession),
            Some(Session::Enrollment(s)) => {
                s.remove_sample(index)?;
                Ok(self.snapshot())
            }
            Some(Session::CheckIn(s)) => Err(SessionError::InvalidState {
                operation: "remove sample",
                state: s.state().name(),
            }),
        }
    }

    /// `None` resubmits the metadata of the failed attempt.
    fn begin_submit(&mut self, metadata: Option<EmployeeMetadata>) -> Result<(), SessionError> {
        let submission = match self.session.as_mut() {
            None => return Err(SessionError::NoActiveSession),
            Some(Session::CheckIn(s)) => {
                return Err(SessionError::InvalidState {
                    operation: "submit",
                    state: s.state().name(),
                })
            }
            Some(Session::Enrollment(s)) => match metadata {
                Some(metadata) => s.begin_submit(metadata)?,
                None => s.retry_submit()?,
            },
        };

        let generation = self.generation;
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = store
                .persist_employee(&submission.metadata, &submission.signature)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(Event::Submitted { generation, result }).await;
        });
        Ok(())
    }

    fn begin_confirm(&mut self) -> Result<(), SessionError> {
        let record = match self.session.as_mut() {
            None => return Err(SessionError::NoActiveSession),
            Some(Session::Enrollment(s)) => {
                return Err(SessionError::InvalidState {
                    operation: "confirm",
                    state: s.state().name(),
                })
            }
            Some(Session::CheckIn(s)) => s.begin_confirm(Utc::now())?,
        };

        let generation = self.generation;
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let at = record.timestamp;
            let result = store
                .persist_check_in(&record)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(Event::Confirmed { generation, at, result }).await;
        });
        Ok(())
    }

    /// Enrollment: discard everything. Check-in: drop the capture and resume
    /// live detection.
    async fn cancel(&mut self) -> Result<SessionSnapshot, SessionError> {
        match self.session.as_mut() {
            None => Err(SessionError::NoActiveSession),
            Some(Session::Enrollment(_)) => {
                self.reset().await;
                Ok(self.snapshot())
            }
            Some(Session::CheckIn(_)) => {
                self.resume_check_in().await?;
                Ok(self.snapshot())
            }
        }
    }

    /// Returns `true` when an asynchronous operation was started.
    async fn retry(&mut self) -> Result<bool, SessionError> {
        match self.session.as_mut() {
            None => Err(SessionError::NoActiveSession),
            Some(Session::Enrollment(s)) => match s.state() {
                EnrollmentState::SubmitFailed { .. } => self.begin_submit(None).map(|()| true),
                other => Err(SessionError::InvalidState {
                    operation: "retry",
                    state: other.name(),
                }),
            },
            Some(Session::CheckIn(s)) => match s.state() {
                CheckInState::NotMatched { .. } => self.resume_check_in().await.map(|()| false),
                CheckInState::ConfirmFailed { .. } => self.begin_confirm().map(|()| true),
                other => Err(SessionError::InvalidState {
                    operation: "retry",
                    state: other.name(),
                }),
            },
        }
    }

    /// Drop the current capture and go back to live detection.
    async fn resume_check_in(&mut self) -> Result<(), SessionError> {
        self.ensure_camera().await?;
        match self.session.as_mut() {
            Some(Session::CheckIn(s)) => s.resume(),
            _ => Err(SessionError::NoActiveSession),
        }
    }

    async fn reset(&mut self) {
        self.discard_in_flight().await;
        match self.session.as_mut() {
            Some(Session::Enrollment(s)) => s.reset(),
            Some(Session::CheckIn(s)) => s.reset(),
            None => {}
        }
        tracing::info!("session reset");
    }

    fn sample_image(&self, index: usize) -> Result<StillImage, SessionError> {
        let image = match &self.session {
            None => return Err(SessionError::NoActiveSession),
            Some(Session::Enrollment(s)) => s.samples().get(index).map(|s| s.image.clone()),
            Some(Session::CheckIn(s)) if index == 0 => s.photo().cloned(),
            Some(Session::CheckIn(_)) => None,
        };
        image.ok_or(SessionError::NoSuchSample { index })
    }

    fn fail_session(&mut self, error: SessionError) {
        if let Some(session) = self.session.as_mut() {
            session.camera_failed(error);
        }
    }

    // --- events ---

    async fn handle_event(&mut self, event: Event) {
        if !event.is_current(self.epoch, self.generation) {
            tracing::trace!(
                epoch = self.epoch,
                generation = self.generation,
                "dropping stale event"
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            Event::Detection {
                update: DetectionUpdate::Presence(face),
                ..
            } => session.set_face(face),
            Event::Detection {
                update: DetectionUpdate::CameraLost,
                ..
            } => {
                tracing::error!(state = session.state_name(), "camera lost during session");
                let error = SessionError::CameraUnavailable("camera stream ended".into());
                if session.awaits_store() {
                    // The store call does not need the camera; let its result land.
                    session.set_face(None);
                    self.release_camera().await;
                } else {
                    self.release_camera().await;
                    self.cancel_pending(error.clone());
                    self.fail_session(error);
                }
            }
            Event::Captured { outcome, .. } => {
                let result = match session {
                    Session::Enrollment(s) => s.finish_capture(outcome.sample),
                    Session::CheckIn(s) => s
                        .finish_capture(outcome.photo, outcome.sample)
                        .and_then(|()| {
                            if *s.state() == CheckInState::Matching {
                                s.run_match(&EuclideanMatcher, &self.roster)
                            } else {
                                Ok(())
                            }
                        }),
                };
                self.resolve(result);
            }
            Event::Submitted { result, .. } => {
                let Session::Enrollment(s) = session else { return };
                let finished = s.finish_submit(result);
                let done = *s.state() == EnrollmentState::Submitted;
                let reply = self.pending.take();
                if done {
                    self.release_camera().await;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(finished.map(|()| self.snapshot()));
                }
            }
            Event::Confirmed { at, result, .. } => {
                let Session::CheckIn(s) = session else { return };
                let finished = s.finish_confirm(at, result);
                if matches!(s.state(), CheckInState::Confirmed { .. }) {
                    self.schedule_auto_reset();
                }
                self.resolve(finished);
            }
            Event::AutoReset { .. } => self.auto_reset().await,
        }
    }

    fn resolve(&mut self, result: Result<(), SessionError>) {
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(result.map(|()| self.snapshot()));
        }
    }

    fn schedule_auto_reset(&self) {
        let epoch = self.epoch;
        let delay = self.config.confirmed_auto_reset();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::AutoReset { epoch }).await;
        });
    }

    /// After a confirmed check-in: release, refresh the roster, re-acquire
    /// and go back to live detection for the next person.
    async fn auto_reset(&mut self) {
        let confirmed = matches!(
            &self.session,
            Some(Session::CheckIn(s)) if matches!(s.state(), CheckInState::Confirmed { .. })
        );
        if !confirmed {
            return;
        }

        tracing::info!("resetting check-in for the next person");
        self.release_camera().await;
        if let Some(Session::CheckIn(s)) = self.session.as_mut() {
            s.reset();
        }

        match self.store.fetch_roster().await {
            Ok(roster) => self.roster = Arc::new(roster),
            Err(e) => tracing::warn!(error = %e, "roster refresh failed; keeping previous roster"),
        }

        let acquired = self.acquire_camera().await;
        if let Some(Session::CheckIn(s)) = self.session.as_mut() {
            match acquired {
                Ok(()) => {
                    let _ = s.camera_started();
                }
                Err(e) => s.camera_failed(e),
            }
        }
    }
}

/// Encode the latest frame and extract its descriptor.
async fn capture(frames: LatestFrame, extractor: &dyn DescriptorExtractor) -> CaptureOutcome {
    let frame = frames.borrow().clone();
    let Some(frame) = frame else {
        return CaptureOutcome {
            photo: None,
            sample: Err(SessionError::CameraUnavailable("no frame available".into())),
        };
    };

    let photo = match frame.encode_png() {
        Ok(png) => StillImage::from_png(png),
        Err(e) => {
            return CaptureOutcome {
                photo: None,
                sample: Err(SessionError::Extractor(e.to_string())),
            }
        }
    };

    let sample = match extractor.detect(&frame).await {
        Ok(Some(detection)) => Ok(CapturedSample::new(
            detection.descriptor,
            photo.clone(),
            Utc::now(),
        )),
        Ok(None) => Err(SessionError::ExtractionFailed),
        Err(e) => Err(SessionError::Extractor(e.to_string())),
    };
    CaptureOutcome {
        photo: Some(photo),
        sample,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::employee::valid_metadata;
    use crate::testing::{FakeCamera, FakeExtractor, FakeStore};
    use clockface_core::FaceDescriptor;
    use std::time::Duration;

    fn test_config() -> SessionConfig {
        SessionConfig {
            match_threshold: 0.5,
            detection_poll_interval_ms: 5,
            confirmed_auto_reset_ms: 50,
            ..SessionConfig::default()
        }
    }

    struct Rig {
        kiosk: KioskHandle,
        camera: Arc<FakeCamera>,
        extractor: Arc<FakeExtractor>,
        store: Arc<FakeStore>,
    }

    fn rig(camera: FakeCamera, extractor: FakeExtractor, store: FakeStore) -> Rig {
        let camera = Arc::new(camera);
        let extractor = Arc::new(extractor);
        let store = Arc::new(store);
        let kiosk = spawn_kiosk(
            Collaborators {
                camera: camera.clone(),
                extractor: extractor.clone(),
                store: store.clone(),
            },
            test_config(),
            CaptureConstraints::default(),
        );
        Rig {
            kiosk,
            camera,
            extractor,
            store,
        }
    }

    fn employee(id: &str, signature: Vec<f32>) -> EmployeeIdentity {
        EmployeeIdentity {
            employee_id: id.into(),
            display_name: format!("Employee {id}"),
            signature: FaceDescriptor::new(signature),
        }
    }

    async fn wait_for(
        kiosk: &KioskHandle,
        what: &str,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let poll = async {
            loop {
                let snapshot = kiosk.snapshot().await.unwrap();
                if pred(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    #[tokio::test]
    async fn test_denied_camera_leaves_session_idle() {
        let rig = rig(
            FakeCamera::denied(),
            FakeExtractor::with_descriptor(vec![0.0, 0.0]),
            FakeStore::default(),
        );

        let err = rig.kiosk.start_check_in().await.unwrap_err();
        assert!(matches!(
            err,
            KioskError::Session(SessionError::CameraUnavailable(_))
        ));

        let snapshot = rig.kiosk.snapshot().await.unwrap();
        let SessionSnapshot::CheckIn(s) = snapshot else {
            panic!("expected check-in snapshot");
        };
        assert_eq!(s.state, CheckInState::Idle);
        assert!(!s.camera_active);
        assert!(!s.can_capture);
        assert!(s.last_error.unwrap().contains("camera unavailable"));
    }

    #[tokio::test]
    async fn test_enrollment_flow_submits_and_releases_camera() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![0.2, 0.4]),
            FakeStore::default(),
        );

        rig.kiosk.start_enrollment().await.unwrap();
        assert_eq!(rig.camera.open_streams(), 1);
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;

        for _ in 0..3 {
            rig.kiosk.capture().await.unwrap();
        }
        let snapshot = rig.kiosk.snapshot().await.unwrap();
        assert_eq!(snapshot.state_name(), "ready_to_submit");

        let done = rig.kiosk.submit(valid_metadata()).await.unwrap();
        assert_eq!(done.state_name(), "submitted");
        assert!(!done.camera_active());
        assert_eq!(rig.camera.open_streams(), 0);

        let employees = rig.store.employees();
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].0.employee_id, "EMP001");
        assert_eq!(employees[0].1.values(), &[0.2, 0.4]);
    }

    #[tokio::test]
    async fn test_submit_with_too_few_samples_reports_fields() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![0.2, 0.4]),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        rig.kiosk.capture().await.unwrap();

        let mut metadata = valid_metadata();
        metadata.email = "not-an-email".into();
        let err = rig.kiosk.submit(metadata).await.unwrap_err();
        let KioskError::Session(SessionError::Validation(errors)) = err else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 2);
        assert!(rig.store.employees().is_empty());
        assert_eq!(rig.kiosk.snapshot().await.unwrap().state_name(), "sample_collected");
    }

    #[tokio::test]
    async fn test_failed_submit_can_be_retried() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        for _ in 0..3 {
            rig.kiosk.capture().await.unwrap();
        }

        rig.store.set_fail_writes(true);
        let failed = rig.kiosk.submit(valid_metadata()).await.unwrap();
        assert_eq!(failed.state_name(), "submit_failed");
        assert!(failed.camera_active());

        rig.store.set_fail_writes(false);
        let done = rig.kiosk.retry().await.unwrap();
        assert_eq!(done.state_name(), "submitted");
        assert_eq!(rig.store.employees().len(), 1);
    }

    #[tokio::test]
    async fn test_samples_can_be_replaced_after_failed_submit() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        for _ in 0..3 {
            rig.kiosk.capture().await.unwrap();
        }

        rig.store.set_fail_writes(true);
        let failed = rig.kiosk.submit(valid_metadata()).await.unwrap();
        assert_eq!(failed.state_name(), "submit_failed");

        let edited = rig.kiosk.remove_sample(0).await.unwrap();
        assert_eq!(edited.state_name(), "sample_collected");
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        let refilled = rig.kiosk.capture().await.unwrap();
        assert_eq!(refilled.state_name(), "ready_to_submit");

        rig.store.set_fail_writes(false);
        let done = rig.kiosk.submit(valid_metadata()).await.unwrap();
        assert_eq!(done.state_name(), "submitted");
        assert_eq!(rig.store.employees().len(), 1);
    }

    #[tokio::test]
    async fn test_camera_loss_during_submit_keeps_store_result() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![0.2, 0.4]),
            FakeStore::default().delayed_writes(Duration::from_millis(400)),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        for _ in 0..3 {
            rig.kiosk.capture().await.unwrap();
        }

        let submit = tokio::spawn({
            let kiosk = rig.kiosk.clone();
            async move { kiosk.submit(valid_metadata()).await }
        });
        wait_for(&rig.kiosk, "submitting", |s| s.state_name() == "submitting").await;
        rig.camera.break_streams();
        let lost = wait_for(&rig.kiosk, "camera release", |s| !s.camera_active()).await;
        assert_eq!(lost.state_name(), "submitting");

        let done = submit.await.unwrap().unwrap();
        assert_eq!(done.state_name(), "submitted");
        assert_eq!(rig.store.employees().len(), 1);
        assert_eq!(rig.camera.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_camera_loss_during_failed_submit_keeps_samples() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default().delayed_writes(Duration::from_millis(400)),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        for _ in 0..3 {
            rig.kiosk.capture().await.unwrap();
        }

        rig.store.set_fail_writes(true);
        let submit = tokio::spawn({
            let kiosk = rig.kiosk.clone();
            async move { kiosk.submit(valid_metadata()).await }
        });
        wait_for(&rig.kiosk, "submitting", |s| s.state_name() == "submitting").await;
        rig.camera.break_streams();
        wait_for(&rig.kiosk, "camera release", |s| !s.camera_active()).await;

        let SessionSnapshot::Enrollment(failed) = submit.await.unwrap().unwrap() else {
            panic!("expected enrollment snapshot");
        };
        assert_eq!(failed.state.name(), "submit_failed");
        assert_eq!(failed.samples.len(), 3);
        assert!(!failed.camera_active);

        // Capturing again reacquires the camera; nothing has been detected on it yet.
        rig.camera.repair_streams();
        let err = rig.kiosk.capture().await.unwrap_err();
        assert!(matches!(err, KioskError::Session(SessionError::NoFaceDetected)));
        assert!(rig.kiosk.snapshot().await.unwrap().camera_active());
        assert_eq!(rig.camera.acquisitions(), 2);

        rig.store.set_fail_writes(false);
        let done = rig.kiosk.retry().await.unwrap();
        assert_eq!(done.state_name(), "submitted");
        assert_eq!(rig.store.employees().len(), 1);
    }

    #[tokio::test]
    async fn test_camera_loss_during_confirm_records_check_in() {
        let store = FakeStore::with_roster(vec![employee("E1", vec![0.0])])
            .delayed_writes(Duration::from_millis(400));
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![0.1]),
            store,
        );
        rig.kiosk.start_check_in().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        rig.kiosk.capture().await.unwrap();

        let confirm = tokio::spawn({
            let kiosk = rig.kiosk.clone();
            async move { kiosk.confirm().await }
        });
        wait_for(&rig.kiosk, "confirming", |s| s.state_name() == "confirming").await;
        rig.camera.break_streams();
        let lost = wait_for(&rig.kiosk, "camera release", |s| !s.camera_active()).await;
        assert_eq!(lost.state_name(), "confirming");

        let confirmed = confirm.await.unwrap().unwrap();
        assert_eq!(confirmed.state_name(), "confirmed");
        assert_eq!(rig.store.check_ins().len(), 1);
        assert_eq!(rig.store.check_ins()[0].employee_id, "E1");
    }

    #[tokio::test]
    async fn test_second_capture_while_extracting_is_busy() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]).delayed(Duration::from_millis(150)),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;

        let first = tokio::spawn({
            let kiosk = rig.kiosk.clone();
            async move { kiosk.capture().await }
        });
        wait_for(&rig.kiosk, "capturing", |s| s.state_name() == "capturing").await;

        let err = rig.kiosk.capture().await.unwrap_err();
        assert!(matches!(err, KioskError::Session(SessionError::Busy)));

        let snapshot = first.await.unwrap().unwrap();
        let SessionSnapshot::Enrollment(s) = snapshot else {
            panic!("expected enrollment snapshot");
        };
        assert_eq!(s.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_during_capture_cancels_and_ignores_late_result() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]).delayed(Duration::from_millis(100)),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;

        let pending = tokio::spawn({
            let kiosk = rig.kiosk.clone();
            async move { kiosk.capture().await }
        });
        wait_for(&rig.kiosk, "capturing", |s| s.state_name() == "capturing").await;

        let reset = rig.kiosk.reset().await.unwrap();
        assert_eq!(reset.state_name(), "idle");
        assert!(matches!(
            pending.await.unwrap(),
            Err(KioskError::Session(SessionError::Cancelled))
        ));

        // The extraction finishes after the reset; its result must not land.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let SessionSnapshot::Enrollment(s) = rig.kiosk.snapshot().await.unwrap() else {
            panic!("expected enrollment snapshot");
        };
        assert_eq!(s.state, EnrollmentState::Idle);
        assert!(s.samples.is_empty());
        assert!(!s.face_detected);
        assert_eq!(rig.camera.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_check_in_match_confirm_and_auto_reset() {
        let store = FakeStore::with_roster(vec![
            employee("E1", vec![0.0, 0.0]),
            employee("E2", vec![3.0, 4.0]),
        ]);
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![0.3, 0.0]),
            store,
        );

        rig.kiosk.start_check_in().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;

        let SessionSnapshot::CheckIn(matched) = rig.kiosk.capture().await.unwrap() else {
            panic!("expected check-in snapshot");
        };
        assert_eq!(matched.state.name(), "matched");
        assert_eq!(matched.matched_employee.unwrap().employee_id, "E1");

        let confirmed = rig.kiosk.confirm().await.unwrap();
        assert_eq!(confirmed.state_name(), "confirmed");
        let check_ins = rig.store.check_ins();
        assert_eq!(check_ins.len(), 1);
        assert_eq!(check_ins[0].employee_id, "E1");
        assert!(!check_ins[0].image_proof.is_empty());

        let after = wait_for(&rig.kiosk, "auto reset", |s| {
            s.state_name() == "camera_active"
        })
        .await;
        assert!(after.camera_active());
        assert_eq!(rig.camera.acquisitions(), 2);
        assert_eq!(rig.camera.open_streams(), 1);
        assert_eq!(rig.store.roster_fetches(), 2);
    }

    #[tokio::test]
    async fn test_unrecognized_face_cannot_be_confirmed() {
        let store = FakeStore::with_roster(vec![employee("E1", vec![0.0, 0.0])]);
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![3.0, 4.0]),
            store,
        );
        rig.kiosk.start_check_in().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;

        let SessionSnapshot::CheckIn(s) = rig.kiosk.capture().await.unwrap() else {
            panic!("expected check-in snapshot");
        };
        assert_eq!(s.state.name(), "not_matched");
        assert!(s.matched_employee.is_none());

        let err = rig.kiosk.confirm().await.unwrap_err();
        assert!(matches!(
            err,
            KioskError::Session(SessionError::InvalidState { .. })
        ));
        assert!(rig.store.check_ins().is_empty());

        let resumed = rig.kiosk.retry().await.unwrap();
        assert_eq!(resumed.state_name(), "camera_active");
    }

    #[tokio::test]
    async fn test_rejected_check_in_keeps_match_for_retry() {
        let store = FakeStore::with_roster(vec![employee("E1", vec![0.0])]);
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![0.1]),
            store,
        );
        rig.kiosk.start_check_in().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        rig.kiosk.capture().await.unwrap();

        rig.store.set_fail_writes(true);
        let failed = rig.kiosk.confirm().await.unwrap();
        assert_eq!(failed.state_name(), "confirm_failed");

        rig.store.set_fail_writes(false);
        let confirmed = rig.kiosk.retry().await.unwrap();
        assert_eq!(confirmed.state_name(), "confirmed");
        assert_eq!(rig.store.check_ins().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_without_face_in_frame() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::with_roster(vec![employee("E1", vec![1.0])]),
        );
        rig.kiosk.start_check_in().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;

        rig.extractor.set_descriptor(None);
        let result = rig.kiosk.capture().await;
        // The poll may observe the empty frame first and disable capture.
        match result {
            Ok(SessionSnapshot::CheckIn(s)) => {
                assert_eq!(s.state.name(), "not_matched");
                assert!(s.matched_employee.is_none());
            }
            Err(KioskError::Session(SessionError::NoFaceDetected)) => {}
            other => panic!("unexpected capture result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_starting_check_in_tears_down_enrollment() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        rig.kiosk.capture().await.unwrap();

        let snapshot = rig.kiosk.start_check_in().await.unwrap();
        assert!(matches!(snapshot, SessionSnapshot::CheckIn(_)));
        assert_eq!(rig.camera.open_streams(), 1);
        assert_eq!(rig.camera.acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_camera_loss_ends_session() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        rig.kiosk.capture().await.unwrap();

        rig.camera.break_streams();
        let snapshot = wait_for(&rig.kiosk, "camera loss", |s| s.state_name() == "idle").await;
        let SessionSnapshot::Enrollment(s) = snapshot else {
            panic!("expected enrollment snapshot");
        };
        assert!(s.samples.is_empty());
        assert!(s.last_error.unwrap().contains("camera unavailable"));
        assert_eq!(rig.camera.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_sample_image_lookup() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default(),
        );
        assert!(matches!(
            rig.kiosk.sample_image(0).await,
            Err(KioskError::Session(SessionError::NoActiveSession))
        ));

        rig.kiosk.start_enrollment().await.unwrap();
        wait_for(&rig.kiosk, "face detection", SessionSnapshot::face_detected).await;
        rig.kiosk.capture().await.unwrap();

        let png = rig.kiosk.sample_image(0).await.unwrap();
        assert!(png.as_bytes().starts_with(b"\x89PNG"));
        assert!(matches!(
            rig.kiosk.sample_image(1).await,
            Err(KioskError::Session(SessionError::NoSuchSample { index: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_camera() {
        let rig = rig(
            FakeCamera::default(),
            FakeExtractor::with_descriptor(vec![1.0]),
            FakeStore::default(),
        );
        rig.kiosk.start_enrollment().await.unwrap();
        rig.kiosk.shutdown().await.unwrap();
        assert_eq!(rig.camera.open_streams(), 0);
        assert!(matches!(
            rig.kiosk.snapshot().await,
            Err(KioskError::ChannelClosed)
        ));
    }
}
