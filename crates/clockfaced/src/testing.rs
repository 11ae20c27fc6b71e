//! In-process collaborators for actor and feed tests.

use crate::employee::EmployeeMetadata;
use crate::extractor::{DescriptorExtractor, ExtractorError, FaceDetection};
use crate::store::{EmployeeStore, PersistError};
use async_trait::async_trait;
use clockface_core::{BoundingBox, CheckInRecord, EmployeeIdentity, FaceDescriptor};
use clockface_hw::{CameraError, CameraSource, CaptureConstraints, Frame, FrameStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Camera producing small mid-grey frames.
#[derive(Default)]
pub struct FakeCamera {
    deny: bool,
    open: Arc<AtomicUsize>,
    acquisitions: AtomicUsize,
    broken: Arc<AtomicBool>,
}

impl FakeCamera {
    /// Every acquisition fails as if permission was refused.
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Streams currently open (acquired and not yet dropped).
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Make every open and future stream fail its reads.
    pub fn break_streams(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn repair_streams(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

impl CameraSource for FakeCamera {
    fn acquire(&self, _constraints: &CaptureConstraints) -> Result<Box<dyn FrameStream>, CameraError> {
        if self.deny {
            return Err(CameraError::PermissionDenied("/dev/video0".into()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            open: Arc::clone(&self.open),
            broken: Arc::clone(&self.broken),
            sequence: 0,
        }))
    }
}

struct FakeStream {
    open: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
    sequence: u32,
}

impl FrameStream for FakeStream {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        std::thread::sleep(Duration::from_millis(2));
        if self.broken.load(Ordering::SeqCst) {
            return Err(CameraError::CaptureFailed("device unplugged".into()));
        }
        self.sequence += 1;
        Ok(Frame::new(vec![128; 16], 4, 4, self.sequence))
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stream whose every read fails.
pub struct FailingStream;

impl FrameStream for FailingStream {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        Err(CameraError::CaptureFailed("no signal".into()))
    }
}

/// Extractor reporting one fixed face, or none.
pub struct FakeExtractor {
    descriptor: Mutex<Option<Vec<f32>>>,
    delay: Duration,
}

impl FakeExtractor {
    pub fn with_descriptor(values: Vec<f32>) -> Self {
        Self {
            descriptor: Mutex::new(Some(values)),
            delay: Duration::ZERO,
        }
    }

    /// Every call waits `delay` before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_descriptor(&self, values: Option<Vec<f32>>) {
        *self.descriptor.lock().unwrap() = values;
    }
}

#[async_trait]
impl DescriptorExtractor for FakeExtractor {
    async fn detect(&self, _frame: &Frame) -> Result<Option<FaceDetection>, ExtractorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let values = self.descriptor.lock().unwrap().clone();
        Ok(values.map(|values| FaceDetection {
            bounding_box: BoundingBox {
                x: 1.0,
                y: 1.0,
                width: 2.0,
                height: 2.0,
                confidence: 0.99,
            },
            descriptor: FaceDescriptor::new(values),
        }))
    }
}

/// Store recording every write in memory.
#[derive(Default)]
pub struct FakeStore {
    roster: Mutex<Vec<EmployeeIdentity>>,
    employees: Mutex<Vec<(EmployeeMetadata, FaceDescriptor)>>,
    check_ins: Mutex<Vec<CheckInRecord>>,
    fail_writes: AtomicBool,
    write_delay: Duration,
    roster_fetches: AtomicUsize,
}

impl FakeStore {
    pub fn with_roster(roster: Vec<EmployeeIdentity>) -> Self {
        Self {
            roster: Mutex::new(roster),
            ..Self::default()
        }
    }

    /// Every write waits `delay` before answering.
    pub fn delayed_writes(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Reject every write with a 503 until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn employees(&self) -> Vec<(EmployeeMetadata, FaceDescriptor)> {
        self.employees.lock().unwrap().clone()
    }

    pub fn check_ins(&self) -> Vec<CheckInRecord> {
        self.check_ins.lock().unwrap().clone()
    }

    pub fn roster_fetches(&self) -> usize {
        self.roster_fetches.load(Ordering::SeqCst)
    }

    async fn check_writable(&self) -> Result<(), PersistError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistError::Rejected {
                status: 503,
                reason: "store unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EmployeeStore for FakeStore {
    async fn persist_employee(
        &self,
        metadata: &EmployeeMetadata,
        signature: &FaceDescriptor,
    ) -> Result<(), PersistError> {
        self.check_writable().await?;
        self.employees
            .lock()
            .unwrap()
            .push((metadata.clone(), signature.clone()));
        Ok(())
    }

    async fn fetch_roster(&self) -> Result<Vec<EmployeeIdentity>, PersistError> {
        self.roster_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.roster.lock().unwrap().clone())
    }

    async fn persist_check_in(&self, record: &CheckInRecord) -> Result<(), PersistError> {
        self.check_writable().await?;
        self.check_ins.lock().unwrap().push(record.clone());
        Ok(())
    }
}
