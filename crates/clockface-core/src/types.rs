use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Fixed-length face descriptor (128-dimensional for dlib-style extractors).
///
/// Immutable once produced. Every descriptor compared within one deployment
/// has the same length; the length is checked where descriptors enter the
/// system (extractor responses, roster loading), not at comparison time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors of equal length.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> f32 {
        debug_assert_eq!(
            self.len(),
            other.len(),
            "descriptor dimensionality mismatch"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FaceDescriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Encoded still frame (PNG). Cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct StillImage {
    png: Arc<[u8]>,
}

impl StillImage {
    pub const MEDIA_TYPE: &'static str = "image/png";

    pub fn from_png(bytes: Vec<u8>) -> Self {
        Self { png: bytes.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.png
    }

    pub fn len(&self) -> usize {
        self.png.len()
    }

    pub fn is_empty(&self) -> bool {
        self.png.is_empty()
    }
}

impl fmt::Debug for StillImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StillImage")
            .field("bytes", &self.png.len())
            .finish()
    }
}

/// One accepted capture: a descriptor together with the frame it came from.
///
/// Both halves are required to construct a sample, so a capture whose
/// extraction failed can never be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedSample {
    pub descriptor: FaceDescriptor,
    pub image: StillImage,
    pub captured_at: DateTime<Utc>,
}

impl CapturedSample {
    pub fn new(descriptor: FaceDescriptor, image: StillImage, captured_at: DateTime<Utc>) -> Self {
        Self {
            descriptor,
            image,
            captured_at,
        }
    }
}

/// An enrolled employee as loaded from the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeIdentity {
    pub employee_id: String,
    pub display_name: String,
    pub signature: FaceDescriptor,
}

/// Outcome of scoring one query descriptor against the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Present only when `matched` is true.
    pub employee: Option<EmployeeIdentity>,
    /// Distance to the nearest candidate; infinite for an empty roster.
    pub distance: f32,
}

impl MatchResult {
    pub fn no_match(distance: f32) -> Self {
        Self {
            matched: false,
            employee: None,
            distance,
        }
    }
}

/// A confirmed check-in, ready to be posted to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInRecord {
    pub employee_id: String,
    pub timestamp: DateTime<Utc>,
    pub image_proof: StillImage,
}
