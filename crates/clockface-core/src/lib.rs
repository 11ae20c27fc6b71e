//! clockface-core — Face signature aggregation and identity matching.
//!
//! Pure, synchronous building blocks shared by the kiosk daemon: the data
//! model, the centroid aggregator that turns enrollment samples into a
//! signature, and the Euclidean matcher used at check-in.

pub mod aggregator;
pub mod matcher;
pub mod types;

pub use aggregator::{AggregateError, CentroidAggregator, DEFAULT_MIN_SAMPLES};
pub use matcher::{EuclideanMatcher, Matcher};
pub use types::{
    BoundingBox, CapturedSample, CheckInRecord, EmployeeIdentity, FaceDescriptor, MatchResult,
    StillImage,
};
