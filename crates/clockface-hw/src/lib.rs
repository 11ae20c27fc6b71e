//! clockface-hw — Camera acquisition and frame handling.
//!
//! Provides the `CameraSource` / `FrameStream` seam used by the kiosk
//! daemon, a V4L2 implementation of it, and PNG encoding of still frames.

pub mod camera;
pub mod frame;

pub use camera::{
    CameraError, CameraSource, CaptureConstraints, FrameStream, PixelFormat, V4l2Source,
};
pub use frame::{Frame, FrameError};
