//! Descriptor extraction via an HTTP sidecar running the recognition model.

use async_trait::async_trait;
use clockface_core::{BoundingBox, FaceDescriptor};
use clockface_hw::{Frame, FrameError};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] FrameError),
    #[error("extractor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("extractor protocol error: {0}")]
    Protocol(String),
}

/// One detected face with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    pub bounding_box: BoundingBox,
    pub descriptor: FaceDescriptor,
}

/// Frame → descriptor of the most prominent face, or `None` when no face is found.
#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Option<FaceDetection>, ExtractorError>;
}

/// Posts PNG frames to `{base_url}/detect`.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
    descriptor_len: usize,
}

impl HttpExtractor {
    pub fn new(base_url: &str, descriptor_len: usize, timeout: Duration) -> Result<Self, ExtractorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/detect", base_url.trim_end_matches('/')),
            descriptor_len,
        })
    }
}

#[async_trait]
impl DescriptorExtractor for HttpExtractor {
    async fn detect(&self, frame: &Frame) -> Result<Option<FaceDetection>, ExtractorError> {
        let png = frame.encode_png()?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png)
            .send()
            .await?
            .error_for_status()?;
        let body: DetectResponse = response.json().await?;
        pick_face(body, self.descriptor_len)
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<WireFace>,
}

#[derive(Debug, Deserialize)]
struct WireFace {
    #[serde(rename = "box")]
    bounding_box: BoundingBox,
    descriptor: Vec<f32>,
}

/// Highest-confidence face; descriptors of the wrong length are rejected.
fn pick_face(
    response: DetectResponse,
    descriptor_len: usize,
) -> Result<Option<FaceDetection>, ExtractorError> {
    let best = response.faces.into_iter().max_by(|a, b| {
        a.bounding_box
            .confidence
            .total_cmp(&b.bounding_box.confidence)
    });
    let Some(face) = best else {
        return Ok(None);
    };
    if face.descriptor.len() != descriptor_len {
        return Err(ExtractorError::Protocol(format!(
            "expected {descriptor_len}-dim descriptor, got {}",
            face.descriptor.len()
        )));
    }
    Ok(Some(FaceDetection {
        bounding_box: face.bounding_box,
        descriptor: FaceDescriptor::new(face.descriptor),
    }))
}
