//! Remote employee / check-in store over HTTP.

use crate::employee::EmployeeMetadata;
use async_trait::async_trait;
use chrono::SecondsFormat;
use clockface_core::{CheckInRecord, EmployeeIdentity, FaceDescriptor, StillImage};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rejected by store ({status}): {reason}")]
    Rejected { status: u16, reason: String },
    #[error("invalid roster: {0}")]
    InvalidRoster(String),
}

/// Persistence collaborator for enrollment and check-in.
#[async_trait]
pub trait EmployeeStore: Send + Sync {
    async fn persist_employee(
        &self,
        metadata: &EmployeeMetadata,
        signature: &FaceDescriptor,
    ) -> Result<(), PersistError>;

    async fn fetch_roster(&self) -> Result<Vec<EmployeeIdentity>, PersistError>;

    async fn persist_check_in(&self, record: &CheckInRecord) -> Result<(), PersistError>;
}

/// Employee record as registered with the store.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmployeeRegistration<'a> {
    #[serde(flatten)]
    metadata: &'a EmployeeMetadata,
    face_descriptor: &'a FaceDescriptor,
}

/// Roster entry as returned by `GET /api/employees`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterEntry {
    employee_id: String,
    first_name: String,
    last_name: String,
    face_descriptor: Vec<f32>,
}

/// Optional acknowledgement body (`{"success": false, "message": "..."}`).
#[derive(Debug, Default, Deserialize)]
struct Ack {
    success: Option<bool>,
    message: Option<String>,
}

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    descriptor_len: usize,
}

impl HttpStore {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        descriptor_len: usize,
        timeout: Duration,
    ) -> Result<Self, PersistError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            descriptor_len,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }
}

#[async_trait]
impl EmployeeStore for HttpStore {
    async fn persist_employee(
        &self,
        metadata: &EmployeeMetadata,
        signature: &FaceDescriptor,
    ) -> Result<(), PersistError> {
        let body = EmployeeRegistration {
            metadata,
            face_descriptor: signature,
        };
        let response = self
            .authorize(self.client.post(self.url("/api/employee/register")))
            .json(&body)
            .send()
            .await?;
        acknowledge(response).await?;
        tracing::info!(employee_id = %metadata.employee_id, "employee registered");
        Ok(())
    }

    async fn fetch_roster(&self) -> Result<Vec<EmployeeIdentity>, PersistError> {
        let response = self
            .authorize(self.client.get(self.url("/api/employees")))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let entries: Vec<RosterEntry> = response.json().await?;
        let roster = roster_from_entries(entries, self.descriptor_len)?;
        tracing::info!(employees = roster.len(), "roster loaded");
        Ok(roster)
    }

    async fn persist_check_in(&self, record: &CheckInRecord) -> Result<(), PersistError> {
        let response = self
            .authorize(self.client.post(self.url("/api/check-in")))
            .multipart(check_in_form(record)?)
            .send()
            .await?;
        acknowledge(response).await?;
        tracing::info!(employee_id = %record.employee_id, "check-in stored");
        Ok(())
    }
}

fn roster_from_entries(
    entries: Vec<RosterEntry>,
    descriptor_len: usize,
) -> Result<Vec<EmployeeIdentity>, PersistError> {
    entries
        .into_iter()
        .map(|entry| {
            if entry.face_descriptor.len() != descriptor_len {
                return Err(PersistError::InvalidRoster(format!(
                    "employee {} has a {}-dim signature, expected {descriptor_len}",
                    entry.employee_id,
                    entry.face_descriptor.len()
                )));
            }
            Ok(EmployeeIdentity {
                display_name: format!("{} {}", entry.first_name, entry.last_name),
                employee_id: entry.employee_id,
                signature: FaceDescriptor::new(entry.face_descriptor),
            })
        })
        .collect()
}

fn check_in_form(record: &CheckInRecord) -> Result<Form, PersistError> {
    let image = Part::bytes(record.image_proof.as_bytes().to_vec())
        .file_name("check-in.png")
        .mime_str(StillImage::MEDIA_TYPE)?;
    Ok(Form::new()
        .text("employee_id", record.employee_id.clone())
        .text(
            "timestamp",
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )
        .part("image", image))
}

async fn ensure_success(response: Response) -> Result<Response, PersistError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PersistError::Rejected {
        status: status.as_u16(),
        reason: rejection_reason(&body, status.canonical_reason().unwrap_or("error")),
    })
}

/// Non-2xx or `{"success": false}` both count as a rejection.
async fn acknowledge(response: Response) -> Result<(), PersistError> {
    let response = ensure_success(response).await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    let ack: Ack = serde_json::from_str(&body).unwrap_or_default();
    if ack.success == Some(false) {
        return Err(PersistError::Rejected {
            status,
            reason: ack.message.unwrap_or_else(|| "request not accepted".into()),
        });
    }
    Ok(())
}

fn rejection_reason(body: &str, fallback: &str) -> String {
    if let Ok(Ack {
        message: Some(message),
        ..
    }) = serde_json::from_str::<Ack>(body)
    {
        return message;
    }
    let text = body.trim();
    if text.is_empty() {
        fallback.to_string()
    } else {
        text.chars().take(200).collect()
    }
}
