use crate::employee::EmployeeMetadata;
use crate::kiosk::{KioskError, KioskHandle, SessionSnapshot};
use zbus::interface;

/// D-Bus interface for the Clockface kiosk daemon.
///
/// Bus name: io.clockface.Kiosk1
/// Object path: /io/clockface/Kiosk1
///
/// Session-changing methods return the resulting snapshot as JSON.
pub struct KioskService {
    pub kiosk: KioskHandle,
    pub camera_device: String,
    pub store_url: String,
}

fn to_fdo(err: KioskError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn snapshot_json(result: Result<SessionSnapshot, KioskError>) -> zbus::fdo::Result<String> {
    let snapshot = result.map_err(to_fdo)?;
    serde_json::to_string(&snapshot).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "io.clockface.Kiosk1")]
impl KioskService {
    /// Start an enrollment session, tearing down any active session.
    async fn start_enrollment(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_enrollment requested");
        snapshot_json(self.kiosk.start_enrollment().await)
    }

    /// Start a check-in session, tearing down any active session.
    async fn start_check_in(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_check_in requested");
        snapshot_json(self.kiosk.start_check_in().await)
    }

    /// Capture the current frame. Returns once extraction (and matching) finished.
    async fn capture(&self) -> zbus::fdo::Result<String> {
        tracing::debug!("capture requested");
        snapshot_json(self.kiosk.capture().await)
    }

    async fn remove_sample(&self, index: u32) -> zbus::fdo::Result<String> {
        tracing::debug!(index, "remove_sample requested");
        snapshot_json(self.kiosk.remove_sample(index as usize).await)
    }

    /// Submit the enrollment. `metadata` is a camelCase JSON object.
    async fn submit(&self, metadata: &str) -> zbus::fdo::Result<String> {
        let metadata: EmployeeMetadata = serde_json::from_str(metadata)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid metadata: {e}")))?;
        tracing::info!(employee_id = %metadata.employee_id, "submit requested");
        snapshot_json(self.kiosk.submit(metadata).await)
    }

    /// Record the check-in of the matched employee.
    async fn confirm(&self) -> zbus::fdo::Result<String> {
        tracing::info!("confirm requested");
        snapshot_json(self.kiosk.confirm().await)
    }

    async fn cancel(&self) -> zbus::fdo::Result<String> {
        snapshot_json(self.kiosk.cancel().await)
    }

    async fn retry(&self) -> zbus::fdo::Result<String> {
        snapshot_json(self.kiosk.retry().await)
    }

    /// Release the camera and return the active session to idle.
    async fn reset(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reset requested");
        snapshot_json(self.kiosk.reset().await)
    }

    /// Current session snapshot.
    async fn state(&self) -> zbus::fdo::Result<String> {
        snapshot_json(self.kiosk.snapshot().await)
    }

    /// PNG bytes of enrollment sample `index`, or of the check-in photo.
    async fn sample_image(&self, index: u32) -> zbus::fdo::Result<Vec<u8>> {
        let image = self
            .kiosk
            .sample_image(index as usize)
            .await
            .map_err(to_fdo)?;
        Ok(image.as_bytes().to_vec())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.kiosk.snapshot().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera_device": self.camera_device,
            "camera_active": snapshot.camera_active(),
            "store_url": self.store_url,
            "session": snapshot.state_name(),
        })
        .to_string())
    }
}
