use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clockface_hw::{CameraSource, CaptureConstraints, V4l2Source};
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};

// `#[zbus::proxy]` generates `KioskProxy` (async); only the async variant is used.
#[zbus::proxy(
    interface = "io.clockface.Kiosk1",
    default_service = "io.clockface.Kiosk1",
    default_path = "/io/clockface/Kiosk1"
)]
trait Kiosk {
    async fn start_enrollment(&self) -> zbus::Result<String>;
    async fn start_check_in(&self) -> zbus::Result<String>;
    async fn capture(&self) -> zbus::Result<String>;
    async fn submit(&self, metadata: &str) -> zbus::Result<String>;
    async fn confirm(&self) -> zbus::Result<String>;
    async fn reset(&self) -> zbus::Result<String>;
    async fn state(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "clockface", about = "Clockface face check-in kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new employee from live camera captures
    Enroll {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        employee_id: String,
        /// Engineering, HR, Sales, Marketing, Finance or Operations
        #[arg(long)]
        department: String,
        #[arg(long)]
        position: String,
        /// Number of samples to capture
        #[arg(long, default_value_t = 3)]
        samples: usize,
    },
    /// Identify the person in front of the camera
    CheckIn {
        /// Record the check-in without asking when a match is found
        #[arg(long)]
        yes: bool,
    },
    /// Print the current session snapshot
    State,
    /// Release the camera and reset the active session
    Reset,
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    TestCamera {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Write the last captured frame as PNG
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// How long to wait for a face before giving up.
const FACE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll {
            first_name,
            last_name,
            email,
            employee_id,
            department,
            position,
            samples,
        } => {
            let metadata = serde_json::json!({
                "firstName": first_name,
                "lastName": last_name,
                "email": email,
                "employeeId": employee_id,
                "department": department,
                "position": position,
            });
            let kiosk = connect(cli.system).await?;
            let result = enroll(&kiosk, &metadata, samples).await;
            if result.is_err() {
                let _ = kiosk.reset().await;
            }
            result?;
        }
        Commands::CheckIn { yes } => {
            let kiosk = connect(cli.system).await?;
            let result = check_in(&kiosk, yes).await;
            let _ = kiosk.reset().await;
            result?;
        }
        Commands::State => {
            let kiosk = connect(cli.system).await?;
            let state: Value = serde_json::from_str(&kiosk.state().await?)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Reset => {
            let kiosk = connect(cli.system).await?;
            kiosk.reset().await?;
            println!("Session reset");
        }
        Commands::Status => {
            let kiosk = connect(cli.system).await?;
            let status: Value = serde_json::from_str(&kiosk.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::TestCamera { device, output } => test_camera(&device, output.as_deref())?,
    }

    Ok(())
}

async fn connect(system: bool) -> Result<KioskProxy<'static>> {
    tracing::debug!(bus = if system { "system" } else { "session" }, "connecting to clockfaced");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    KioskProxy::new(&conn)
        .await
        .context("clockfaced is not reachable")
}

async fn enroll(kiosk: &KioskProxy<'_>, metadata: &Value, samples: usize) -> Result<()> {
    kiosk.start_enrollment().await?;
    println!("Camera started. Look at the camera.");

    let mut taken = 0;
    while taken < samples {
        wait_for_face(kiosk).await?;
        let reply = match kiosk.capture().await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(error = %e, taken, "capture call failed");
                println!("  capture failed: {e}");
                continue;
            }
        };
        let snapshot: Value = serde_json::from_str(&reply)?;
        if let Some(err) = snapshot["last_error"].as_str() {
            println!("  capture dropped: {err}");
            continue;
        }
        taken = snapshot["samples"].as_array().map_or(taken, Vec::len);
        println!("  sample {taken}/{samples} captured");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let snapshot: Value = serde_json::from_str(&kiosk.submit(&metadata.to_string()).await?)?;
    match state_name(&snapshot) {
        "submitted" => println!(
            "Enrolled {} {}",
            metadata["firstName"].as_str().unwrap_or_default(),
            metadata["lastName"].as_str().unwrap_or_default()
        ),
        _ => bail!(
            "enrollment failed: {}",
            snapshot["last_error"].as_str().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

async fn check_in(kiosk: &KioskProxy<'_>, yes: bool) -> Result<()> {
    kiosk.start_check_in().await?;
    println!("Camera started. Look at the camera.");
    wait_for_face(kiosk).await?;

    let snapshot: Value = serde_json::from_str(&kiosk.capture().await?)?;
    if state_name(&snapshot) != "matched" {
        let message = snapshot["message"].as_str().unwrap_or("face not recognized");
        bail!("{message}");
    }
    let employee = &snapshot["matched_employee"];
    println!(
        "Matched {} ({})",
        employee["display_name"].as_str().unwrap_or("?"),
        employee["employee_id"].as_str().unwrap_or("?")
    );

    if !yes {
        println!("Not confirmed; pass --yes to record the check-in.");
        return Ok(());
    }
    let snapshot: Value = serde_json::from_str(&kiosk.confirm().await?)?;
    match state_name(&snapshot) {
        "confirmed" => println!("{}", snapshot["message"].as_str().unwrap_or("Checked in")),
        _ => bail!(
            "check-in rejected: {}",
            snapshot["last_error"].as_str().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

async fn wait_for_face(kiosk: &KioskProxy<'_>) -> Result<()> {
    let started = Instant::now();
    loop {
        let snapshot: Value = serde_json::from_str(&kiosk.state().await?)?;
        if snapshot["face_detected"].as_bool() == Some(true) {
            return Ok(());
        }
        if let Some(err) = snapshot["last_error"].as_str() {
            if state_name(&snapshot) == "idle" {
                bail!("{err}");
            }
        }
        tracing::trace!(state = state_name(&snapshot), "waiting for a face");
        if started.elapsed() > FACE_TIMEOUT {
            bail!("no face detected within {}s", FACE_TIMEOUT.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn state_name(snapshot: &Value) -> &str {
    snapshot["state"]["name"].as_str().unwrap_or("none")
}

fn test_camera(device: &str, output: Option<&std::path::Path>) -> Result<()> {
    println!("Opening {device}...");
    let mut stream = V4l2Source::new(device)
        .acquire(&CaptureConstraints::default())
        .with_context(|| format!("acquiring {device}"))?;

    let mut last = None;
    let mut dark = 0;
    for _ in 0..10 {
        let frame = stream.next_frame()?;
        tracing::debug!(seq = frame.sequence, dark = frame.is_dark, "frame captured");
        if frame.is_dark {
            dark += 1;
        }
        last = Some(frame);
    }
    let Some(frame) = last else {
        bail!("no frames captured");
    };
    println!(
        "Captured 10 frames at {}x{} ({dark} dark), last brightness {:.1}",
        frame.width,
        frame.height,
        frame.avg_brightness()
    );

    if let Some(path) = output {
        std::fs::write(path, frame.encode_png()?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_name_from_snapshot() {
        let snapshot: Value = serde_json::from_str(
            r#"{"kind":"check_in","camera_active":true,"state":{"name":"matched"}}"#,
        )
        .unwrap();
        assert_eq!(state_name(&snapshot), "matched");
        assert_eq!(state_name(&serde_json::json!({"kind":"none"})), "none");
    }

    #[test]
    fn test_cli_parses_check_in() {
        let cli = Cli::try_parse_from(["clockface", "check-in", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckIn { yes: true }));
        assert!(!cli.system);
    }
}
