use anyhow::{Context, Result};
use rollcall_core::OracleError;
use rollcall_hw::CameraError;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    let (handle, engine_thread) = engine::spawn_engine(&config).map_err(describe_startup_error)?;

    let service = dbus::AttendanceService::new(handle);
    let _conn = zbus::connection::Builder::session()?
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", service)?
        .build()
        .await
        .context("failed to claim org.rollcall.Attendance1 on the session bus")?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    engine_thread.shutdown();
    Ok(())
}

/// Wrap startup failures with an actionable hint where one exists.
fn describe_startup_error(err: engine::EngineError) -> anyhow::Error {
    let hint = match &err {
        engine::EngineError::Camera(CameraError::DeviceUnavailable(_)) => Some(
            "no camera found; check ROLLCALL_CAMERA_INDEX and that the camera is connected",
        ),
        engine::EngineError::Camera(CameraError::DeviceBusy) => Some(
            "the camera is held by another application; close it and restart rollcalld",
        ),
        engine::EngineError::Oracle(OracleError::ModelNotFound(_)) => Some(
            "model files are missing; point ROLLCALL_MODEL_DIR at the directory holding the ONNX models",
        ),
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::Error::new(err).context(hint),
        None => anyhow::Error::new(err),
    }
}
