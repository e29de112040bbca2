use crate::engine::{EngineError, EngineHandle, RegisterRequest};
use std::path::PathBuf;
use zbus::interface;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn as_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|err| zbus::fdo::Error::Failed(err.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.engine.status().await.map_err(to_fdo)?;
        as_json(&report)
    }

    /// Return the latest overlay snapshot (faces, session, frame) as JSON.
    async fn overlay(&self) -> zbus::fdo::Result<String> {
        as_json(&self.engine.overlay())
    }

    /// Re-resolve the active timetable session now instead of waiting
    /// for the periodic refresh. Returns the session as JSON, `null`
    /// when no slot covers the current time.
    async fn refresh_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("session refresh requested");
        let session = self.engine.refresh_session().await.map_err(to_fdo)?;
        as_json(&session)
    }

    /// Rebuild the embedding gallery from the student roster. Returns
    /// the number of loaded gallery entries.
    async fn reload_roster(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("roster reload requested");
        let entries = self.engine.reload_roster().await.map_err(to_fdo)?;
        Ok(entries as u32)
    }

    /// Register a student from photos on disk and return a JSON receipt.
    async fn register(
        &self,
        name: &str,
        roll: &str,
        group_id: i64,
        photo_paths: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, roll, group_id, photos = photo_paths.len(), "registration requested");
        let outcome = self
            .engine
            .register(RegisterRequest {
                display_name: name.to_string(),
                roll_number: roll.to_string(),
                group_id,
                photo_paths: photo_paths.into_iter().map(PathBuf::from).collect(),
            })
            .await
            .map_err(to_fdo)?;
        as_json(&outcome)
    }
}
