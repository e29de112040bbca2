//! Attendance engine thread.
//!
//! One dedicated OS thread owns every stateful resource: the store,
//! the embedding gallery, the identification pipeline and the frame
//! source. D-Bus handlers talk to it over a channel and never touch
//! those resources directly. Between requests the thread ticks on a
//! receive timeout and runs the identification cycle: grab the latest
//! frame, identify faces, record attendance for matches inside the
//! active session window, publish an overlay snapshot.

use crate::config::Config;
use chrono::{DateTime, Local, NaiveDateTime};
use rollcall_core::enroll::{self, EnrollError};
use rollcall_core::onnx::OnnxOracle;
use rollcall_core::{
    EmbeddingGallery, FaceBox, FrameRef, IdentificationEngine, OracleError, RosterEntry,
};
use rollcall_hw::{CameraError, FrameSource, V4lOpener};
use rollcall_store::{ActiveSession, MarkOutcome, SessionKey, Store, StoreError};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registration error: {0}")]
    Enroll(#[from] EnrollError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// The session window currently gating attendance, shaped for JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub slot_id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub course_id: Option<i64>,
    pub course_name: Option<String>,
    pub start: String,
    pub end: String,
}

impl SessionInfo {
    fn from_active(session: &ActiveSession) -> Self {
        SessionInfo {
            slot_id: session.slot_id,
            group_id: session.group_id,
            group_name: session.group_name.clone(),
            course_id: session.course_id,
            course_name: session.course_name.clone(),
            start: session.start.format("%H:%M").to_string(),
            end: session.end.format("%H:%M").to_string(),
        }
    }
}

/// One face from the latest identification cycle.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayFace {
    /// Roster id of the match, `None` for an unknown face.
    pub student_id: Option<i64>,
    pub display_name: String,
    pub distance: Option<f32>,
    /// Bounding box in full-frame coordinates.
    pub bbox: FaceBox,
    /// Set on the single cycle where this student's attendance row was
    /// created, so a UI can flash a confirmation exactly once.
    pub newly_recorded: bool,
}

/// Snapshot published after every identification cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OverlaySnapshot {
    pub faces: Vec<OverlayFace>,
    pub session: Option<SessionInfo>,
    /// Capture sequence of the frame behind this snapshot.
    pub frame_sequence: Option<u32>,
}

/// Answer to a `Status` request.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: String,
    pub camera_running: bool,
    pub gallery_size: usize,
    pub session: Option<SessionInfo>,
    pub recorded_today: i64,
    pub identify_calls: u64,
    pub inference_runs: u64,
}

/// Parameters for registering a student through the daemon.
pub struct RegisterRequest {
    pub display_name: String,
    pub roll_number: String,
    pub group_id: i64,
    pub photo_paths: Vec<PathBuf>,
}

/// Receipt for a completed registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    pub student_id: i64,
    pub roll_number: String,
    pub embedding_path: PathBuf,
    pub gallery_size: usize,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    RefreshSession {
        reply: oneshot::Sender<Result<Option<SessionInfo>, EngineError>>,
    },
    ReloadRoster {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Register {
        request: RegisterRequest,
        reply: oneshot::Sender<Result<RegisterOutcome, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    overlay: watch::Receiver<OverlaySnapshot>,
}

impl EngineHandle {
    /// Re-resolve the active session immediately.
    pub async fn refresh_session(&self) -> Result<Option<SessionInfo>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::RefreshSession { reply: reply_tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Rebuild the gallery from the roster; returns the entry count.
    pub async fn reload_roster(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ReloadRoster { reply: reply_tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Register a student from photos on disk, reusing the engine's
    /// already-loaded models.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                request,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// The most recently published overlay snapshot.
    pub fn overlay(&self) -> OverlaySnapshot {
        self.overlay.borrow().clone()
    }
}

/// Owner of the engine thread join handle, kept by `main` for shutdown.
pub struct EngineThread {
    tx: mpsc::Sender<EngineRequest>,
    join: std::thread::JoinHandle<()>,
}

impl EngineThread {
    /// Ask the engine to stop and wait for it to finish. The camera is
    /// stopped by the engine on its way out.
    pub fn shutdown(self) {
        let _ = self.tx.send(EngineRequest::Shutdown);
        if self.join.join().is_err() {
            tracing::error!("engine thread panicked during shutdown");
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the database, loads the gallery and both ONNX models, and
/// starts camera capture synchronously, so a missing resource fails
/// daemon startup instead of surfacing mid-session.
pub fn spawn_engine(config: &Config) -> Result<(EngineHandle, EngineThread), EngineError> {
    let store = Store::open(&config.db_path)?;

    let gallery = load_gallery(&store, config.embedding_dim)?;
    info!(
        entries = gallery.len(),
        dim = config.embedding_dim,
        "embedding gallery loaded"
    );

    let detector_path = config.detector_model_path();
    let embedder_path = config.embedder_model_path();
    let oracle = OnnxOracle::load(&detector_path, &embedder_path)?;
    info!(
        detector = %detector_path.display(),
        embedder = %embedder_path.display(),
        "face models loaded"
    );

    let mut source = FrameSource::new(Box::new(V4lOpener), config.camera_settings());
    source.start()?;
    info!(index = config.camera_index, "camera capture started");

    let identifier = IdentificationEngine::new(Box::new(oracle), config.identify_settings());

    let (tx, rx) = mpsc::channel::<EngineRequest>();
    let (overlay_tx, overlay_rx) = watch::channel(OverlaySnapshot::default());

    let engine = Engine {
        store,
        source,
        identifier,
        gallery,
        embeddings_dir: config.embeddings_dir.clone(),
        embedding_dim: config.embedding_dim,
        teacher_id: config.teacher_id,
        session_refresh: config.session_refresh,
        session: None,
        session_checked_at: None,
        current_key: None,
        marked: HashSet::new(),
        overlay_tx,
    };

    let tick = config.tick;
    let join = std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            info!("engine thread started");
            engine.run(rx, tick);
            info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok((
        EngineHandle {
            tx: tx.clone(),
            overlay: overlay_rx,
        },
        EngineThread { tx, join },
    ))
}

/// Build the gallery from every student row's embedding file.
fn load_gallery(store: &Store, dim: usize) -> Result<EmbeddingGallery, EngineError> {
    let students = store.students()?;
    let roster: Vec<RosterEntry> = students
        .into_iter()
        .map(|s| RosterEntry {
            student_id: s.id,
            display_name: s.name,
            embedding_path: s.embedding_path,
        })
        .collect();
    Ok(EmbeddingGallery::load(dim, &roster))
}

/// All engine state, owned by the engine thread.
struct Engine {
    store: Store,
    source: FrameSource,
    identifier: IdentificationEngine,
    gallery: EmbeddingGallery,
    embeddings_dir: PathBuf,
    embedding_dim: usize,
    teacher_id: i64,
    session_refresh: Duration,
    session: Option<ActiveSession>,
    session_checked_at: Option<Instant>,
    /// Attendance scope of `session` on the current day. Changing key
    /// resets `marked`.
    current_key: Option<SessionKey>,
    /// Students already written for the current scope, so steady-state
    /// cycles skip the insert entirely.
    marked: HashSet<i64>,
    overlay_tx: watch::Sender<OverlaySnapshot>,
}

impl Engine {
    fn run(mut self, rx: mpsc::Receiver<EngineRequest>, tick: Duration) {
        loop {
            match rx.recv_timeout(tick) {
                Ok(EngineRequest::Shutdown) => break,
                Ok(req) => self.handle(req),
                Err(RecvTimeoutError::Timeout) => self.cycle(Local::now()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.source.stop();
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::RefreshSession { reply } => {
                let result = self
                    .resolve_session(Local::now().naive_local())
                    .map(|_| self.session.as_ref().map(SessionInfo::from_active));
                let _ = reply.send(result);
            }
            EngineRequest::ReloadRoster { reply } => {
                let _ = reply.send(self.reload_roster());
            }
            EngineRequest::Register { request, reply } => {
                let _ = reply.send(self.register(request));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Shutdown => {}
        }
    }

    /// One identification cycle, run on every idle tick.
    fn cycle(&mut self, now: DateTime<Local>) {
        self.refresh_session_if_stale(now.naive_local());

        let key = self
            .session
            .as_ref()
            .map(|s| s.session_key(now.date_naive()));
        if key != self.current_key {
            debug!(?key, "session scope changed");
            self.marked.clear();
            self.current_key = key;
        }

        let frame = self.source.latest_frame();
        let frame_ref = frame.as_deref().map(|f| FrameRef {
            data: &f.data,
            width: f.width,
            height: f.height,
        });

        let identifications = match self.identifier.identify(frame_ref, &self.gallery) {
            Ok(identifications) => identifications,
            Err(err) => {
                warn!(error = %err, "identification failed");
                return;
            }
        };

        let mut faces = Vec::with_capacity(identifications.len());
        for ident in identifications {
            let newly_recorded = match (ident.student_id, self.current_key.clone()) {
                (Some(student_id), Some(key)) => self.record(student_id, &key, now),
                _ => false,
            };
            faces.push(OverlayFace {
                student_id: ident.student_id,
                display_name: ident.display_name,
                distance: ident.distance,
                bbox: ident.bbox,
                newly_recorded,
            });
        }

        self.overlay_tx.send_replace(OverlaySnapshot {
            faces,
            session: self.session.as_ref().map(SessionInfo::from_active),
            frame_sequence: frame.as_ref().map(|f| f.sequence),
        });
    }

    /// Record `student_id` for the current scope. Returns true only on
    /// the cycle that actually created the row; the unique constraint
    /// in the store is the authority, `marked` just skips redundant
    /// inserts on later cycles.
    fn record(&mut self, student_id: i64, key: &SessionKey, now: DateTime<Local>) -> bool {
        if self.marked.contains(&student_id) {
            return false;
        }
        match self.store.mark_present(student_id, key, now) {
            Ok(outcome) => {
                self.marked.insert(student_id);
                match outcome {
                    MarkOutcome::Recorded => {
                        info!(student_id, group_id = key.group_id, "attendance recorded");
                        true
                    }
                    MarkOutcome::AlreadyRecorded => false,
                }
            }
            Err(err) => {
                warn!(error = %err, student_id, "failed to record attendance");
                false
            }
        }
    }

    fn refresh_session_if_stale(&mut self, now: NaiveDateTime) {
        let stale = match self.session_checked_at {
            None => true,
            Some(checked) => checked.elapsed() >= self.session_refresh,
        };
        if !stale {
            return;
        }
        if let Err(err) = self.resolve_session(now) {
            // Keep gating on the last known session rather than
            // dropping attendance over a transient store error.
            warn!(error = %err, "session lookup failed");
        }
    }

    fn resolve_session(&mut self, now: NaiveDateTime) -> Result<(), EngineError> {
        self.session_checked_at = Some(Instant::now());
        let session = self.store.active_session(self.teacher_id, now)?;
        match (&self.session, &session) {
            (None, Some(new)) => {
                info!(
                    group = %new.group_name,
                    start = %new.start,
                    end = %new.end,
                    "session started"
                );
            }
            (Some(old), None) => {
                info!(group = %old.group_name, "session ended");
            }
            (Some(old), Some(new)) if old.slot_id != new.slot_id => {
                info!(
                    group = %new.group_name,
                    start = %new.start,
                    "session changed"
                );
            }
            _ => {}
        }
        self.session = session;
        Ok(())
    }

    fn reload_roster(&mut self) -> Result<usize, EngineError> {
        self.gallery = load_gallery(&self.store, self.embedding_dim)?;
        info!(entries = self.gallery.len(), "gallery reloaded");
        Ok(self.gallery.len())
    }

    /// Full registration flow: claim the roll number, build the
    /// reference embedding from the photos, persist the path, reload
    /// the gallery. A failed enrollment rolls the student row back so
    /// the roll number stays free.
    fn register(&mut self, request: RegisterRequest) -> Result<RegisterOutcome, EngineError> {
        let student_id = self.store.add_student(
            &request.roll_number,
            &request.display_name,
            request.group_id,
        )?;

        let embedding_path = match enroll::register_identity(
            self.identifier.oracle_mut(),
            &request.photo_paths,
            &request.display_name,
            &request.roll_number,
            &self.embeddings_dir,
        ) {
            Ok(path) => path,
            Err(err) => {
                if let Err(remove_err) = self.store.remove_student(&request.roll_number) {
                    warn!(
                        error = %remove_err,
                        roll = %request.roll_number,
                        "failed to roll back student after enrollment error"
                    );
                }
                return Err(err.into());
            }
        };

        self.store.set_embedding_path(student_id, &embedding_path)?;
        let gallery_size = self.reload_roster()?;
        info!(
            student_id,
            roll = %request.roll_number,
            path = %embedding_path.display(),
            "student registered"
        );

        Ok(RegisterOutcome {
            student_id,
            roll_number: request.roll_number,
            embedding_path,
            gallery_size,
        })
    }

    fn status(&self) -> StatusReport {
        let today = Local::now().date_naive();
        let recorded_today = match self.store.attendance_count(today) {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "attendance count failed");
                0
            }
        };
        StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            camera_running: self.source.is_running(),
            gallery_size: self.gallery.len(),
            session: self.session.as_ref().map(SessionInfo::from_active),
            recorded_today,
            identify_calls: self.identifier.calls(),
            inference_runs: self.identifier.heavy_runs(),
        }
    }
}
