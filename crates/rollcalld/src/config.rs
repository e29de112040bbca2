use rollcall_core::IdentifySettings;
use rollcall_hw::CameraSettings;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding per-student embedding files.
    pub embeddings_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device index (`/dev/video{index}`).
    pub camera_index: u32,
    /// Requested capture resolution.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Sleep between grabs in the capture loop.
    pub capture_interval: Duration,
    /// Embedding vector length; gallery entries of any other length are
    /// skipped at load.
    pub embedding_dim: usize,
    /// Maximum gallery distance that still counts as a match.
    pub match_threshold: f32,
    /// Downscale factor applied to frames before detection.
    pub downscale_factor: f32,
    /// Run inference on every n-th engine cycle.
    pub detect_stride: u32,
    /// Minimum gap between two inference runs.
    pub min_detect_interval: Duration,
    /// Engine cycle tick.
    pub tick: Duration,
    /// How often the active session is re-resolved against the timetable.
    pub session_refresh: Duration,
    /// Teacher whose timetable gates attendance recording.
    pub teacher_id: i64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        let embeddings_dir = std::env::var("ROLLCALL_EMBEDDINGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("embeddings"));

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        Self {
            db_path,
            embeddings_dir,
            model_dir,
            camera_index: env_u32("ROLLCALL_CAMERA_INDEX", 0),
            camera_width: env_u32("ROLLCALL_CAMERA_WIDTH", 640),
            camera_height: env_u32("ROLLCALL_CAMERA_HEIGHT", 480),
            capture_interval: Duration::from_millis(env_u64("ROLLCALL_CAPTURE_INTERVAL_MS", 10)),
            embedding_dim: env_usize("ROLLCALL_EMBEDDING_DIM", 128),
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.6),
            downscale_factor: env_f32("ROLLCALL_DOWNSCALE_FACTOR", 0.25),
            detect_stride: env_u32("ROLLCALL_DETECT_STRIDE", 3),
            min_detect_interval: Duration::from_millis(env_u64(
                "ROLLCALL_MIN_DETECT_INTERVAL_MS",
                300,
            )),
            tick: Duration::from_millis(env_u64("ROLLCALL_TICK_MS", 20)),
            session_refresh: Duration::from_secs(env_u64("ROLLCALL_SESSION_REFRESH_SECS", 30)),
            teacher_id: env_i64("ROLLCALL_TEACHER_ID", 1),
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("version-RFB-320.onnx")
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("mobilefacenet.onnx")
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            index: self.camera_index,
            width: self.camera_width,
            height: self.camera_height,
            capture_interval: self.capture_interval,
        }
    }

    pub fn identify_settings(&self) -> IdentifySettings {
        IdentifySettings {
            match_threshold: self.match_threshold,
            downscale_factor: self.downscale_factor,
            detect_stride: self.detect_stride,
            min_detect_interval: self.min_detect_interval,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
