use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use rollcall_core::enroll::{self, EnrollError};
use rollcall_core::onnx::OnnxOracle;
use rollcall_hw::camera::{self, CaptureDevice, DeviceOpener, V4lOpener};
use rollcall_hw::CameraSettings;
use rollcall_store::{ReportRow, Store};
use std::path::PathBuf;
use std::time::Duration;

// `#[zbus::proxy]` generates `AttendanceProxy` (async). Daemon calls
// are best-effort except `status`, which exists only to query it.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_roster(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from one or more photos
    Register {
        /// Student display name
        #[arg(short, long)]
        name: String,
        /// Roll number (unique)
        #[arg(short, long)]
        roll: String,
        /// Group id the student belongs to
        #[arg(short, long)]
        group: i64,
        /// Photo files to build the reference embedding from
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// List registered students
    Students,
    /// Remove a student and their embedding file
    Remove {
        /// Roll number of the student to remove
        #[arg(short, long)]
        roll: String,
    },
    /// Manage student groups
    Group {
        #[command(subcommand)]
        action: NameAction,
    },
    /// Manage teachers
    Teacher {
        #[command(subcommand)]
        action: NameAction,
    },
    /// Manage courses
    Course {
        #[command(subcommand)]
        action: NameAction,
    },
    /// Manage timetable slots
    Slot {
        #[command(subcommand)]
        action: SlotAction,
    },
    /// Export a day's attendance report as CSV
    Export {
        /// Day to export (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Output file (default attendance_report_<date>.csv)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Open the camera and grab one frame
    CameraTest {
        /// V4L2 device index (default ROLLCALL_CAMERA_INDEX or 0)
        #[arg(long)]
        index: Option<u32>,
    },
}

#[derive(Subcommand)]
enum NameAction {
    /// Add by name (returns the existing id if already present)
    Add { name: String },
    /// List all entries
    List,
}

#[derive(Subcommand)]
enum SlotAction {
    /// Add a recurring timetable slot
    Add {
        /// Teacher id
        #[arg(long)]
        teacher: i64,
        /// Group id
        #[arg(long)]
        group: i64,
        /// Course id (optional)
        #[arg(long)]
        course: Option<i64>,
        /// Weekday, 0 = Monday … 6 = Sunday
        #[arg(long)]
        day: u8,
        /// Start time, HH:MM
        #[arg(long)]
        start: String,
        /// End time, HH:MM (exclusive)
        #[arg(long)]
        end: String,
    },
    /// List timetable slots
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register {
            name,
            roll,
            group,
            photos,
        } => run_register(&name, &roll, group, &photos).await,
        Commands::Students => run_students(),
        Commands::Remove { roll } => run_remove(&roll).await,
        Commands::Group { action } => run_named(action, "group"),
        Commands::Teacher { action } => run_named(action, "teacher"),
        Commands::Course { action } => run_named(action, "course"),
        Commands::Slot { action } => run_slot(action),
        Commands::Export { date, out } => run_export(date, out),
        Commands::Status => run_status().await,
        Commands::CameraTest { index } => run_camera_test(index),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn db_path() -> PathBuf {
    std::env::var("ROLLCALL_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("rollcall.db"))
}

fn embeddings_dir() -> PathBuf {
    std::env::var("ROLLCALL_EMBEDDINGS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("embeddings"))
}

fn model_dir() -> PathBuf {
    std::env::var("ROLLCALL_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("models"))
}

fn open_store() -> Result<Store> {
    let path = db_path();
    Store::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

fn load_oracle() -> Result<OnnxOracle> {
    let dir = model_dir();
    OnnxOracle::load(&dir.join("version-RFB-320.onnx"), &dir.join("mobilefacenet.onnx"))
        .with_context(|| {
            format!(
                "failed to load face models from {}; set ROLLCALL_MODEL_DIR if they live elsewhere",
                dir.display()
            )
        })
}

async fn run_register(name: &str, roll: &str, group: i64, photos: &[PathBuf]) -> Result<()> {
    let store = open_store()?;
    let student_id = store.add_student(roll, name, group)?;

    let mut oracle = load_oracle()?;
    let embedding_path =
        match enroll::register_identity(&mut oracle, photos, name, roll, &embeddings_dir()) {
            Ok(path) => path,
            Err(err) => {
                // Free the roll number again so the command can be retried.
                if let Err(remove_err) = store.remove_student(roll) {
                    eprintln!("note: could not roll back student record: {remove_err}");
                }
                match err {
                    EnrollError::NoFaceDetected => {
                        bail!("no usable face found in the provided photos; retake them with the face clearly visible")
                    }
                    other => return Err(other.into()),
                }
            }
        };
    store.set_embedding_path(student_id, &embedding_path)?;

    println!(
        "registered {name} (roll {roll}), embedding at {}",
        embedding_path.display()
    );
    notify_daemon_reload().await;
    Ok(())
}

/// Ask a running daemon to reload its gallery. Purely best-effort: the
/// CLI works without the daemon.
async fn notify_daemon_reload() {
    match daemon_reload().await {
        Ok(entries) => println!("daemon gallery reloaded ({entries} entries)"),
        Err(err) => eprintln!("note: could not reach rollcalld to reload the gallery: {err}"),
    }
}

async fn daemon_reload() -> zbus::Result<u32> {
    let conn = zbus::Connection::session().await?;
    let proxy = AttendanceProxy::new(&conn).await?;
    proxy.reload_roster().await
}

fn run_students() -> Result<()> {
    let store = open_store()?;
    let students = store.students()?;
    if students.is_empty() {
        println!("no students registered");
        return Ok(());
    }
    println!("{:<12} {:<24} {:<12} embedding", "roll", "name", "group");
    for s in &students {
        let embedding = s
            .embedding_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:<24} {:<12} {}", s.roll_number, s.name, s.group_name, embedding);
    }
    Ok(())
}

async fn run_remove(roll: &str) -> Result<()> {
    let store = open_store()?;
    let Some(student) = store.remove_student(roll)? else {
        bail!("no student with roll number {roll}");
    };
    if let Some(path) = &student.embedding_path {
        if let Err(err) = std::fs::remove_file(path) {
            eprintln!("note: could not remove {}: {err}", path.display());
        }
    }
    println!("removed {} (roll {})", student.name, student.roll_number);
    notify_daemon_reload().await;
    Ok(())
}

fn run_named(action: NameAction, kind: &str) -> Result<()> {
    let store = open_store()?;
    match action {
        NameAction::Add { name } => {
            let id = match kind {
                "group" => store.add_group(&name)?,
                "teacher" => store.add_teacher(&name)?,
                _ => store.add_course(&name)?,
            };
            println!("{kind} {name} has id {id}");
        }
        NameAction::List => {
            let rows: Vec<(i64, String)> = match kind {
                "group" => store.groups()?.into_iter().map(|g| (g.id, g.name)).collect(),
                "teacher" => store
                    .teachers()?
                    .into_iter()
                    .map(|t| (t.id, t.name))
                    .collect(),
                _ => store.courses()?.into_iter().map(|c| (c.id, c.name)).collect(),
            };
            if rows.is_empty() {
                println!("no {kind}s");
            }
            for (id, name) in rows {
                println!("{id:<6} {name}");
            }
        }
    }
    Ok(())
}

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn run_slot(action: SlotAction) -> Result<()> {
    let store = open_store()?;
    match action {
        SlotAction::Add {
            teacher,
            group,
            course,
            day,
            start,
            end,
        } => {
            let start = parse_time(&start)?;
            let end = parse_time(&end)?;
            let id = store.add_timetable_slot(teacher, group, course, day, start, end)?;
            println!("slot {id} added");
        }
        SlotAction::List => {
            let slots = store.timetable()?;
            if slots.is_empty() {
                println!("no timetable slots");
                return Ok(());
            }
            for slot in &slots {
                let day = WEEKDAYS
                    .get(slot.day_of_week as usize)
                    .copied()
                    .unwrap_or("?");
                let course = slot.course_name.as_deref().unwrap_or("-");
                println!(
                    "{:<4} {day} {}-{}  {:<16} {:<16} {}",
                    slot.id,
                    slot.start.format("%H:%M"),
                    slot.end.format("%H:%M"),
                    slot.teacher_name,
                    slot.group_name,
                    course,
                );
            }
        }
    }
    Ok(())
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .with_context(|| format!("invalid time {value:?}, expected HH:MM"))
}

fn run_export(date: Option<NaiveDate>, out: Option<PathBuf>) -> Result<()> {
    let store = open_store()?;
    let day = date.unwrap_or_else(|| Local::now().date_naive());
    let rows = store.daily_report(day)?;
    if rows.is_empty() {
        println!("no attendance records for {day}");
        return Ok(());
    }

    let path = out.unwrap_or_else(|| PathBuf::from(format!("attendance_report_{day}.csv")));
    let csv = render_csv(&rows);
    std::fs::write(&path, csv)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    println!("report saved: {} ({} rows)", path.display(), rows.len());
    Ok(())
}

fn render_csv(rows: &[ReportRow]) -> String {
    let mut csv = String::from("Roll Number,Name,Group,Course,Time,Status\n");
    for row in rows {
        let fields = [
            row.roll_number.clone(),
            row.student_name.clone(),
            row.group_name.clone(),
            row.course_name.clone().unwrap_or_default(),
            row.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.status.as_str().to_string(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        csv.push_str(&line.join(","));
        csv.push('\n');
    }
    csv
}

/// Quote a CSV field when it contains a delimiter, quote or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

async fn run_status() -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("could not connect to the session bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;
    let raw = proxy
        .status()
        .await
        .context("rollcalld does not appear to be running")?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_camera_test(index: Option<u32>) -> Result<()> {
    let index = index.unwrap_or_else(|| {
        std::env::var("ROLLCALL_CAMERA_INDEX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    });
    let settings = CameraSettings {
        index,
        width: 640,
        height: 480,
        capture_interval: Duration::from_millis(10),
    };

    println!("opening /dev/video{index}...");
    let mut device = match V4lOpener.open(&settings) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("camera open failed: {err}");
            let devices = camera::list_devices();
            if devices.is_empty() {
                eprintln!("no V4L2 capture devices found");
            } else {
                eprintln!("available capture devices:");
                for d in devices {
                    eprintln!("  {}  {} ({})", d.path, d.name, d.driver);
                }
            }
            bail!("camera test failed");
        }
    };

    let frame = device.grab().context("frame capture failed")?;
    println!(
        "captured {}x{} frame, sequence {}, average brightness {:.1}",
        frame.width,
        frame.height,
        frame.sequence,
        frame.avg_brightness()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_store::AttendanceStatus;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("has,comma"), "\"has,comma\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_render_csv_header_and_rows() {
        let rows = vec![ReportRow {
            roll_number: "R-001".into(),
            student_name: "Lovelace, Ada".into(),
            group_name: "10-A".into(),
            course_name: None,
            recorded_at: Local.with_ymd_and_hms(2024, 6, 3, 9, 15, 0).unwrap(),
            status: AttendanceStatus::Present,
        }];
        let csv = render_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Roll Number,Name,Group,Course,Time,Status"
        );
        assert_eq!(
            lines.next().unwrap(),
            "R-001,\"Lovelace, Ada\",10-A,,2024-06-03 09:15:00,PRESENT"
        );
        assert!(lines.next().is_none());
    }
}
