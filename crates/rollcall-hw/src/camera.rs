//! V4L2 camera capture behind a single latest-frame mailbox.
//!
//! A dedicated capture thread grabs frames at a fixed interval and
//! overwrites one shared slot. Readers take a cheap snapshot of that
//! slot and never block the capture loop for longer than the swap. The
//! only state shared between the loop and its readers is the slot and
//! the running flag.

use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Camera selection and capture cadence.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// V4L2 device index (`/dev/video{index}`).
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Sleep between grabs in the capture loop.
    pub capture_interval: Duration,
}

/// A device the capture loop can pull frames from.
pub trait CaptureDevice: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Opens capture devices, so tests can substitute scripted ones.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, converted to RGB).
    Yuyv,
    /// Packed 24-bit RGB, passed through.
    Rgb3,
}

/// V4L2 camera device handle.
pub struct V4lDevice {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lDevice {
    /// Open a V4L2 camera by index and negotiate a usable format.
    pub fn open(settings: &CameraSettings) -> Result<Self, CameraError> {
        let device_path = format!("/dev/video{}", settings.index);
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path}: no such device"
            )));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceUnavailable(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Request YUYV at the configured resolution; accept whatever
        // resolution the driver actually negotiates.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"RGB3") {
            PixelFormat::Rgb3
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or RGB3)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }
}

impl CaptureDevice for V4lDevice {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let data = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}")))?,
            PixelFormat::Rgb3 => {
                let expected = (self.width * self.height * 3) as usize;
                if buf.len() < expected {
                    return Err(CameraError::CaptureFailed(format!(
                        "RGB3 buffer too short: expected {expected}, got {}",
                        buf.len()
                    )));
                }
                buf[..expected].to_vec()
            }
        };

        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }
}

/// Production opener for [`V4lDevice`].
pub struct V4lOpener;

impl DeviceOpener for V4lOpener {
    fn open(&self, settings: &CameraSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Ok(Box::new(V4lDevice::open(settings)?))
    }
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
        });
    }

    devices
}

type FrameSlot = Arc<Mutex<Option<Arc<Frame>>>>;

/// Continuous capture with a one-frame mailbox.
pub struct FrameSource {
    opener: Box<dyn DeviceOpener>,
    settings: CameraSettings,
    latest: FrameSlot,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(opener: Box<dyn DeviceOpener>, settings: CameraSettings) -> Self {
        FrameSource {
            opener,
            settings,
            latest: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Opens the device and starts the capture loop.
    ///
    /// The first frame is read synchronously, so a successful return
    /// guarantees [`latest_frame`] has something to hand out. An open
    /// failure is [`CameraError::DeviceUnavailable`] (or `DeviceBusy`
    /// when the driver says so); a device that opens but cannot produce
    /// a first frame is [`CameraError::DeviceBusy`].
    ///
    /// Calling start on a running source is a no-op. After [`stop`] the
    /// next start re-opens the device from scratch, which also recovers
    /// drivers that invalidate handles across suspend.
    ///
    /// [`latest_frame`]: FrameSource::latest_frame
    /// [`stop`]: FrameSource::stop
    pub fn start(&mut self) -> Result<(), CameraError> {
        if self.running.load(Ordering::SeqCst) {
            tracing::warn!("frame source already running");
            return Ok(());
        }

        let mut device = self.opener.open(&self.settings)?;
        let first = match device.grab() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "first read after open failed");
                return Err(CameraError::DeviceBusy);
            }
        };
        if let Ok(mut slot) = self.latest.lock() {
            *slot = Some(Arc::new(first));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let latest = Arc::clone(&self.latest);
        let interval = self.settings.capture_interval;
        let handle = thread::Builder::new()
            .name("rollcall-capture".to_string())
            .spawn(move || capture_loop(device, latest, running, interval));
        match handle {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CameraError::CaptureFailed(format!(
                    "failed to spawn capture thread: {e}"
                )))
            }
        }
    }

    /// Stops the capture loop and waits for it to finish.
    ///
    /// The device handle is dropped with the loop. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the most recent frame, `None` before the first
    /// capture. Non-blocking and never torn: the slot holds complete
    /// frames only.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.latest.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    latest: FrameSlot,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    tracing::debug!("capture loop started");
    while running.load(Ordering::SeqCst) {
        match device.grab() {
            Ok(frame) => {
                if let Ok(mut slot) = latest.lock() {
                    *slot = Some(Arc::new(frame));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "frame capture failed");
            }
        }
        thread::sleep(interval);
    }
    tracing::debug!("capture loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct ScriptedDevice {
        seq: u32,
        fail_first_grab: bool,
    }

    impl CaptureDevice for ScriptedDevice {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            if self.fail_first_grab && self.seq == 0 {
                self.seq = 1;
                return Err(CameraError::CaptureFailed("scripted grab failure".into()));
            }
            self.seq += 1;
            // Uniform fill tied to the sequence number, so readers can
            // detect a torn frame as mixed bytes.
            let fill = (self.seq % 251) as u8;
            Ok(Frame {
                data: vec![fill; 2 * 2 * 3],
                width: 2,
                height: 2,
                timestamp: Instant::now(),
                sequence: self.seq,
            })
        }
    }

    struct ScriptedOpener {
        opens: Arc<AtomicU32>,
        fail_open: bool,
        fail_first_grab: bool,
    }

    impl ScriptedOpener {
        fn working(opens: Arc<AtomicU32>) -> Self {
            ScriptedOpener {
                opens,
                fail_open: false,
                fail_first_grab: false,
            }
        }
    }

    impl DeviceOpener for ScriptedOpener {
        fn open(&self, _settings: &CameraSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(CameraError::DeviceUnavailable(
                    "/dev/video9: no such device".into(),
                ));
            }
            Ok(Box::new(ScriptedDevice {
                seq: 0,
                fail_first_grab: self.fail_first_grab,
            }))
        }
    }

    fn settings() -> CameraSettings {
        CameraSettings {
            index: 0,
            width: 2,
            height: 2,
            capture_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_latest_frame_none_before_start() {
        let opens = Arc::new(AtomicU32::new(0));
        let source = FrameSource::new(Box::new(ScriptedOpener::working(opens)), settings());
        assert!(source.latest_frame().is_none());
        assert!(!source.is_running());
    }

    #[test]
    fn test_start_publishes_first_frame_synchronously() {
        let opens = Arc::new(AtomicU32::new(0));
        let mut source = FrameSource::new(Box::new(ScriptedOpener::working(opens)), settings());
        source.start().unwrap();
        assert!(source.latest_frame().is_some());
        assert!(source.is_running());
        source.stop();
    }

    #[test]
    fn test_open_failure_is_device_unavailable() {
        let opens = Arc::new(AtomicU32::new(0));
        let opener = ScriptedOpener {
            opens,
            fail_open: true,
            fail_first_grab: false,
        };
        let mut source = FrameSource::new(Box::new(opener), settings());
        assert!(matches!(
            source.start(),
            Err(CameraError::DeviceUnavailable(_))
        ));
        assert!(!source.is_running());
    }

    #[test]
    fn test_first_read_failure_is_device_busy() {
        let opens = Arc::new(AtomicU32::new(0));
        let opener = ScriptedOpener {
            opens,
            fail_open: false,
            fail_first_grab: true,
        };
        let mut source = FrameSource::new(Box::new(opener), settings());
        assert!(matches!(source.start(), Err(CameraError::DeviceBusy)));
        assert!(!source.is_running());
        assert!(source.latest_frame().is_none());
    }

    #[test]
    fn test_readers_see_complete_monotonic_frames() {
        let opens = Arc::new(AtomicU32::new(0));
        let mut source = FrameSource::new(Box::new(ScriptedOpener::working(opens)), settings());
        source.start().unwrap();

        let mut last_seq = 0;
        for _ in 0..50 {
            if let Some(frame) = source.latest_frame() {
                let first = frame.data[0];
                assert!(
                    frame.data.iter().all(|&b| b == first),
                    "torn frame: mixed fill bytes"
                );
                assert!(frame.sequence >= last_seq, "sequence went backwards");
                last_seq = frame.sequence;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(last_seq > 1, "capture loop never advanced");
        source.stop();
    }

    #[test]
    fn test_start_while_running_is_noop() {
        let opens = Arc::new(AtomicU32::new(0));
        let mut source =
            FrameSource::new(Box::new(ScriptedOpener::working(Arc::clone(&opens))), settings());
        source.start().unwrap();
        source.start().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        source.stop();
    }

    #[test]
    fn test_restart_reopens_device() {
        let opens = Arc::new(AtomicU32::new(0));
        let mut source =
            FrameSource::new(Box::new(ScriptedOpener::working(Arc::clone(&opens))), settings());

        source.start().unwrap();
        source.stop();
        assert!(!source.is_running());

        source.start().unwrap();
        assert!(source.is_running());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        source.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let opens = Arc::new(AtomicU32::new(0));
        let mut source = FrameSource::new(Box::new(ScriptedOpener::working(opens)), settings());
        source.start().unwrap();
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }
}
