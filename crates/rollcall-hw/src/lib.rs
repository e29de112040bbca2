//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and a continuously-updated
//! latest-frame mailbox for consumers that only ever want the most
//! recent frame.

pub mod camera;
pub mod frame;

pub use camera::{
    CameraError, CameraSettings, CaptureDevice, DeviceOpener, FrameSource, PixelFormat, V4lOpener,
};
pub use frame::Frame;
