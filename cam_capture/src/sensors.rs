//! Sensors module.
//!
use std::io;

use bytes::Bytes;
use rscam::{Camera, Config, IntervalInfo, ResolutionInfo};

/// Linux error numbers without a dedicated `io::ErrorKind`.
const ENXIO: i32 = 6;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

/// Parameters requested from the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl CaptureConstraints {
    /// The fixed constraints every pipeline requests.
    pub const DEFAULT: CaptureConstraints = CaptureConstraints {
        width: 640,
        height: 360,
        frame_rate: 30,
    };
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CaptureErrorKind {
    #[error("permission to access the camera was denied")]
    PermissionDenied,
    #[error("no camera device found")]
    NoDevice,
    #[error("camera device is busy")]
    DeviceBusy,
    #[error("camera does not support the requested format")]
    UnsupportedFormat,
    #[error("camera I/O failed")]
    Io,
}

/// Camera acquisition failed. Surfaced to the user, never retried automatically.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {cause}")]
pub struct CaptureError {
    pub kind: CaptureErrorKind,
    pub cause: String,
}

impl CaptureError {
    pub fn new(kind: CaptureErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    /// Classify an I/O error raised while opening or reading the device.
    pub fn from_io(device_name: &str, err: &io::Error) -> Self {
        let kind = match (err.kind(), err.raw_os_error()) {
            (io::ErrorKind::PermissionDenied, _) => CaptureErrorKind::PermissionDenied,
            (io::ErrorKind::NotFound, _) => CaptureErrorKind::NoDevice,
            (_, Some(ENODEV | ENXIO)) => CaptureErrorKind::NoDevice,
            (_, Some(EBUSY)) => CaptureErrorKind::DeviceBusy,
            _ => CaptureErrorKind::Io,
        };
        Self::new(kind, format!("{device_name}: {err}"))
    }

    fn from_rscam(device_name: &str, err: rscam::Error) -> Self {
        match err {
            rscam::Error::Io(err) => Self::from_io(device_name, &err),
            other => Self::new(
                CaptureErrorKind::UnsupportedFormat,
                format!("{device_name}: {other}"),
            ),
        }
    }
}

/// Pulls the next encoded frame from the camera, blocking until one is available.
pub type CaptureFn = Box<dyn FnMut() -> Result<Bytes, CaptureError> + Send>;

/// Get a capture function to a video device on a Linux machine.
///
/// Returns the capture function together with the resolution the camera was started with, which
/// may differ from the requested one when the camera does not support it.
pub fn get_capture_fn_linux(
    device_name: &str,
    format: &str,
    constraints: &CaptureConstraints,
) -> Result<(CaptureFn, (u32, u32)), CaptureError> {
    let mut cam = Camera::new(device_name).map_err(|e| CaptureError::from_io(device_name, &e))?;
    log_supported_formats(&cam, format);
    let format = format.as_bytes();

    log::info!("Using camera {}", device_name);

    let target = (constraints.width, constraints.height);
    let resolution = cam
        .resolutions(format)
        .map_err(|e| CaptureError::from_rscam(device_name, e))
        .and_then(|info| {
            log::debug!("Found resolutions: {:?}", &info);
            select_resolution(&info, target).ok_or_else(|| {
                CaptureError::new(CaptureErrorKind::UnsupportedFormat, "no resolution found")
            })
        })?;

    let interval = cam
        .intervals(format, resolution)
        .map_err(|e| CaptureError::from_rscam(device_name, e))
        .and_then(|info| {
            log::debug!("Found frame rates: {:?}", &info);
            select_interval(&info, constraints.frame_rate).ok_or_else(|| {
                CaptureError::new(CaptureErrorKind::UnsupportedFormat, "no frame rate found")
            })
        })?;

    cam.start(&Config {
        interval,
        resolution,
        format,
        ..Default::default()
    })
    .map_err(|e| CaptureError::from_rscam(device_name, e))?;

    log::info!(
        "Camera {} started at {}x{} with interval {}/{}s",
        device_name,
        resolution.0,
        resolution.1,
        interval.0,
        interval.1
    );

    let device_name = device_name.to_owned();
    let callback = move || {
        cam.capture()
            .map(|frame| Bytes::copy_from_slice(&frame[..]))
            .map_err(|e| CaptureError::from_io(&device_name, &e))
    };
    Ok((Box::new(callback), resolution))
}

/// Pick the supported resolution closest to `target` in terms of number of pixels.
pub fn select_resolution(info: &ResolutionInfo, target: (u32, u32)) -> Option<(u32, u32)> {
    match info {
        ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            .min_by_key(|res| pixel_distance(**res, target))
            .copied(),
        ResolutionInfo::Stepwise { min, max, step: _ } => Some((
            target.0.clamp(min.0, max.0),
            target.1.clamp(min.1, max.1),
        )),
    }
}

/// Pick the frame interval whose frame rate is closest to `frame_rate`.
///
/// Intervals are `(numerator, denominator)` in seconds per frame, so `(1, 30)` is 30 fps.
pub fn select_interval(info: &IntervalInfo, frame_rate: u32) -> Option<(u32, u32)> {
    match info {
        IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .filter(|(numerator, _)| *numerator > 0)
            .min_by(|a, b| {
                let fps_a = a.1 as f32 / a.0 as f32;
                let fps_b = b.1 as f32 / b.0 as f32;
                (fps_a - frame_rate as f32)
                    .abs()
                    .total_cmp(&(fps_b - frame_rate as f32).abs())
            })
            .copied(),
        IntervalInfo::Stepwise { .. } => Some((1, frame_rate)),
    }
}

fn pixel_distance(resolution: (u32, u32), target: (u32, u32)) -> u64 {
    let pixels = resolution.0 as i64 * resolution.1 as i64;
    let target_pixels = target.0 as i64 * target.1 as i64;
    let aspect_penalty = (resolution.0 as i64 * target.1 as i64
        - resolution.1 as i64 * target.0 as i64)
        .unsigned_abs();
    (pixels - target_pixels).unsigned_abs() + aspect_penalty
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn exact_resolution_is_preferred() {
        let info = ResolutionInfo::Discretes(vec![(1280, 720), (640, 360), (640, 480)]);
        assert_eq!(select_resolution(&info, (640, 360)), Some((640, 360)));
    }

    #[test]
    fn closest_resolution_when_missing() {
        let info = ResolutionInfo::Discretes(vec![(1920, 1080), (800, 450), (320, 240)]);
        assert_eq!(select_resolution(&info, (640, 360)), Some((800, 450)));

        let info = ResolutionInfo::Discretes(vec![]);
        assert_eq!(select_resolution(&info, (640, 360)), None);
    }

    #[test]
    fn stepwise_resolution_is_clamped() {
        let info = ResolutionInfo::Stepwise {
            min: (160, 120),
            max: (320, 240),
            step: (16, 8),
        };
        assert_eq!(select_resolution(&info, (640, 360)), Some((320, 240)));
    }

    #[test]
    fn interval_closest_to_frame_rate() {
        let info = IntervalInfo::Discretes(vec![(1, 5), (1, 15), (1, 25), (1, 60)]);
        assert_eq!(select_interval(&info, 30), Some((1, 25)));

        let info = IntervalInfo::Discretes(vec![(1, 30), (1, 10)]);
        assert_eq!(select_interval(&info, 30), Some((1, 30)));
    }

    #[test]
    fn io_errors_are_classified() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            CaptureError::from_io("/dev/video0", &denied).kind,
            CaptureErrorKind::PermissionDenied
        );

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(
            CaptureError::from_io("/dev/video0", &missing).kind,
            CaptureErrorKind::NoDevice
        );

        let busy = io::Error::from_raw_os_error(EBUSY);
        let err = CaptureError::from_io("/dev/video0", &busy);
        assert_eq!(err.kind, CaptureErrorKind::DeviceBusy);
        assert!(err.to_string().starts_with("camera device is busy: /dev/video0"));
    }

    #[test]
    fn get_cam_info_if_available() -> Result<(), crate::Error> {
        let cam_name = "/dev/video0";
        let cam = Camera::new(cam_name);

        match cam {
            Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
            Ok(cam) => {
                let formats: Vec<_> = cam.formats().collect();
                println!("Supported formats: {formats:?}");

                let resolutions = cam.resolutions(b"MJPG")?;
                println!("Supported resolutions: {resolutions:?}");

                if let Some(resolution) = select_resolution(&resolutions, (640, 360)) {
                    let frame_rates = cam.intervals(b"MJPG", resolution)?;
                    println!("Supported frame rates: {frame_rates:?}");
                }
            }
        }

        Ok(())
    }
}
