//! GStreamer-based UVC capture

use super::{encode_jpeg_payload, Exposure, FrameSource, SourceError, StartParams, MJPEG_FORMAT};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// V4L2 `auto_exposure` menu values
const V4L2_EXPOSURE_MANUAL: i32 = 1;
const V4L2_EXPOSURE_APERTURE_PRIORITY: i32 = 3;

/// Latest payloads written by the appsink callbacks
#[derive(Default)]
struct CaptureState {
    frame_number: AtomicU64,
    jpeg: Mutex<Option<Bytes>>,
    raw: Mutex<Option<Bytes>>,
}

struct Capture {
    pipeline: gst::Pipeline,
    src: gst::Element,
    state: Arc<CaptureState>,
}

/// Captures MJPEG from V4L2 devices through GStreamer.
///
/// Each started device runs its own pipeline: the camera's JPEG stream is
/// teed into an appsink for the server and a decoder feeding an RGB appsink
/// for the preview.
pub struct GstSource {
    captures: Mutex<HashMap<String, Capture>>,
    exposures: Mutex<HashMap<String, Exposure>>,
}

impl GstSource {
    pub fn new() -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::Backend(e.to_string()))?;
        Ok(Self {
            captures: Mutex::new(HashMap::new()),
            exposures: Mutex::new(HashMap::new()),
        })
    }

    /// Lists the paths of attached video capture devices.
    pub fn devices(&self) -> Vec<String> {
        monitor_devices()
            .iter()
            .filter_map(device_path)
            .collect()
    }

    fn launch(&self, device: &str, params: &StartParams) -> Result<Capture, SourceError> {
        let description = pipeline_description(device, params);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| SourceError::Backend(e.to_string()))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| SourceError::Backend("not a pipeline".to_string()))?;

        let src = pipeline
            .by_name("src")
            .ok_or_else(|| SourceError::Backend("no v4l2src found".to_string()))?;
        let jpeg_sink = app_sink(&pipeline, "jpeg_sink")?;
        let raw_sink = app_sink(&pipeline, "raw_sink")?;

        let state = Arc::new(CaptureState::default());

        let jpeg_state = Arc::clone(&state);
        jpeg_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    // Payload first, then the counter, so a reader seeing the
                    // new number finds the new payload.
                    *jpeg_state.jpeg.lock() = Some(encode_jpeg_payload(map.as_slice()));
                    jpeg_state.frame_number.fetch_add(1, Ordering::Release);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let raw_state = Arc::clone(&state);
        raw_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    *raw_state.raw.lock() = Some(Bytes::copy_from_slice(map.as_slice()));
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        if let Some(exposure) = self.exposures.lock().get(device) {
            apply_exposure(&src, *exposure);
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::Backend(format!("{:?}", e)))?;

        Ok(Capture {
            pipeline,
            src,
            state,
        })
    }
}

impl FrameSource for GstSource {
    fn has_permission(&self, device: &str) -> bool {
        !matches!(
            std::fs::File::open(device),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied
        )
    }

    fn request_permission(&self, device: &str) {
        warn!(device, "No read access to device; add the user to the video group");
    }

    fn open(&self, device: &str) -> Result<Vec<String>, SourceError> {
        let devices = monitor_devices();
        let Some(found) = devices
            .iter()
            .find(|d| device_path(d).as_deref() == Some(device))
        else {
            return Err(SourceError::DeviceNotFound(device.to_string()));
        };

        let modes = found.caps().map(|caps| jpeg_modes(&caps)).unwrap_or_default();
        info!(device, name = %found.display_name(), modes = modes.len(), "Device opened");
        Ok(modes)
    }

    fn start(&self, device: &str, params: &StartParams) -> i32 {
        if let Some(old) = self.captures.lock().remove(device) {
            let _ = old.pipeline.set_state(gst::State::Null);
        }

        info!(
            device,
            resolution = %format!("{}x{}", params.width, params.height),
            fps = params.fps,
            buffers = params.buffer_count,
            bandwidth = params.bandwidth,
            "Starting capture"
        );

        match self.launch(device, params) {
            Ok(capture) => {
                self.captures.lock().insert(device.to_string(), capture);
                0
            }
            Err(e) => {
                error!(device, error = %e, "Failed to start capture");
                -1
            }
        }
    }

    fn frame_number(&self, device: &str) -> u64 {
        self.captures
            .lock()
            .get(device)
            .map(|c| c.state.frame_number.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn jpeg_payload(&self, device: &str) -> Option<Bytes> {
        let state = Arc::clone(&self.captures.lock().get(device)?.state);
        let payload = state.jpeg.lock().clone();
        payload
    }

    fn raw_payload(&self, device: &str) -> Option<Bytes> {
        let state = Arc::clone(&self.captures.lock().get(device)?.state);
        let payload = state.raw.lock().clone();
        payload
    }

    fn set_exposure(&self, device: &str, exposure: Exposure) -> Result<(), SourceError> {
        self.exposures.lock().insert(device.to_string(), exposure);
        if let Some(capture) = self.captures.lock().get(device) {
            apply_exposure(&capture.src, exposure);
        }
        Ok(())
    }

    fn close(&self, device: &str) {
        self.exposures.lock().remove(device);
        if let Some(capture) = self.captures.lock().remove(device) {
            if let Err(e) = capture.pipeline.set_state(gst::State::Null) {
                warn!(device, error = ?e, "Failed to stop pipeline");
            }
            info!(
                device,
                frames = capture.state.frame_number.load(Ordering::Relaxed),
                "Capture stopped"
            );
        }
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        for (_, capture) in self.captures.lock().drain() {
            let _ = capture.pipeline.set_state(gst::State::Null);
        }
    }
}

fn pipeline_description(device: &str, params: &StartParams) -> String {
    format!(
        "v4l2src name=src device={device} \
         ! image/jpeg,width={w},height={h},framerate={fps}/1 \
         ! tee name=t \
         t. ! queue max-size-buffers={buffers} leaky=downstream ! appsink name=jpeg_sink max-buffers=1 drop=true sync=false \
         t. ! queue max-size-buffers={buffers} leaky=downstream ! jpegdec ! videoconvert ! video/x-raw,format=RGB \
         ! appsink name=raw_sink max-buffers=1 drop=true sync=false",
        w = params.width,
        h = params.height,
        fps = params.fps,
        buffers = params.buffer_count.max(1),
    )
}

fn app_sink(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSink, SourceError> {
    pipeline
        .by_name(name)
        .ok_or_else(|| SourceError::Backend(format!("no appsink {name}")))?
        .dynamic_cast::<gst_app::AppSink>()
        .map_err(|_| SourceError::Backend(format!("{name} is not an appsink")))
}

fn apply_exposure(src: &gst::Element, exposure: Exposure) {
    let controls = match exposure {
        Exposure::Auto => gst::Structure::builder("c")
            .field("auto_exposure", V4L2_EXPOSURE_APERTURE_PRIORITY)
            .build(),
        Exposure::Manual(value) => gst::Structure::builder("c")
            .field("auto_exposure", V4L2_EXPOSURE_MANUAL)
            .field("exposure_time_absolute", value as i32)
            .build(),
    };
    debug!(controls = %controls, "Applying exposure");
    src.set_property("extra-controls", &controls);
}

fn monitor_devices() -> Vec<gst::Device> {
    let monitor = gst::DeviceMonitor::new();
    monitor.add_filter(Some("Video/Source"), None);
    if let Err(e) = monitor.start() {
        warn!(error = %e, "Device monitor failed to start");
        return Vec::new();
    }
    let devices = monitor.devices().into_iter().collect();
    monitor.stop();
    devices
}

fn device_path(device: &gst::Device) -> Option<String> {
    let props = device.properties()?;
    ["api.v4l2.path", "device.path"]
        .iter()
        .find_map(|key| props.get::<String>(*key).ok())
}

/// Mode descriptors for every fixed `image/jpeg` size and rate in `caps`.
fn jpeg_modes(caps: &gst::Caps) -> Vec<String> {
    let mut modes = Vec::new();
    for s in caps.iter().filter(|s| s.name() == "image/jpeg") {
        let (Ok(width), Ok(height)) = (s.get::<i32>("width"), s.get::<i32>("height")) else {
            continue;
        };

        let rates: Vec<gst::Fraction> = if let Ok(rate) = s.get::<gst::Fraction>("framerate") {
            vec![rate]
        } else if let Ok(list) = s.get::<gst::List>("framerate") {
            list.iter().filter_map(|v| v.get::<gst::Fraction>().ok()).collect()
        } else {
            Vec::new()
        };

        for rate in rates {
            if rate.denom() == 0 {
                continue;
            }
            let fps = rate.numer() / rate.denom();
            let mode = format!("{MJPEG_FORMAT},{width},{height},{fps}");
            if !modes.contains(&mode) {
                modes.push(mode);
            }
        }
    }
    modes
}
