//! Sensor SDK boundary
//!
//! The bridge never talks to a device SDK directly. A binding implements
//! [`DepthSensor`] and a [`SensorFactory`] that hands out fresh handles, and
//! the [`DeviceController`](crate::controller::DeviceController) owns the one
//! live handle.

use std::sync::Arc;

use crate::error::SensorError;
use crate::types::{CameraOptions, DepthMode, DepthRange, SensorFrame, TrackerOptions};

/// Push callback registered with the sensor.
///
/// Invoked from the SDK's delivery context; implementations must not block.
pub type FrameCallback = Arc<dyn Fn(Arc<SensorFrame>) + Send + Sync>;

/// Result of a sensor call.
pub type SensorResult<T = ()> = std::result::Result<T, SensorError>;

/// Trait for depth camera SDK bindings.
///
/// Method names mirror the SDK calls the bridge depends on. All methods except
/// [`stop_listening`](DepthSensor::stop_listening) are expected to return
/// promptly.
#[async_trait::async_trait]
pub trait DepthSensor: Send + Sync + 'static {
    /// Open the device. `Ok(false)` means the SDK refused without an error.
    fn open(&mut self) -> SensorResult<bool>;

    /// Start the cameras in the mode described by `options`.
    fn start_cameras(&mut self, options: &CameraOptions) -> SensorResult;

    /// Create a body tracker; `None` uses the SDK defaults.
    fn create_tracker(&mut self, options: Option<&TrackerOptions>) -> SensorResult;

    /// Destroy the body tracker.
    fn destroy_tracker(&mut self) -> SensorResult;

    /// Stop the cameras.
    fn stop_cameras(&mut self) -> SensorResult;

    /// Register the push callback and begin delivering frames.
    fn start_listening(&mut self, callback: FrameCallback) -> SensorResult;

    /// Stop delivering frames. Resolves once the SDK has released its
    /// delivery thread.
    async fn stop_listening(&mut self) -> SensorResult;

    /// Close the device.
    fn close(&mut self) -> SensorResult;

    /// Valid distance range for a depth mode.
    fn depth_mode_range(&self, mode: DepthMode) -> SensorResult<DepthRange>;
}

/// Creates sensor handles for the controller.
pub trait SensorFactory: Send + Sync + 'static {
    fn create(&self) -> SensorResult<Box<dyn DepthSensor>>;
}

impl<F> SensorFactory for F
where
    F: Fn() -> SensorResult<Box<dyn DepthSensor>> + Send + Sync + 'static,
{
    fn create(&self) -> SensorResult<Box<dyn DepthSensor>> {
        self()
    }
}
