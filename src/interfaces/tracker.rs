//! Tracker-facing interface.
//!
//! Corrections computed here teleport the camera; the tracker has to be
//! told so it can re-seat its motion model and IMU frame state.

use crate::atlas::KeyFrameId;
use crate::imu::ImuBias;

/// Hooks into the tracking thread.
pub trait TrackerBridge: Send + Sync {
    /// The most recent keyframe created by tracking, if any.
    fn last_keyframe(&self) -> Option<KeyFrameId>;

    /// Re-seat the tracker's IMU frame state after a map-wide scale /
    /// rotation change or a bias re-estimate.
    fn update_frame_imu(&self, scale: f64, bias: ImuBias, keyframe: Option<KeyFrameId>);

    /// Freeze the pre-teleport translation while a correction is staged.
    fn lock_pre_teleport_translation(&self, locked: bool);

    /// Tell the tracker the map jumped under it.
    fn set_teleported(&self);
}
