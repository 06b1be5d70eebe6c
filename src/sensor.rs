//! Sensor configuration of the SLAM frontend.

use crate::atlas::Map;

/// Sensor suite driving the system.
///
/// Loop closing dispatches on this tag twice: to decide whether the Sim3
/// scale is observable, and to pick the merge strategy (visual vs
/// visual-inertial).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
    ImuMonocular,
    ImuStereo,
    ImuRgbd,
}

impl Sensor {
    /// True for the IMU-aided variants.
    pub fn is_inertial(&self) -> bool {
        matches!(self, Sensor::ImuMonocular | Sensor::ImuStereo | Sensor::ImuRgbd)
    }

    /// Whether the Sim3 scale is fixed for this sensor in general.
    ///
    /// Pure monocular never observes scale. Everything else does, except
    /// monocular-inertial before the second IMU initialization stage (see
    /// [`Sensor::fix_scale_for_map`]).
    pub fn fix_scale(&self) -> bool {
        !matches!(self, Sensor::Monocular)
    }

    /// Scale-fixing policy for a concrete map.
    ///
    /// Monocular-inertial only trusts its scale once the second inertial
    /// BA stage has run on the owning map.
    pub fn fix_scale_for_map(&self, map: &Map) -> bool {
        self.fix_scale() && !(*self == Sensor::ImuMonocular && !map.inertial_ba2_done())
    }
}
