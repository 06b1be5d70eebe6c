//! Minimal IMU state carried by keyframes.
//!
//! Preintegration itself happens upstream; this crate only needs to carry
//! biases and velocities through pose corrections.

use nalgebra::Vector3;

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}
