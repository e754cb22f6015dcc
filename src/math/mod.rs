//! Small geometric helpers shared by both state encodings

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A wrapper type for Vector3 that serializes as `{ "x": .., "y": .., "z": .. }`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn to_vector3(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

impl From<Vector3<f64>> for Vec3 {
    fn from(v: Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<Vec3> for Vector3<f64> {
    fn from(v: Vec3) -> Self {
        v.to_vector3()
    }
}

/// Wrap an angle into [-pi, pi]
pub fn normalize_angle(x: f64) -> f64 {
    if x > PI {
        let n = ((x - PI) / (2.0 * PI)).floor() + 1.0;
        x - 2.0 * PI * n
    } else if x < -PI {
        let n = ((-x - PI) / (2.0 * PI)).floor() + 1.0;
        x + 2.0 * PI * n
    } else {
        x
    }
}

/// Rotate `q` by the rotation vector `rotation` (axis times angle, radians).
///
/// The rotation is applied in the fixed frame: `q' = exp(rotation) * q`.
pub fn quaternion_increment(
    q: &UnitQuaternion<f64>,
    rotation: &Vector3<f64>,
) -> UnitQuaternion<f64> {
    let mut out = UnitQuaternion::from_scaled_axis(*rotation) * q;
    out.renormalize();
    out
}

/// Raw `[w, i, j, k]` coordinates of a unit quaternion
pub fn quaternion_to_array(q: &UnitQuaternion<f64>) -> [f64; 4] {
    let q = q.quaternion();
    [q.w, q.i, q.j, q.k]
}

/// Rebuild a unit quaternion from `[w, i, j, k]` without renormalizing,
/// so that a round trip through [`quaternion_to_array`] is exact.
pub fn quaternion_from_array(a: [f64; 4]) -> UnitQuaternion<f64> {
    UnitQuaternion::new_unchecked(Quaternion::new(a[0], a[1], a[2], a[3]))
}
