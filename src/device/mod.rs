//! Accelerator backend: a dedicated data-parallel execution resource and the
//! flat state encodings that live on it.
//!
//! Device buffers are plain contiguous `f64` arrays:
//!
//! - [`DeviceConf`]: `[px, py, pz, qw, qi, qj, qk, t0, t1, ...]`
//! - [`DeviceChange`]: `[dpx, dpy, dpz, dox, doy, doz, dt0, ...]`
//!
//! Conversions to and from the host types copy values without any arithmetic,
//! so a round trip is exact.

use nalgebra::{UnitQuaternion, Vector3};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::conf::{Change, Conf, ScoredPose};
use crate::math::{
    normalize_angle, quaternion_from_array, quaternion_increment, quaternion_to_array,
};
use crate::optimization::{GeneralizedState, GeneralizedVector};

const CONF_HEADER: usize = 7;
const CHANGE_HEADER: usize = 6;

/// Errors raised while acquiring the accelerator
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Accelerator unavailable: {0}")]
    Unavailable(String),
}

/// Handle on the accelerator's worker pool
#[derive(Debug)]
pub struct Device {
    pool: ThreadPool,
    threads: usize,
}

impl Device {
    /// Acquire a device with `threads` workers
    pub fn new(threads: usize) -> Result<Self, DeviceError> {
        if threads == 0 {
            return Err(DeviceError::Unavailable(
                "a device needs at least one worker".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("refine-device-{}", i))
            .build()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        log::debug!("acquired device with {} workers", threads);
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `op` on the device; rayon parallel iterators inside it use the
    /// device workers.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

/// Device-resident conformation
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConf {
    data: Vec<f64>,
}

impl DeviceConf {
    pub fn from_host(conf: &Conf) -> Self {
        let mut data = Vec::with_capacity(CONF_HEADER + conf.torsions.len());
        data.extend_from_slice(conf.position.as_slice());
        data.extend_from_slice(&quaternion_to_array(&conf.orientation));
        data.extend_from_slice(&conf.torsions);
        Self { data }
    }

    pub fn to_host(&self) -> Conf {
        Conf::new(self.position(), self.orientation(), self.torsions().to_vec())
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.data[0], self.data[1], self.data[2])
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        quaternion_from_array([self.data[3], self.data[4], self.data[5], self.data[6]])
    }

    pub fn torsions(&self) -> &[f64] {
        &self.data[CONF_HEADER..]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

impl GeneralizedState for DeviceConf {
    type Change = DeviceChange;

    fn degrees_of_freedom(&self) -> usize {
        self.data.len() - 1
    }

    // Same floating-point operations, in the same order, as `Conf::increment`
    fn increment(&mut self, change: &DeviceChange, factor: f64) {
        let c = &change.data;
        for i in 0..3 {
            self.data[i] += c[i] * factor;
        }

        let rotation = Vector3::new(c[3] * factor, c[4] * factor, c[5] * factor);
        let q = quaternion_increment(&self.orientation(), &rotation);
        self.data[3..CONF_HEADER].copy_from_slice(&quaternion_to_array(&q));

        for (t, d) in self.data[CONF_HEADER..].iter_mut().zip(&c[CHANGE_HEADER..]) {
            *t = normalize_angle(*t + factor * d);
        }
    }
}

/// Device-resident gradient
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    data: Vec<f64>,
}

impl DeviceChange {
    pub fn zeros(num_torsions: usize) -> Self {
        Self {
            data: vec![0.0; CHANGE_HEADER + num_torsions],
        }
    }

    pub fn from_host(change: &Change) -> Self {
        let mut data = Vec::with_capacity(CHANGE_HEADER + change.torsions.len());
        data.extend_from_slice(change.position.as_slice());
        data.extend_from_slice(change.orientation.as_slice());
        data.extend_from_slice(&change.torsions);
        Self { data }
    }

    pub fn to_host(&self) -> Change {
        Change {
            position: Vector3::new(self.data[0], self.data[1], self.data[2]),
            orientation: Vector3::new(self.data[3], self.data[4], self.data[5]),
            torsions: self.data[CHANGE_HEADER..].to_vec(),
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

impl GeneralizedVector for DeviceChange {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn get(&self, i: usize) -> f64 {
        self.data[i]
    }

    fn set(&mut self, i: usize, value: f64) {
        self.data[i] = value;
    }
}

/// Device-resident scored pose
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOutput {
    pub c: DeviceConf,
    pub e: Option<f64>,
}

impl DeviceOutput {
    pub fn from_host(pose: &ScoredPose) -> Self {
        Self {
            c: DeviceConf::from_host(&pose.conf),
            e: pose.energy,
        }
    }

    pub fn to_host(&self) -> ScoredPose {
        ScoredPose {
            conf: self.c.to_host(),
            energy: self.e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conf() -> Conf {
        Conf::new(
            Vector3::new(0.1, -2.3, 4.7),
            UnitQuaternion::from_euler_angles(0.4, 1.2, -0.7),
            vec![0.3, -1.9, 2.8],
        )
    }

    #[test]
    fn test_zero_workers_is_unavailable() {
        assert!(matches!(Device::new(0), Err(DeviceError::Unavailable(_))));
    }

    #[test]
    fn test_install_runs_on_device_workers() {
        let device = Device::new(2).unwrap();
        let n = device.install(rayon::current_num_threads);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_conversions_are_exact() {
        let conf = sample_conf();
        let dev = DeviceConf::from_host(&conf);
        assert_eq!(dev.degrees_of_freedom(), 9);
        assert_eq!(dev.to_host(), conf);

        let mut change = Change::zeros(3);
        for i in 0..change.len() {
            change.set(i, i as f64 * 0.37 - 1.0);
        }
        let dchange = DeviceChange::from_host(&change);
        for i in 0..change.len() {
            assert_eq!(dchange.get(i), change.get(i));
        }
        assert_eq!(dchange.to_host(), change);
    }

    #[test]
    fn test_increment_matches_host_bit_for_bit() {
        let mut host = sample_conf();
        let mut dev = DeviceConf::from_host(&host);

        let mut step = Change::zeros(3);
        for i in 0..step.len() {
            step.set(i, (i as f64 + 1.0).sin());
        }
        let dstep = DeviceChange::from_host(&step);

        for factor in [1.0, 0.5, 0.123] {
            host.increment(&step, factor);
            dev.increment(&dstep, factor);
        }
        assert_eq!(dev.to_host(), host);
    }

    #[test]
    fn test_output_carries_energy() {
        let mut pose = ScoredPose::new(sample_conf());
        pose.energy = Some(-3.5);
        let dev = DeviceOutput::from_host(&pose);
        assert_eq!(dev.to_host(), pose);
    }
}
