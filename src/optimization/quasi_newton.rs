//! Local refinement of one scored pose with the quasi-Newton driver

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conf::{Change, Conf, ScoredPose};
use crate::device::{Device, DeviceChange, DeviceConf, DeviceOutput};
use crate::model::{EnergyModel, EvaluationContext, EvaluationError};
use crate::optimization::{bfgs, Minimum, Objective, OptimizationError, QuasiNewtonParams};

/// Binds a model to the context it is scored in, for host-resident states
pub struct QuasiNewtonAux<'a, M: EnergyModel + ?Sized> {
    model: &'a M,
    ctx: EvaluationContext<'a>,
}

impl<'a, M: EnergyModel + ?Sized> QuasiNewtonAux<'a, M> {
    pub fn new(model: &'a M, ctx: EvaluationContext<'a>) -> Self {
        Self { model, ctx }
    }

    /// The same objective evaluated on `device`
    pub fn on_device(&self, device: &'a Device) -> DeviceAux<'a, M> {
        DeviceAux {
            model: self.model,
            ctx: self.ctx,
            device,
        }
    }
}

impl<M: EnergyModel + ?Sized> Objective<Conf> for QuasiNewtonAux<'_, M> {
    fn evaluate(&self, state: &Conf, gradient: &mut Change) -> Result<f64, EvaluationError> {
        self.model.eval_deriv(&self.ctx, state, gradient)
    }
}

/// Accelerator counterpart of [`QuasiNewtonAux`]
pub struct DeviceAux<'a, M: EnergyModel + ?Sized> {
    model: &'a M,
    ctx: EvaluationContext<'a>,
    device: &'a Device,
}

impl<M: EnergyModel + ?Sized> Objective<DeviceConf> for DeviceAux<'_, M> {
    fn evaluate(
        &self,
        state: &DeviceConf,
        gradient: &mut DeviceChange,
    ) -> Result<f64, EvaluationError> {
        self.model.eval_deriv_device(self.device, &self.ctx, state, gradient)
    }
}

/// Where a minimization runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Host,
    Accelerator,
}

impl From<bool> for Backend {
    fn from(use_accelerator: bool) -> Self {
        if use_accelerator {
            Backend::Accelerator
        } else {
            Backend::Host
        }
    }
}

/// Local optimizer for docking poses
#[derive(Debug, Clone, Default)]
pub struct QuasiNewton {
    pub params: QuasiNewtonParams,
    device: Option<Arc<Device>>,
}

impl QuasiNewton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: QuasiNewtonParams) -> Self {
        Self {
            params,
            device: None,
        }
    }

    /// Attach the accelerator used by [`Backend::Accelerator`] calls
    pub fn with_device(mut self, device: Arc<Device>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_deref()
    }

    /// Refine `pose` in place and record its energy.
    ///
    /// `gradient` must be sized for the pose; it holds the gradient at the
    /// refined pose afterwards. On error the pose is left as it was.
    pub fn minimize<M: EnergyModel + ?Sized>(
        &self,
        model: &M,
        ctx: &EvaluationContext<'_>,
        pose: &mut ScoredPose,
        gradient: &mut Change,
        backend: Backend,
    ) -> Result<Minimum, OptimizationError> {
        self.params.validate()?;

        let expected = model.num_torsions();
        if pose.conf.num_torsions() != expected {
            return Err(OptimizationError::ConformationMismatch {
                expected,
                actual: pose.conf.num_torsions(),
            });
        }

        let aux = QuasiNewtonAux::new(model, *ctx);
        match backend {
            Backend::Host => {
                let min = bfgs(&aux, &mut pose.conf, gradient, &self.params)?;
                pose.energy = Some(min.energy);
                Ok(min)
            }
            Backend::Accelerator => {
                let device = self.device().ok_or_else(|| {
                    OptimizationError::BackendUnavailable("no device attached".to_string())
                })?;

                let mut out = DeviceOutput::from_host(pose);
                let mut g = DeviceChange::from_host(gradient);
                let min = bfgs(&aux.on_device(device), &mut out.c, &mut g, &self.params)?;
                out.e = Some(min.energy);

                *pose = out.to_host();
                *gradient = g.to_host();
                Ok(min)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomType;
    use crate::field::{FieldError, FieldPotential};
    use crate::forcefield::vina::VinaForceField;
    use crate::optimization::{GeneralizedVector, Termination};
    use crate::precalculate::InteractionTable;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    /// Harmonic wells on the root position and every torsion
    struct Spring {
        target: Vector3<f64>,
        angles: Vec<f64>,
    }

    impl EnergyModel for Spring {
        fn num_torsions(&self) -> usize {
            self.angles.len()
        }

        fn eval_deriv(
            &self,
            _ctx: &EvaluationContext<'_>,
            conf: &Conf,
            gradient: &mut Change,
        ) -> Result<f64, EvaluationError> {
            let d = conf.position - self.target;
            gradient.position = d * 2.0;
            gradient.orientation = Vector3::zeros();
            let mut e = d.norm_squared();
            for (i, (t, a)) in conf.torsions.iter().zip(&self.angles).enumerate() {
                gradient.torsions[i] = 3.0 * (t - a);
                e += 1.5 * (t - a) * (t - a);
            }
            Ok(e)
        }
    }

    /// Slopes downhill along x and cannot be scored past x = 0
    struct Ledge;

    impl EnergyModel for Ledge {
        fn num_torsions(&self) -> usize {
            0
        }

        fn eval_deriv(
            &self,
            _ctx: &EvaluationContext<'_>,
            conf: &Conf,
            gradient: &mut Change,
        ) -> Result<f64, EvaluationError> {
            if conf.position.x < 0.0 {
                return Err(EvaluationError::NonFiniteCoordinate(0));
            }
            gradient.position = Vector3::new(1.0, 0.0, 0.0);
            gradient.orientation = Vector3::zeros();
            Ok(conf.position.x)
        }
    }

    struct Flat;

    impl FieldPotential for Flat {
        fn eval_deriv(
            &self,
            _atom_type: AtomType,
            _position: &Vector3<f64>,
        ) -> Result<(f64, Vector3<f64>), FieldError> {
            Ok((0.0, Vector3::zeros()))
        }
    }

    fn table() -> InteractionTable {
        InteractionTable::new(&VinaForceField::new(), 4.0).unwrap()
    }

    fn spring() -> Spring {
        Spring {
            target: Vector3::new(1.0, -2.0, 0.5),
            angles: vec![0.4, -1.1],
        }
    }

    fn start() -> ScoredPose {
        ScoredPose::new(Conf::new(
            Vector3::new(3.0, 0.0, -1.0),
            UnitQuaternion::from_euler_angles(0.3, 0.1, -0.2),
            vec![1.5, -0.2],
        ))
    }

    #[test]
    fn test_host_minimize_sets_energy() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let model = spring();
        let qn = QuasiNewton::with_params(QuasiNewtonParams {
            required_improvement: 1e-12,
            gradient_tolerance: 1e-9,
            ..QuasiNewtonParams::default()
        });
        let mut pose = start();
        let mut g = Change::for_conf(&pose.conf);

        let min = qn
            .minimize(&model, &ctx, &mut pose, &mut g, Backend::Host)
            .unwrap();

        assert_eq!(pose.energy, Some(min.energy));
        assert!(min.energy < 1e-6);
        assert!((pose.conf.position - model.target).norm() < 1e-3);
        assert_approx_eq!(pose.conf.torsions[1], -1.1, 1e-3);
    }

    #[test]
    fn test_backends_agree() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let model = spring();
        let qn = QuasiNewton::new().with_device(Arc::new(Device::new(2).unwrap()));

        let mut host = start();
        let mut g_host = Change::for_conf(&host.conf);
        let host_min = qn
            .minimize(&model, &ctx, &mut host, &mut g_host, Backend::Host)
            .unwrap();

        let mut dev = start();
        let mut g_dev = Change::for_conf(&dev.conf);
        let dev_min = qn
            .minimize(&model, &ctx, &mut dev, &mut g_dev, Backend::Accelerator)
            .unwrap();

        assert_eq!(host_min, dev_min);
        assert_eq!(host, dev);
        assert_eq!(g_host, g_dev);
    }

    #[test]
    fn test_evaluation_failure_leaves_pose_unchanged() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let qn = QuasiNewton::new().with_device(Arc::new(Device::new(2).unwrap()));

        for backend in [Backend::Host, Backend::Accelerator] {
            let mut pose = ScoredPose::new(Conf::at(Vector3::new(0.75, 0.0, 0.0), 0));
            let before = pose.clone();
            let mut g = Change::for_conf(&pose.conf);

            let err = qn
                .minimize(&Ledge, &ctx, &mut pose, &mut g, backend)
                .unwrap_err();

            assert!(
                matches!(err, OptimizationError::Evaluation(_)),
                "{:?}: {}",
                backend,
                err
            );
            assert_eq!(pose, before);
            assert_eq!(pose.energy, None);
        }
    }

    #[test]
    fn test_accelerator_without_device_fails() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let mut pose = start();
        let before = pose.clone();
        let mut g = Change::for_conf(&pose.conf);

        let err = QuasiNewton::new()
            .minimize(&spring(), &ctx, &mut pose, &mut g, Backend::from(true))
            .unwrap_err();

        assert!(matches!(err, OptimizationError::BackendUnavailable(_)));
        assert_eq!(pose, before);
    }

    #[test]
    fn test_mismatched_buffers_are_rejected() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let qn = QuasiNewton::new();

        let mut pose = start();
        let mut short = Change::zeros(1);
        let err = qn
            .minimize(&spring(), &ctx, &mut pose, &mut short, Backend::Host)
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizationError::GradientSizeMismatch {
                expected: 8,
                actual: 7
            }
        ));
        assert_eq!(pose.energy, None);

        let mut pose = ScoredPose::new(Conf::at(Vector3::zeros(), 3));
        let mut g = Change::for_conf(&pose.conf);
        let err = qn
            .minimize(&spring(), &ctx, &mut pose, &mut g, Backend::Host)
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizationError::ConformationMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_already_minimal_pose_is_stable() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let model = spring();
        let mut pose = ScoredPose::new(Conf::new(
            model.target,
            UnitQuaternion::identity(),
            model.angles.clone(),
        ));
        let before = pose.conf.clone();
        let mut g = Change::for_conf(&pose.conf);

        let min = QuasiNewton::new()
            .minimize(&model, &ctx, &mut pose, &mut g, Backend::Host)
            .unwrap();

        assert_eq!(min.termination, Termination::GradientVanished);
        assert_eq!(min.energy, 0.0);
        assert_eq!(pose.conf, before);
        assert_eq!(g.dot(&g), 0.0);
    }

    #[test]
    fn test_invalid_params_fail_before_evaluation() {
        let table = table();
        let ctx = EvaluationContext::new(&table, &Flat);
        let qn = QuasiNewton::with_params(QuasiNewtonParams {
            wolfe_c2: 1.5,
            ..QuasiNewtonParams::default()
        });
        let mut pose = start();
        let mut g = Change::for_conf(&pose.conf);

        assert!(matches!(
            qn.minimize(&spring(), &ctx, &mut pose, &mut g, Backend::Host),
            Err(OptimizationError::InvalidParameters(_))
        ));
    }
}
