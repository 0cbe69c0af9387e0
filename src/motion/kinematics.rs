// src/motion/kinematics.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::MotionError;
use super::axis::{Axis, AxisArray, AxisSet};
use super::leveling::Leveling;

/// Different types of machine kinematics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KinematicsType {
    #[default]
    Cartesian,
    CoreXY,
    CoreXZ,
    CoreYZ,
}

impl FromStr for KinematicsType {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cartesian" => Ok(KinematicsType::Cartesian),
            "corexy" => Ok(KinematicsType::CoreXY),
            "corexz" => Ok(KinematicsType::CoreXZ),
            "coreyz" => Ok(KinematicsType::CoreYZ),
            other => Err(MotionError::Kinematics(format!("unknown kinematics '{}'", other))),
        }
    }
}

/// Result of mapping a logical step delta to actuator motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepDelta {
    /// Signed actuator deltas.
    pub actuator: AxisArray<i64>,
    /// Absolute actuator step counts.
    pub steps: AxisArray<u32>,
    /// Actuators that turn in the negative direction.
    pub direction: AxisSet,
    /// Logical head axes that travel in the negative direction.
    pub head_direction: AxisSet,
}

/// Maps logical axis steps to actuator steps.
///
/// Both sides use integer steps at the logical axis resolution, so the
/// extruder always passes through untouched. Mappings that would overflow
/// report [`MotionError::TargetOutOfRange`] instead of wrapping.
pub trait Kinematics: fmt::Debug + Send + Sync {
    fn kind(&self) -> KinematicsType;

    /// Signed actuator deltas produced by a logical delta.
    fn actuator_delta(&self, logical: &AxisArray<i64>) -> Result<AxisArray<i64>, MotionError>;

    /// Actuator positions for a logical position.
    fn actuator_position(&self, logical: &AxisArray<i64>) -> Result<AxisArray<i64>, MotionError> {
        self.actuator_delta(logical)
    }

    /// Logical position for actuator positions. Coupled pairs round down
    /// when the actuators sit half a logical step apart.
    fn logical_position(&self, actuator: &AxisArray<i64>) -> AxisArray<i64>;

    /// Actuators that must be enabled together.
    fn coupled_actuators(&self) -> Option<[Axis; 2]> {
        None
    }

    /// Step counts and direction bits for one block. Every logical and
    /// actuator delta has to fit a `u32` step counter.
    fn steps_from_delta(&self, logical: &AxisArray<i64>) -> Result<StepDelta, MotionError> {
        let actuator = self.actuator_delta(logical)?;
        let mut result = StepDelta { actuator, ..StepDelta::default() };
        for axis in Axis::ALL {
            let out_of_range = |_| MotionError::TargetOutOfRange(axis);
            u32::try_from(logical[axis].unsigned_abs()).map_err(out_of_range)?;
            result.steps[axis] = u32::try_from(actuator[axis].unsigned_abs()).map_err(out_of_range)?;
            result.direction.set(axis, actuator[axis] < 0);
            result.head_direction.set(axis, logical[axis] < 0);
        }
        Ok(result)
    }

    /// Head travel in mm per logical axis. Used for the move length.
    fn head_travel_mm(&self, logical: &AxisArray<i64>, steps_to_mm: &AxisArray<f64>) -> AxisArray<f64> {
        logical.map(|axis, steps| steps as f64 * steps_to_mm[axis])
    }

    /// Actuator travel in mm. Used for per-actuator speed and jerk limits.
    fn actuator_travel_mm(&self, delta: &StepDelta, steps_to_mm: &AxisArray<f64>) -> AxisArray<f64> {
        delta.actuator.map(|axis, steps| steps as f64 * steps_to_mm[axis])
    }
}

/// Cartesian kinematics: one actuator per axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct CartesianKinematics;

impl Kinematics for CartesianKinematics {
    fn kind(&self) -> KinematicsType {
        KinematicsType::Cartesian
    }

    fn actuator_delta(&self, logical: &AxisArray<i64>) -> Result<AxisArray<i64>, MotionError> {
        Ok(*logical)
    }

    fn logical_position(&self, actuator: &AxisArray<i64>) -> AxisArray<i64> {
        *actuator
    }
}

/// Belt-coupled pair of axes:
/// A = first + second, B = first - second.
#[derive(Debug, Clone, Copy)]
pub struct CoreKinematics {
    kind: KinematicsType,
    first: Axis,
    second: Axis,
}

impl CoreKinematics {
    pub fn new(kind: KinematicsType) -> Option<Self> {
        let (first, second) = match kind {
            KinematicsType::CoreXY => (Axis::X, Axis::Y),
            KinematicsType::CoreXZ => (Axis::X, Axis::Z),
            KinematicsType::CoreYZ => (Axis::Y, Axis::Z),
            KinematicsType::Cartesian => return None,
        };
        Some(Self { kind, first, second })
    }
}

impl Kinematics for CoreKinematics {
    fn kind(&self) -> KinematicsType {
        self.kind
    }

    fn actuator_delta(&self, logical: &AxisArray<i64>) -> Result<AxisArray<i64>, MotionError> {
        let (first, second) = (logical[self.first], logical[self.second]);
        let mut actuator = *logical;
        actuator[self.first] = first
            .checked_add(second)
            .ok_or(MotionError::TargetOutOfRange(self.first))?;
        actuator[self.second] = first
            .checked_sub(second)
            .ok_or(MotionError::TargetOutOfRange(self.second))?;
        Ok(actuator)
    }

    fn logical_position(&self, actuator: &AxisArray<i64>) -> AxisArray<i64> {
        let mut logical = *actuator;
        let a = actuator[self.first] as i128;
        let b = actuator[self.second] as i128;
        // Half the sum or difference of two i64 values always fits an i64.
        logical[self.first] = (a + b).div_euclid(2) as i64;
        logical[self.second] = (a - b).div_euclid(2) as i64;
        logical
    }

    fn coupled_actuators(&self) -> Option<[Axis; 2]> {
        Some([self.first, self.second])
    }
}

/// Factory for creating kinematics handlers
pub fn create_kinematics(kinematics_type: KinematicsType) -> Box<dyn Kinematics> {
    match CoreKinematics::new(kinematics_type) {
        Some(core) => Box::new(core),
        None => Box::new(CartesianKinematics),
    }
}

/// Logical coordinates to planner coordinates: leveling first, then the
/// actuator mapping through [`Kinematics`].
#[derive(Debug)]
pub struct KinematicMapper {
    kinematics: Box<dyn Kinematics>,
    leveling: Option<Leveling>,
}

impl KinematicMapper {
    pub fn new(kinematics: Box<dyn Kinematics>, leveling: Option<Leveling>) -> Self {
        Self { kinematics, leveling }
    }

    pub fn kinematics(&self) -> &dyn Kinematics {
        self.kinematics.as_ref()
    }

    pub fn leveling(&self) -> Option<&Leveling> {
        self.leveling.as_ref()
    }

    pub fn set_leveling(&mut self, leveling: Option<Leveling>) {
        self.leveling = leveling;
    }

    pub fn set_leveling_enabled(&mut self, enabled: bool) {
        if let Some(leveling) = self.leveling.as_mut() {
            leveling.set_enabled(enabled);
        }
    }

    /// Applies leveling to the positioning axes of a logical target.
    pub fn to_planner(&self, logical: &AxisArray<f64>) -> AxisArray<f64> {
        match &self.leveling {
            Some(leveling) => {
                let [x, y, z] = leveling.apply([logical[Axis::X], logical[Axis::Y], logical[Axis::Z]]);
                AxisArray::new(x, y, z, logical[Axis::E])
            }
            None => *logical,
        }
    }

    pub fn from_planner(&self, planner: &AxisArray<f64>) -> AxisArray<f64> {
        match &self.leveling {
            Some(leveling) => {
                let [x, y, z] = leveling.unapply([planner[Axis::X], planner[Axis::Y], planner[Axis::Z]]);
                AxisArray::new(x, y, z, planner[Axis::E])
            }
            None => *planner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinematics_type() {
        assert_eq!("CoreXY".parse::<KinematicsType>().unwrap(), KinematicsType::CoreXY);
        assert_eq!("cartesian".parse::<KinematicsType>().unwrap(), KinematicsType::Cartesian);
        assert!("delta".parse::<KinematicsType>().is_err());
    }

    #[test]
    fn test_cartesian_steps_from_delta() {
        let kin = create_kinematics(KinematicsType::Cartesian);
        let delta = kin.steps_from_delta(&AxisArray::new(100, -50, 0, 7)).unwrap();
        assert_eq!(delta.steps, AxisArray::new(100, 50, 0, 7));
        assert!(delta.direction.contains(Axis::Y));
        assert!(!delta.direction.contains(Axis::X));
        assert_eq!(delta.direction, delta.head_direction);
        assert!(kin.coupled_actuators().is_none());
    }

    #[test]
    fn test_corexy_mapping() {
        let kin = create_kinematics(KinematicsType::CoreXY);
        // Pure Y travel turns A forward and B backward.
        let delta = kin.steps_from_delta(&AxisArray::new(0, 80, 0, 0)).unwrap();
        assert_eq!(delta.steps, AxisArray::new(80, 80, 0, 0));
        assert!(!delta.direction.contains(Axis::X));
        assert!(delta.direction.contains(Axis::Y));
        assert!(delta.head_direction.is_empty());
        assert_eq!(kin.coupled_actuators(), Some([Axis::X, Axis::Y]));
    }

    #[test]
    fn test_core_position_round_trip() {
        for kind in [KinematicsType::CoreXY, KinematicsType::CoreXZ, KinematicsType::CoreYZ] {
            let kin = create_kinematics(kind);
            let logical = AxisArray::new(120, -35, 17, 4);
            let actuator = kin.actuator_position(&logical).unwrap();
            assert_eq!(kin.logical_position(&actuator), logical, "{:?}", kind);
        }
    }

    #[test]
    fn test_corexz_travel_mm() {
        let kin = create_kinematics(KinematicsType::CoreXZ);
        let steps_to_mm = AxisArray::splat(0.01);
        let logical = AxisArray::new(100, 0, 100, 0);
        let head = kin.head_travel_mm(&logical, &steps_to_mm);
        let delta = kin.steps_from_delta(&logical).unwrap();
        let actuator = kin.actuator_travel_mm(&delta, &steps_to_mm);
        assert!((head[Axis::X] - 1.0).abs() < 1e-12);
        assert!((head[Axis::Z] - 1.0).abs() < 1e-12);
        assert!((actuator[Axis::X] - 2.0).abs() < 1e-12);
        assert!(actuator[Axis::Z].abs() < 1e-12);
    }

    #[test]
    fn test_step_delta_range() {
        let kin = create_kinematics(KinematicsType::CoreXY);
        let too_far = u32::MAX as i64;
        // Each axis fits on its own, but motor A needs the sum.
        assert_eq!(
            kin.steps_from_delta(&AxisArray::new(too_far - 10, 20, 0, 0)),
            Err(MotionError::TargetOutOfRange(Axis::X))
        );
        assert_eq!(
            kin.actuator_delta(&AxisArray::new(i64::MAX, 1, 0, 0)),
            Err(MotionError::TargetOutOfRange(Axis::X))
        );
        assert_eq!(
            create_kinematics(KinematicsType::Cartesian)
                .steps_from_delta(&AxisArray::new(0, 0, -too_far - 1, 0)),
            Err(MotionError::TargetOutOfRange(Axis::Z))
        );
        let ok = kin.steps_from_delta(&AxisArray::new(-300, 100, 0, 0)).unwrap();
        assert_eq!(ok.actuator, AxisArray::new(-200, -400, 0, 0));
    }

    #[test]
    fn test_odd_actuator_sum_rounds_down() {
        let kin = create_kinematics(KinematicsType::CoreXY);
        let logical = kin.logical_position(&AxisArray::new(801, 0, 0, 0));
        assert_eq!(logical, AxisArray::new(400, 400, 0, 0));
        // One step of motor A is not representable in logical steps.
        assert_eq!(kin.actuator_position(&logical).unwrap(), AxisArray::new(800, 0, 0, 0));
        let extreme = kin.logical_position(&AxisArray::new(i64::MAX, i64::MAX, 0, 0));
        assert_eq!(extreme[Axis::X], i64::MAX);
        assert_eq!(extreme[Axis::Y], 0);
    }
}
