// src/motion/mod.rs

pub mod axis;
pub mod block;
pub mod junction;
pub mod kinematics;
pub mod leveling;
pub mod planner;
pub mod queue;
pub mod stepper;
pub mod trapezoid;

use std::time::Duration;

use thiserror::Error;

pub use axis::{Axis, AxisArray, AxisSet};
pub use block::{Block, BlockFlags};
pub use kinematics::{KinematicMapper, Kinematics, KinematicsType};
pub use planner::{AxisActivity, EnqueueOutcome, Planner};
pub use queue::{ActiveBlock, BlockQueue};
pub use stepper::{SimulatedStepper, StepperDriver};

/// Caller errors reported by the planner API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    /// Feed rate was zero, negative or not a number.
    #[error("Feed rate must be positive and finite, got {0}")]
    InvalidFeedRate(f64),
    #[error("Target position on axis '{0}' is not finite")]
    NonFiniteTarget(Axis),
    /// The target or the step delta to reach it does not fit the step
    /// counters.
    #[error("Target position on axis '{0}' is out of range")]
    TargetOutOfRange(Axis),
    #[error("Tool {tool} out of range ({count} configured)")]
    UnknownTool { tool: u8, count: u8 },
    #[error("Fan {fan} out of range ({count} configured)")]
    UnknownFan { fan: usize, count: usize },
    #[error("Invalid value for {name}: {value}")]
    InvalidSetting { name: &'static str, value: f64 },
    #[error("Kinematics error: {0}")]
    Kinematics(String),
}

/// Statistics for the motion queue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub length: usize,
    pub capacity: usize,
    pub estimated_runtime: Duration,
    /// Nominal speed (mm/s) and rate (steps/s) of the block at the tail.
    pub current_block: Option<(f64, u32)>,
}
