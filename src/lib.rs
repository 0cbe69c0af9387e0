//! Look-ahead motion planner for step-driven machines.
//!
//! Requested straight moves are converted to integer step blocks, linked by
//! jerk-limited junction speeds, relaxed backward and forward across the
//! queue, and given a trapezoidal speed profile that a step executor
//! consumes concurrently through [`motion::BlockQueue`].

pub mod config;
pub mod motion;

pub use config::{Config, ConfigError, load_config, save_config};
pub use motion::{
    ActiveBlock, Axis, AxisArray, AxisSet, Block, BlockFlags, BlockQueue, EnqueueOutcome,
    MotionError, Planner, SimulatedStepper, StepperDriver,
};
