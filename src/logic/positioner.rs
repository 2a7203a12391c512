//! Front end to a multi-axis motor.
//!
//! Moves are checked against the axis constraints before they reach the
//! controller.

use crate::error::DaqError;
use crate::hardware::capabilities::{Motor, MotorAxisConstraints};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Logic module wrapping one [`Motor`].
pub struct PositionerLogic {
    name: String,
    motor: Arc<dyn Motor>,
    state: StateCell,
}

impl PositionerLogic {
    /// Logic over `motor`.
    pub fn new(name: &str, motor: Arc<dyn Motor>) -> Self {
        Self {
            name: name.to_string(),
            motor,
            state: StateCell::new(),
        }
    }

    /// Axis constraints keyed by label
    pub fn get_constraints(&self) -> BTreeMap<String, MotorAxisConstraints> {
        self.motor.get_constraints()
    }

    fn check_targets(&self, targets: &BTreeMap<String, f64>) -> Result<()> {
        let constraints = self.get_constraints();
        for (axis, &target) in targets {
            let limits = constraints
                .get(axis)
                .ok_or_else(|| DaqError::InvalidArgument(format!("unknown axis '{}'", axis)))?;
            if !(limits.pos_min..=limits.pos_max).contains(&target) {
                return Err(DaqError::OutOfRange {
                    parameter: axis.clone(),
                    value: target,
                    min: limits.pos_min,
                    max: limits.pos_max,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Move the given axes to absolute positions.
    pub async fn move_abs(&self, targets: &BTreeMap<String, f64>) -> Result<()> {
        self.check_targets(targets)?;
        debug!(module = %self.name, ?targets, "Absolute move");
        self.motor.move_abs(targets).await
    }

    /// Move the given axes by relative distances.
    pub async fn move_rel(&self, moves: &BTreeMap<String, f64>) -> Result<()> {
        let axes: Vec<String> = moves.keys().cloned().collect();
        let current = self.motor.get_pos(&axes).await?;
        let targets = moves
            .iter()
            .map(|(axis, distance)| {
                let from = current.get(axis).copied().unwrap_or_default();
                (axis.clone(), from + distance)
            })
            .collect();
        self.check_targets(&targets)?;
        debug!(module = %self.name, ?moves, "Relative move");
        self.motor.move_rel(moves).await
    }

    /// Positions of `axes`, all axes when empty
    pub async fn get_pos(&self, axes: &[String]) -> Result<BTreeMap<String, f64>> {
        self.motor.get_pos(axes).await
    }

    /// Status word per axis
    pub async fn get_status(&self, axes: &[String]) -> Result<BTreeMap<String, i32>> {
        self.motor.get_status(axes).await
    }

    /// Stop all axes.
    pub async fn abort(&self) -> Result<()> {
        info!(module = %self.name, "Motion aborted");
        self.motor.abort().await
    }

    /// Reference run of `axes`.
    pub async fn calibrate(&self, axes: &[String]) -> Result<()> {
        self.motor.calibrate(axes).await
    }

    /// Velocity per axis
    pub async fn get_velocity(&self, axes: &[String]) -> Result<BTreeMap<String, f64>> {
        self.motor.get_velocity(axes).await
    }

    /// Set velocities; each must lie inside the axis velocity range.
    pub async fn set_velocity(&self, velocities: &BTreeMap<String, f64>) -> Result<()> {
        let constraints = self.get_constraints();
        for (axis, &velocity) in velocities {
            if let Some(limits) = constraints.get(axis) {
                if !(limits.vel_min..=limits.vel_max).contains(&velocity) {
                    return Err(DaqError::OutOfRange {
                        parameter: format!("{} velocity", axis),
                        value: velocity,
                        min: limits.vel_min,
                        max: limits.vel_max,
                    }
                    .into());
                }
            }
        }
        self.motor.set_velocity(velocities).await
    }
}

#[async_trait]
impl Module for PositionerLogic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}
