use chrono::{DateTime, Duration, Utc};

use crate::{
    config::ControlConfig,
    types::{BoilerReading, CommandKind, CommandedState, DesiredState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    AlreadyOff,
    WithinDeadband,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Issue(CommandKind),
    /// Periodic re-send of what the boiler should already have.
    Refresh(CommandKind),
    NoOp(NoOpReason),
}

impl Decision {
    pub fn command(&self) -> Option<CommandKind> {
        match self {
            Self::Issue(kind) | Self::Refresh(kind) => Some(*kind),
            Self::NoOp(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlPolicy {
    pub deadband: f32,
    pub hysteresis: f32,
    pub refresh_interval: Option<Duration>,
}

impl ControlPolicy {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            deadband: config.deadband,
            hysteresis: config.hysteresis,
            refresh_interval: config.refresh_interval(),
        }
    }

    pub fn decide(
        &self,
        reading: &BoilerReading,
        desired: &DesiredState,
        commanded: &CommandedState,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = self.decide_change(reading, desired, commanded);
        if !matches!(decision, Decision::NoOp(_)) {
            return decision;
        }

        // New hot water or disable settings go out with the current mode.
        if commanded.settings.is_some_and(|settings| settings != desired.settings) {
            if let Some(kind) = resend_kind(commanded) {
                return Decision::Issue(kind);
            }
        }
        self.refresh(commanded, now).unwrap_or(decision)
    }

    fn decide_change(
        &self,
        reading: &BoilerReading,
        desired: &DesiredState,
        commanded: &CommandedState,
    ) -> Decision {
        if !desired.enabled {
            return if commanded.mode == Some(false) {
                Decision::NoOp(NoOpReason::AlreadyOff)
            } else {
                Decision::Issue(CommandKind::SetMode(false))
            };
        }

        // Switching on is a cycle of its own; the setpoint follows next cycle.
        if commanded.mode != Some(true) {
            return Decision::Issue(CommandKind::SetMode(true));
        }

        if (reading.flow_temp - desired.target_temp).abs() <= self.deadband {
            return Decision::NoOp(NoOpReason::WithinDeadband);
        }

        if let Some(requested) = commanded.requested_setpoint {
            if (requested - desired.target_temp).abs() <= self.hysteresis {
                return Decision::NoOp(NoOpReason::Unchanged);
            }
        }

        Decision::Issue(CommandKind::SetTemperature(desired.target_temp))
    }

    fn refresh(&self, commanded: &CommandedState, now: DateTime<Utc>) -> Option<Decision> {
        let interval = self.refresh_interval?;
        let last_ack = commanded.last_ack_at?;
        if now.signed_duration_since(last_ack) < interval {
            return None;
        }

        resend_kind(commanded).map(Decision::Refresh)
    }
}

/// The command that restates what the boiler was last told.
fn resend_kind(commanded: &CommandedState) -> Option<CommandKind> {
    match (commanded.mode, commanded.requested_setpoint) {
        (Some(true), Some(setpoint)) => Some(CommandKind::SetTemperature(setpoint)),
        (Some(mode), _) => Some(CommandKind::SetMode(mode)),
        (None, _) => None,
    }
}

/// Weather-compensated flow temperature, rounded to 0.1.
pub fn heating_curve(inside_temp: f32, factor: f32, outside_temp: f32) -> f32 {
    let flow = inside_temp + factor * (inside_temp - outside_temp);
    (flow * 10.0).round() / 10.0
}
