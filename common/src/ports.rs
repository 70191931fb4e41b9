//! Seams between the control loop and the outside world.
//!
//! The bus daemon and hub adapters live in the controller crate; tests
//! substitute in-memory fakes.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
    error::ClientError,
    types::{BoilerReading, Command, DesiredState, SendReport, StateReport},
};

/// Current boiler values, whatever the transport underneath.
///
/// Push transports buffer the latest bus messages and answer from the
/// buffer; `observed_at` must then be the arrival time of the oldest value
/// used, so a silent bus still ages out.
pub trait TelemetryClient: Send + Sync {
    fn fetch_reading(&self) -> impl Future<Output = Result<BoilerReading, ClientError>> + Send;
}

/// Absolute-value writes to the boiler. Sending the same command twice
/// leaves the boiler in the same state as sending it once.
pub trait CommandClient: Send + Sync {
    fn send_command(
        &self,
        command: &Command,
    ) -> impl Future<Output = Result<SendReport, ClientError>> + Send;
}

pub trait HubClient: Send + Sync {
    fn fetch_desired(&self) -> impl Future<Output = Result<DesiredState, ClientError>> + Send;

    /// Best effort; callers log failures and carry on.
    fn publish_state(
        &self,
        report: &StateReport,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
