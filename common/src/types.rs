use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Telemetry,
    Hub,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Hub => "hub",
        }
    }
}

/// Remote service a failure is charged against for backoff purposes.
///
/// Telemetry reads and command writes both go to the bus daemon, so they
/// share one failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    BusDaemon,
    Hub,
}

impl Dependency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusDaemon => "bus_daemon",
            Self::Hub => "hub",
        }
    }

    pub fn for_source(source: Source) -> Self {
        match source {
            Source::Telemetry => Self::BusDaemon,
            Source::Hub => Self::Hub,
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoilerReading {
    #[serde(rename = "flowTemp")]
    pub flow_temp: f32,
    #[serde(rename = "returnTemp")]
    pub return_temp: f32,
    #[serde(rename = "burnerActive")]
    pub burner_active: bool,
    #[serde(rename = "errorCode")]
    pub error_code: Option<u16>,
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

/// Hot water and disable flags written along with every override.
/// `None` falls back to the configured override value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoilerSettings {
    #[serde(rename = "hotWaterTemp")]
    pub hot_water_temp: Option<f32>,
    #[serde(rename = "disableHeating")]
    pub disable_heating: Option<bool>,
    #[serde(rename = "disableHotWaterLoad")]
    pub disable_hot_water_load: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredState {
    #[serde(rename = "targetTemp")]
    pub target_temp: f32,
    pub enabled: bool,
    pub settings: BoilerSettings,
    #[serde(rename = "requestedAt")]
    pub requested_at: DateTime<Utc>,
}

impl DesiredState {
    /// Same request, ignoring when it was fetched.
    pub fn same_request(&self, other: &DesiredState) -> bool {
        self.enabled == other.enabled
            && (self.target_temp - other.target_temp).abs() <= f32::EPSILON
            && self.settings == other.settings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum CommandKind {
    SetTemperature(f32),
    SetMode(bool),
}

impl CommandKind {
    pub fn same_as(&self, other: &CommandKind) -> bool {
        match (self, other) {
            (Self::SetTemperature(a), Self::SetTemperature(b)) => (a - b).abs() <= f32::EPSILON,
            (Self::SetMode(a), Self::SetMode(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetTemperature(value) => write!(f, "SetTemperature({value:.1})"),
            Self::SetMode(true) => f.write_str("SetMode(on)"),
            Self::SetMode(false) => f.write_str("SetMode(off)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Command {
    pub kind: CommandKind,
    pub settings: BoilerSettings,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(kind: CommandKind, issued_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            settings: BoilerSettings::default(),
            issued_at,
        }
    }

    pub fn with_settings(mut self, settings: BoilerSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// What the command client actually wrote for a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendReport {
    pub requested: CommandKind,
    pub applied: CommandKind,
    pub acknowledged: bool,
}

impl SendReport {
    pub fn was_clamped(&self) -> bool {
        !self.requested.same_as(&self.applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Starting,
    Hold,
    Off,
    Active,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Hold => "HOLD",
            Self::Off => "OFF",
            Self::Active => "ACTIVE",
        }
    }
}

/// Last mode and setpoint the daemon acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CommandedState {
    pub mode: Option<bool>,
    #[serde(rename = "requestedSetpoint")]
    pub requested_setpoint: Option<f32>,
    #[serde(rename = "appliedSetpoint")]
    pub applied_setpoint: Option<f32>,
    pub settings: Option<BoilerSettings>,
    #[serde(rename = "lastAckAt")]
    pub last_ack_at: Option<DateTime<Utc>>,
}

/// Everything the hub is told at the end of a cycle. Without a fresh
/// reading only the controller state is published.
#[derive(Debug, Clone, PartialEq)]
pub struct StateReport {
    pub reading: Option<BoilerReading>,
    pub state: ControlState,
    pub target_temp: Option<f32>,
    pub commanded_setpoint: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "nextAttemptAt")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: &'static str,
    pub cycles: u64,
    pub reading: Option<BoilerReading>,
    #[serde(rename = "readingAgeSecs")]
    pub reading_age_secs: Option<i64>,
    pub desired: Option<DesiredState>,
    #[serde(rename = "desiredAgeSecs")]
    pub desired_age_secs: Option<i64>,
    pub commanded: CommandedState,
    #[serde(rename = "busDaemon")]
    pub bus_daemon: DependencyStatus,
    pub hub: DependencyStatus,
    #[serde(rename = "holdReasons")]
    pub hold_reasons: Vec<String>,
    #[serde(rename = "lastRejection")]
    pub last_rejection: Option<String>,
}
