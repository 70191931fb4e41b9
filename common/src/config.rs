use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub interval_secs: u64,
    pub staleness_secs: u64,
    pub deadband: f32,
    pub hysteresis: f32,
    pub reject_backoff_secs: u64,
    /// Re-send the commanded state when nothing changed for this long so
    /// the boiler's override does not lapse. `None` never re-sends an
    /// unchanged command.
    pub refresh_interval_secs: Option<u64>,
    pub backoff: BackoffConfig,
    pub limits: FlowLimits,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            staleness_secs: 90,
            deadband: 1.0,
            hysteresis: 0.5,
            reject_backoff_secs: 300,
            refresh_interval_secs: Some(300),
            backoff: BackoffConfig::default(),
            limits: FlowLimits::default(),
        }
    }
}

impl ControlConfig {
    pub fn interval(&self) -> chrono::Duration {
        secs(self.interval_secs)
    }

    pub fn staleness(&self) -> chrono::Duration {
        secs(self.staleness_secs)
    }

    pub fn reject_backoff(&self) -> chrono::Duration {
        secs(self.reject_backoff_secs)
    }

    pub fn refresh_interval(&self) -> Option<chrono::Duration> {
        self.refresh_interval_secs.map(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub max_secs: u64,
    /// Fraction of the delay that may be shaved off at random, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 5,
            max_secs: 300,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowLimits {
    pub min_flow_temp: f32,
    pub max_flow_temp: f32,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            min_flow_temp: 20.0,
            max_flow_temp: 80.0,
        }
    }
}

impl FlowLimits {
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min_flow_temp, self.max_flow_temp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EbusdTransport {
    Tcp,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EbusdConfig {
    pub transport: EbusdTransport,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub circuit: String,
    /// Oldest cached bus value ebusd may answer a `read` with.
    pub max_age_secs: u64,
    pub fields: EbusdFields,
    #[serde(rename = "override")]
    pub override_frame: OverrideConfig,
}

impl Default for EbusdConfig {
    fn default() -> Self {
        Self {
            transport: EbusdTransport::Tcp,
            host: "127.0.0.1".to_string(),
            port: 8888,
            timeout_secs: 5,
            circuit: "bai".to_string(),
            max_age_secs: 30,
            fields: EbusdFields::default(),
            override_frame: OverrideConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EbusdFields {
    pub flow_temp: String,
    pub return_temp: String,
    pub burner: String,
    pub error_code: Option<String>,
}

impl Default for EbusdFields {
    fn default() -> Self {
        Self {
            flow_temp: "FlowTemp".to_string(),
            return_temp: "ReturnTemp".to_string(),
            burner: "Flame".to_string(),
            error_code: Some("currenterror".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideConfig {
    pub message: String,
    pub hot_water_temp: f32,
    pub disable_heating: bool,
    pub disable_hot_water_load: bool,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            message: "SetModeOverride".to_string(),
            hot_water_temp: 50.0,
            disable_heating: false,
            disable_hot_water_load: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            client_id: "heatai".to_string(),
            topic_prefix: "ebusd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub timeout_secs: u64,
    pub enabled_entity: String,
    pub target: TargetSource,
    pub settings: SettingsEntities,
    pub publish: PublishConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            token: String::new(),
            timeout_secs: 10,
            enabled_entity: "input_boolean.heatai".to_string(),
            target: TargetSource::default(),
            settings: SettingsEntities::default(),
            publish: PublishConfig::default(),
        }
    }
}

/// Hub entities read every cycle for the override's hot water and disable
/// fields. An unset or unreadable entity leaves the `[ebusd.override]`
/// value in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsEntities {
    pub hot_water_temp_entity: Option<String>,
    pub disable_heating_entity: Option<String>,
    pub disable_hot_water_load_entity: Option<String>,
}

impl Default for SettingsEntities {
    fn default() -> Self {
        Self {
            hot_water_temp_entity: Some("input_number.heatai_desired_storage_temperature".to_string()),
            disable_heating_entity: Some("input_boolean.heatai_heating_disable".to_string()),
            disable_hot_water_load_entity: Some("input_boolean.heatai_waterstorage_disable".to_string()),
        }
    }
}

/// Where the target flow temperature comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TargetSource {
    Entity {
        entity: String,
    },
    /// Weather compensation: `flow = ti + factor * (ti - ta)`.
    HeatingCurve {
        inside_entity: String,
        factor_entity: String,
        weather_entity: String,
    },
}

impl Default for TargetSource {
    fn default() -> Self {
        Self::HeatingCurve {
            inside_entity: "input_number.heatai_desired_inside_temperature".to_string(),
            factor_entity: "input_number.heatai_heating_curve_factor".to_string(),
            weather_entity: "weather.home".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub entity_prefix: String,
    pub calculated_flow_entity: Option<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            entity_prefix: "heatai".to_string(),
            calculated_flow_entity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub bind: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: Some("0.0.0.0:8080".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    pub ebusd: EbusdConfig,
    pub mqtt: MqttConfig,
    pub hub: HubConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let control = &self.control;
        if control.interval_secs == 0 {
            return invalid("control.interval_secs must be positive");
        }
        if control.staleness_secs == 0 {
            return invalid("control.staleness_secs must be positive");
        }
        if !control.deadband.is_finite() || control.deadband < 0.0 {
            return invalid("control.deadband must be a non-negative number");
        }
        if !control.hysteresis.is_finite() || control.hysteresis < 0.0 {
            return invalid("control.hysteresis must be a non-negative number");
        }
        if control.refresh_interval_secs == Some(0) {
            return invalid("control.refresh_interval_secs must be positive when set");
        }
        if control.backoff.base_secs == 0 {
            return invalid("control.backoff.base_secs must be positive");
        }
        if control.backoff.max_secs < control.backoff.base_secs {
            return invalid("control.backoff.max_secs must be >= base_secs");
        }
        if !(0.0..=1.0).contains(&control.backoff.jitter) {
            return invalid("control.backoff.jitter must be within 0.0..=1.0");
        }
        let limits = control.limits;
        if !limits.min_flow_temp.is_finite()
            || !limits.max_flow_temp.is_finite()
            || limits.min_flow_temp >= limits.max_flow_temp
        {
            return invalid("control.limits must satisfy min_flow_temp < max_flow_temp");
        }

        let ebusd = &self.ebusd;
        if ebusd.timeout_secs == 0 {
            return invalid("ebusd.timeout_secs must be positive");
        }
        if ebusd.circuit.trim().is_empty() {
            return invalid("ebusd.circuit cannot be empty");
        }
        if ebusd.override_frame.message.trim().is_empty() {
            return invalid("ebusd.override.message cannot be empty");
        }
        if !ebusd.override_frame.hot_water_temp.is_finite() {
            return invalid("ebusd.override.hot_water_temp must be a number");
        }
        match ebusd.transport {
            EbusdTransport::Tcp => {
                if ebusd.host.trim().is_empty() || ebusd.port == 0 {
                    return invalid("ebusd.host and ebusd.port are required for tcp transport");
                }
            }
            EbusdTransport::Mqtt => {
                if self.mqtt.host.trim().is_empty() || self.mqtt.port == 0 {
                    return invalid("mqtt.host and mqtt.port are required for mqtt transport");
                }
            }
        }

        let hub = &self.hub;
        if hub.url.trim().is_empty() {
            return Err(ConfigError::Missing("hub.url"));
        }
        if hub.token.trim().is_empty() {
            return Err(ConfigError::Missing("HA_TOKEN"));
        }
        if hub.timeout_secs == 0 {
            return invalid("hub.timeout_secs must be positive");
        }
        if hub.timeout_secs >= control.interval_secs {
            return invalid("hub.timeout_secs must be shorter than control.interval_secs");
        }
        if hub.enabled_entity.trim().is_empty() {
            return invalid("hub.enabled_entity cannot be empty");
        }
        if hub.publish.entity_prefix.trim().is_empty() {
            return invalid("hub.publish.entity_prefix cannot be empty");
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(u64::from(u32::MAX)) as i64)
}
