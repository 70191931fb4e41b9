//! Home Assistant REST adapter: desired state in, boiler state out.

use std::time::Duration;

use chrono::Utc;
use heatai_common::{
    config::{FlowLimits, HubConfig, PublishConfig, SettingsEntities},
    heating_curve, BoilerSettings, ClientError, Dependency, DesiredState, HubClient, StateReport,
    TargetSource,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

const HUB: Dependency = Dependency::Hub;

#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn number(&self) -> Result<f32, ClientError> {
        let state = self.state.trim();
        if matches!(state, "unavailable" | "unknown" | "") {
            return Err(ClientError::parse(
                HUB,
                &self.state,
                format!("{} has no value", self.entity_id),
            ));
        }
        match state.parse::<f32>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(ClientError::parse(
                HUB,
                &self.state,
                format!("{} is not numeric", self.entity_id),
            )),
        }
    }

    pub fn switch(&self) -> Result<bool, ClientError> {
        match self.state.trim() {
            "on" => Ok(true),
            "off" => Ok(false),
            _ => Err(ClientError::parse(
                HUB,
                &self.state,
                format!("{} is neither on nor off", self.entity_id),
            )),
        }
    }

    /// Outside temperature from a `weather.*` entity.
    pub fn temperature_attribute(&self) -> Result<f32, ClientError> {
        self.attributes
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|value| value as f32)
            .filter(|value| value.is_finite())
            .ok_or_else(|| {
                ClientError::parse(
                    HUB,
                    Value::Object(self.attributes.clone()).to_string(),
                    format!("{} has no temperature attribute", self.entity_id),
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub entity_id: String,
    pub body: Value,
}

fn update(entity_id: String, state: String, attributes: Value) -> EntityUpdate {
    EntityUpdate {
        entity_id,
        body: json!({ "state": state, "attributes": attributes }),
    }
}

fn temperature(friendly_name: &str) -> Value {
    json!({
        "unit_of_measurement": "°C",
        "device_class": "temperature",
        "state_class": "measurement",
        "friendly_name": friendly_name,
    })
}

/// Entities written for one state report. Boiler sensors are skipped
/// when there is no fresh reading; the controller state always goes out.
pub fn state_updates(publish: &PublishConfig, report: &StateReport) -> Vec<EntityUpdate> {
    let prefix = &publish.entity_prefix;
    let mut updates = Vec::new();

    if let Some(reading) = &report.reading {
        updates.extend([
            update(
                format!("sensor.{prefix}_flow_temperature"),
                format!("{:.1}", reading.flow_temp),
                temperature("Boiler flow temperature"),
            ),
            update(
                format!("sensor.{prefix}_return_temperature"),
                format!("{:.1}", reading.return_temp),
                temperature("Boiler return temperature"),
            ),
            update(
                format!("binary_sensor.{prefix}_burner"),
                if reading.burner_active { "on" } else { "off" }.to_string(),
                json!({ "device_class": "heat", "friendly_name": "Boiler burner" }),
            ),
            update(
                format!("sensor.{prefix}_error_code"),
                reading
                    .error_code
                    .map_or_else(|| "none".to_string(), |code| code.to_string()),
                json!({ "friendly_name": "Boiler error code" }),
            ),
        ]);
    }

    updates.push(update(
        format!("sensor.{prefix}_controller_state"),
        report.state.as_str().to_string(),
        json!({
            "friendly_name": "Heating controller state",
            "target_temperature": report.target_temp,
            "observed_at": report.reading.as_ref().map(|reading| reading.observed_at.to_rfc3339()),
        }),
    ));

    if let Some(setpoint) = report.commanded_setpoint {
        updates.push(update(
            format!("sensor.{prefix}_flow_setpoint"),
            format!("{setpoint:.1}"),
            temperature("Commanded flow setpoint"),
        ));
    }

    updates
}

/// Authenticated REST access to one Home Assistant instance.
#[derive(Debug, Clone)]
struct HubApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HubApi {
    async fn entity(&self, entity_id: &str) -> Result<EntityState, ClientError> {
        let url = format!("{}/api/states/{entity_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::unreachable(HUB, format!("GET {entity_id}: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ClientError::unreachable(HUB, format!("GET {entity_id}: {err}")))?;
        if !status.is_success() {
            return Err(ClientError::unreachable(
                HUB,
                format!("GET {entity_id}: HTTP {status}"),
            ));
        }

        serde_json::from_str(&body).map_err(|err| ClientError::parse(HUB, body, err.to_string()))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(), ClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|err| ClientError::unreachable(HUB, format!("POST {path}: {err}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::unreachable(HUB, format!("POST {path}: HTTP {status}")))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HomeAssistantClient {
    api: HubApi,
    timeout: Duration,
    enabled_entity: String,
    target: TargetSource,
    settings: SettingsEntities,
    publish: PublishConfig,
    limits: FlowLimits,
}

impl HomeAssistantClient {
    /// `limits` bound the flow value mirrored back to the hub.
    pub fn new(config: &HubConfig, limits: FlowLimits) -> reqwest::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api: HubApi {
                http,
                base_url: config.url.trim_end_matches('/').to_string(),
                token: config.token.clone(),
            },
            timeout,
            enabled_entity: config.enabled_entity.clone(),
            target: config.target.clone(),
            settings: config.settings.clone(),
            publish: config.publish.clone(),
            limits,
        })
    }

    pub async fn entity(&self, entity_id: &str) -> Result<EntityState, ClientError> {
        self.api.entity(entity_id).await
    }

    async fn target_temp(&self) -> Result<f32, ClientError> {
        match &self.target {
            TargetSource::Entity { entity } => self.entity(entity).await?.number(),
            TargetSource::HeatingCurve {
                inside_entity,
                factor_entity,
                weather_entity,
            } => {
                let (inside, factor, weather) = tokio::try_join!(
                    self.entity(inside_entity),
                    self.entity(factor_entity),
                    self.entity(weather_entity),
                )?;
                let inside = inside.number()?;
                let factor = factor.number()?;
                let outside = weather.temperature_attribute()?;
                let flow = heating_curve(inside, factor, outside);
                debug!(inside, factor, outside, flow, "heating curve");
                Ok(flow)
            }
        }
    }

    async fn settings(&self) -> BoilerSettings {
        let entities = &self.settings;
        let (hot_water_temp, disable_heating, disable_hot_water_load) = tokio::join!(
            self.optional(entities.hot_water_temp_entity.as_deref(), EntityState::number),
            self.optional(entities.disable_heating_entity.as_deref(), EntityState::switch),
            self.optional(entities.disable_hot_water_load_entity.as_deref(), EntityState::switch),
        );
        BoilerSettings {
            hot_water_temp,
            disable_heating,
            disable_hot_water_load,
        }
    }

    /// Value of an optional settings entity; `None` if unset or unreadable.
    async fn optional<T>(
        &self,
        entity_id: Option<&str>,
        read: fn(&EntityState) -> Result<T, ClientError>,
    ) -> Option<T> {
        let entity_id = entity_id?;
        match self.entity(entity_id).await.and_then(|state| read(&state)) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(entity = entity_id, "using configured override value: {err}");
                None
            }
        }
    }

    /// Every state write plus the optional `input_number.set_value` mirror.
    fn publish_requests(&self, report: &StateReport) -> Vec<(String, Value)> {
        let mut requests: Vec<(String, Value)> = state_updates(&self.publish, report)
            .into_iter()
            .map(|update| (format!("/api/states/{}", update.entity_id), update.body))
            .collect();

        if let (Some(entity), Some(target)) = (&self.publish.calculated_flow_entity, report.target_temp) {
            requests.push((
                "/api/services/input_number/set_value".to_string(),
                json!({ "entity_id": entity, "value": self.limits.clamp(target) }),
            ));
        }
        requests
    }
}

impl HubClient for HomeAssistantClient {
    async fn fetch_desired(&self) -> Result<DesiredState, ClientError> {
        let (required, settings) = tokio::join!(
            async {
                tokio::try_join!(
                    async { self.entity(&self.enabled_entity).await?.switch() },
                    self.target_temp(),
                )
            },
            self.settings(),
        );
        let (enabled, target_temp) = required?;

        Ok(DesiredState {
            target_temp,
            enabled,
            settings,
            requested_at: Utc::now(),
        })
    }

    /// Writes every entity concurrently, all within one hub timeout.
    /// Returns the first failure.
    async fn publish_state(&self, report: &StateReport) -> Result<(), ClientError> {
        let mut posts = JoinSet::new();
        for (path, body) in self.publish_requests(report) {
            let api = self.api.clone();
            posts.spawn(async move {
                let result = api.post(&path, &body).await;
                (path, result)
            });
        }

        let collect = async {
            let mut first_error = None;
            while let Some(joined) = posts.join_next().await {
                let err = match joined {
                    Ok((_, Ok(()))) => continue,
                    Ok((path, Err(err))) => {
                        debug!(%path, "publish failed: {err}");
                        err
                    }
                    Err(err) => ClientError::unreachable(HUB, format!("publish task: {err}")),
                };
                first_error.get_or_insert(err);
            }
            first_error
        };

        match tokio::time::timeout(self.timeout, collect).await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(ClientError::unreachable(
                HUB,
                format!("publish not finished within {:?}", self.timeout),
            )),
        }
    }
}
