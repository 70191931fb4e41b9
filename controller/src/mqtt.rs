//! EBUSD over MQTT: ebusd publishes every decoded message under
//! `<prefix>/<circuit>/<name>` and accepts writes on `.../<name>/set`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use heatai_common::{
    config::{EbusdConfig, FlowLimits, MqttConfig},
    BoilerReading, ClientError, Command, CommandClient, Dependency, SendReport, TelemetryClient,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::ebusd::{parse_error_code, parse_flag, parse_number, OverrideWriter};

const BUS: Dependency = Dependency::BusDaemon;
const MAX_MQTT_PAYLOAD_BYTES: usize = 1024;

#[derive(Debug, Clone)]
struct Buffered {
    payload: String,
    received_at: DateTime<Utc>,
}

/// Latest payload per topic, fed by the MQTT event loop.
#[derive(Debug, Clone, Default)]
pub struct TopicBuffer {
    inner: Arc<Mutex<HashMap<String, Buffered>>>,
}

impl TopicBuffer {
    pub fn record(&self, topic: &str, payload: String, received_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.insert(
            topic.to_string(),
            Buffered {
                payload,
                received_at,
            },
        );
    }

    fn latest(&self, topic: &str) -> Option<Buffered> {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.get(topic).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct FieldTopics {
    pub flow_temp: String,
    pub return_temp: String,
    pub burner: String,
    pub error_code: Option<String>,
}

impl FieldTopics {
    pub fn new(prefix: &str, ebusd: &EbusdConfig) -> Self {
        let topic = |name: &str| format!("{prefix}/{}/{name}", ebusd.circuit);
        Self {
            flow_temp: topic(&ebusd.fields.flow_temp),
            return_temp: topic(&ebusd.fields.return_temp),
            burner: topic(&ebusd.fields.burner),
            error_code: ebusd.fields.error_code.as_deref().map(topic),
        }
    }

    pub fn all(&self) -> Vec<&str> {
        let mut topics = vec![
            self.flow_temp.as_str(),
            self.return_temp.as_str(),
            self.burner.as_str(),
        ];
        if let Some(error_code) = &self.error_code {
            topics.push(error_code);
        }
        topics
    }
}

/// Answers `fetch_reading` from the buffer; never touches the network.
#[derive(Debug, Clone)]
pub struct MqttTelemetry {
    buffer: TopicBuffer,
    topics: FieldTopics,
}

impl MqttTelemetry {
    pub fn new(buffer: TopicBuffer, topics: FieldTopics) -> Self {
        Self { buffer, topics }
    }

    fn required(&self, topic: &str) -> Result<Buffered, ClientError> {
        self.buffer
            .latest(topic)
            .ok_or_else(|| ClientError::unreachable(BUS, format!("nothing received on {topic} yet")))
    }

    pub fn assemble(&self) -> Result<BoilerReading, ClientError> {
        let flow = self.required(&self.topics.flow_temp)?;
        let ret = self.required(&self.topics.return_temp)?;
        let burner = self.required(&self.topics.burner)?;
        let error_code = self
            .topics
            .error_code
            .as_deref()
            .and_then(|topic| self.buffer.latest(topic));

        // A reading is only as fresh as its oldest required part.
        let observed_at = [flow.received_at, ret.received_at, burner.received_at]
            .into_iter()
            .min()
            .unwrap_or(flow.received_at);

        Ok(BoilerReading {
            flow_temp: parse_number(&extract_value(&flow.payload))?,
            return_temp: parse_number(&extract_value(&ret.payload))?,
            burner_active: parse_flag(&extract_value(&burner.payload))?,
            error_code: match error_code {
                Some(buffered) => parse_error_code(&extract_value(&buffered.payload))?,
                None => None,
            },
            observed_at,
        })
    }
}

impl TelemetryClient for MqttTelemetry {
    async fn fetch_reading(&self) -> Result<BoilerReading, ClientError> {
        self.assemble()
    }
}

/// Plain payloads pass through; ebusd JSON payloads yield the first
/// `value` found, e.g. `{"temp":{"value":45.5}}`.
pub fn extract_value(payload: &str) -> String {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        return trimmed.to_string();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => find_value(&json)
            .map(value_text)
            .unwrap_or_else(|| trimmed.to_string()),
        Err(_) => trimmed.to_string(),
    }
}

fn find_value(json: &Value) -> Option<&Value> {
    let object = json.as_object()?;
    if let Some(value) = object.get("value") {
        return Some(value);
    }
    object.values().find_map(find_value)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct MqttCommandClient {
    client: AsyncClient,
    topic: String,
    timeout: Duration,
    writer: Arc<OverrideWriter>,
}

impl MqttCommandClient {
    pub fn new(client: AsyncClient, prefix: &str, ebusd: &EbusdConfig, limits: FlowLimits) -> Self {
        Self {
            client,
            topic: format!(
                "{prefix}/{}/{}/set",
                ebusd.circuit, ebusd.override_frame.message
            ),
            timeout: Duration::from_secs(ebusd.timeout_secs),
            writer: Arc::new(OverrideWriter::new(&ebusd.override_frame, limits)),
        }
    }
}

impl CommandClient for MqttCommandClient {
    async fn send_command(&self, command: &Command) -> Result<SendReport, ClientError> {
        let (frame, applied) = self.writer.prepare(command);
        let payload = frame.encode();
        debug!(topic = %self.topic, payload = %payload, "publishing override frame");

        let publish = self
            .client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload.into_bytes());
        match tokio::time::timeout(self.timeout, publish).await {
            Ok(Ok(())) => {
                self.writer.commit(frame);
                Ok(SendReport {
                    requested: command.kind,
                    applied,
                    acknowledged: true,
                })
            }
            Ok(Err(err)) => Err(ClientError::unreachable(BUS, format!("mqtt publish: {err}"))),
            Err(_) => Err(ClientError::unreachable(
                BUS,
                format!("mqtt publish not queued within {:?}", self.timeout),
            )),
        }
    }
}

pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !config.user.is_empty() {
        options.set_credentials(config.user.as_str(), config.pass.as_str());
    }
    AsyncClient::new(options, 64)
}

/// Polls the event loop forever, (re)subscribing on every connect.
pub fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    buffer: TopicBuffer,
    topics: Vec<String>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    match String::from_utf8(message.payload.to_vec()) {
                        Ok(payload) => buffer.record(&message.topic, payload, Utc::now()),
                        Err(_) => warn!(topic = %message.topic, "non utf8 mqtt payload"),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected, subscribing to {} topics", topics.len());
                    for topic in &topics {
                        if let Err(err) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            warn!(topic = %topic, "mqtt subscribe failed: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn telemetry() -> (TopicBuffer, MqttTelemetry) {
        let buffer = TopicBuffer::default();
        let topics = FieldTopics::new("ebusd", &EbusdConfig::default());
        (buffer.clone(), MqttTelemetry::new(buffer, topics))
    }

    #[test]
    fn topics_follow_prefix_and_circuit() {
        let topics = FieldTopics::new("ebusd", &EbusdConfig::default());
        assert_eq!(
            topics.all(),
            vec![
                "ebusd/bai/FlowTemp",
                "ebusd/bai/ReturnTemp",
                "ebusd/bai/Flame",
                "ebusd/bai/currenterror",
            ]
        );
    }

    #[test]
    fn json_payloads_yield_first_value() {
        assert_eq!(extract_value(r#"{"temp":{"value":45.5}}"#), "45.5");
        assert_eq!(extract_value(r#"{"0":{"name":"","value":"on"}}"#), "on");
        assert_eq!(extract_value(r#"{"error":{"value":null}}"#), "-");
        assert_eq!(extract_value("38.0;ok"), "38.0;ok");
        assert_eq!(extract_value("{broken"), "{broken");
    }

    #[test]
    fn reading_requires_every_field() {
        let (buffer, telemetry) = telemetry();
        buffer.record("ebusd/bai/FlowTemp", "45.5;ok".to_string(), t(0));
        buffer.record("ebusd/bai/ReturnTemp", "38.0;ok".to_string(), t(0));

        let err = telemetry.assemble().unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }));
    }

    #[test]
    fn reading_is_as_old_as_its_oldest_part() {
        let (buffer, telemetry) = telemetry();
        buffer.record("ebusd/bai/FlowTemp", r#"{"temp":{"value":45.5}}"#.to_string(), t(20));
        buffer.record("ebusd/bai/ReturnTemp", "38.0;ok".to_string(), t(5));
        buffer.record("ebusd/bai/Flame", "off".to_string(), t(12));

        let reading = telemetry.assemble().unwrap();
        assert_eq!(reading.flow_temp, 45.5);
        assert_eq!(reading.return_temp, 38.0);
        assert!(!reading.burner_active);
        assert_eq!(reading.error_code, None);
        assert_eq!(reading.observed_at, t(5));
    }

    #[test]
    fn malformed_payload_is_parse_error() {
        let (buffer, telemetry) = telemetry();
        buffer.record("ebusd/bai/FlowTemp", "unavailable".to_string(), t(0));
        buffer.record("ebusd/bai/ReturnTemp", "38.0".to_string(), t(0));
        buffer.record("ebusd/bai/Flame", "on".to_string(), t(0));

        let err = telemetry.assemble().unwrap_err();
        assert!(matches!(err, ClientError::Parse { .. }));
    }

    #[test]
    fn newer_payload_replaces_older() {
        let (buffer, telemetry) = telemetry();
        buffer.record("ebusd/bai/FlowTemp", "40.0".to_string(), t(0));
        buffer.record("ebusd/bai/FlowTemp", "42.0".to_string(), t(10));
        buffer.record("ebusd/bai/ReturnTemp", "35.0".to_string(), t(10));
        buffer.record("ebusd/bai/Flame", "on".to_string(), t(10));
        buffer.record("ebusd/bai/currenterror", "28".to_string(), t(10));

        let reading = telemetry.assemble().unwrap();
        assert_eq!(reading.flow_temp, 42.0);
        assert_eq!(reading.error_code, Some(28));
        assert_eq!(reading.observed_at, t(10));
    }
}
