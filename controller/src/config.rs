use std::{collections::HashMap, io::ErrorKind, path::Path};

use heatai_common::{ConfigError, RuntimeConfig};

pub const CONFIG_PATH_ENV: &str = "HEATAI_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "heatai.toml";

const OVERRIDE_VARS: [&str; 8] = [
    "HA_URL",
    "HA_TOKEN",
    "EBUSD_HOST",
    "EBUSD_PORT",
    "MQTT_HOST",
    "MQTT_PORT",
    "MQTT_USER",
    "MQTT_PASS",
];

/// File, then environment, then validation. A missing file means defaults.
pub fn load() -> Result<RuntimeConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = read_file(Path::new(&path))?;

    let env: HashMap<&str, String> = OVERRIDE_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (*name, value)))
        .collect();
    apply_env(&mut config, &env)?;

    config.validate()?;
    Ok(config)
}

pub fn read_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => parse(&raw, path),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        }),
    }
}

pub fn parse(raw: &str, path: &Path) -> Result<RuntimeConfig, ConfigError> {
    toml::from_str(raw).map_err(|err| ConfigError::Malformed {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

pub fn apply_env(config: &mut RuntimeConfig, env: &HashMap<&str, String>) -> Result<(), ConfigError> {
    if let Some(url) = env.get("HA_URL") {
        config.hub.url = url.clone();
    }
    if let Some(token) = env.get("HA_TOKEN") {
        config.hub.token = token.clone();
    }
    if let Some(host) = env.get("EBUSD_HOST") {
        config.ebusd.host = host.clone();
    }
    if let Some(port) = env.get("EBUSD_PORT") {
        config.ebusd.port = parse_port("EBUSD_PORT", port)?;
    }
    if let Some(host) = env.get("MQTT_HOST") {
        config.mqtt.host = host.clone();
    }
    if let Some(port) = env.get("MQTT_PORT") {
        config.mqtt.port = parse_port("MQTT_PORT", port)?;
    }
    if let Some(user) = env.get("MQTT_USER") {
        config.mqtt.user = user.clone();
    }
    if let Some(pass) = env.get("MQTT_PASS") {
        config.mqtt.pass = pass.clone();
    }
    Ok(())
}

fn parse_port(name: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(format!("{name} is not a port number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use heatai_common::{EbusdTransport, TargetSource};
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"
[control]
interval_secs = 15
staleness_secs = 60
refresh_interval_secs = 600

[control.limits]
max_flow_temp = 70.0

[ebusd]
transport = "mqtt"
circuit = "bai"

[ebusd.override]
hot_water_temp = 55.0

[hub]
url = "http://ha.local:8123"

[hub.target]
source = "entity"
entity = "input_number.heatai_flow"

[hub.publish]
calculated_flow_entity = "input_number.heatai_calculated_flow"
"#;

    #[test]
    fn parses_sections_and_keeps_defaults() {
        let config = parse(SAMPLE, Path::new("heatai.toml")).unwrap();
        assert_eq!(config.control.interval_secs, 15);
        assert_eq!(config.control.refresh_interval_secs, Some(600));
        assert_eq!(config.control.limits.max_flow_temp, 70.0);
        assert_eq!(config.control.limits.min_flow_temp, 20.0);
        assert_eq!(config.control.deadband, 1.0);
        assert_eq!(config.ebusd.transport, EbusdTransport::Mqtt);
        assert_eq!(config.ebusd.override_frame.hot_water_temp, 55.0);
        assert_eq!(config.ebusd.override_frame.message, "SetModeOverride");
        assert_eq!(
            config.hub.target,
            TargetSource::Entity {
                entity: "input_number.heatai_flow".to_string()
            }
        );
        assert_eq!(config.mqtt.topic_prefix, "ebusd");
    }

    #[test]
    fn malformed_file_is_reported_with_path() {
        let err = parse("[control]\ninterval_secs = \"soon\"", Path::new("/etc/heatai.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { ref path, .. } if path == "/etc/heatai.toml"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = read_file(Path::new("/nonexistent/heatai.toml")).unwrap();
        assert_eq!(config.control.interval_secs, 30);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = parse(SAMPLE, Path::new("heatai.toml")).unwrap();
        let env = HashMap::from([
            ("HA_URL", "http://other:8123".to_string()),
            ("HA_TOKEN", "secret".to_string()),
            ("MQTT_PORT", "1884".to_string()),
            ("MQTT_USER", "boiler".to_string()),
        ]);
        apply_env(&mut config, &env).unwrap();

        assert_eq!(config.hub.url, "http://other:8123");
        assert_eq!(config.hub.token, "secret");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.user, "boiler");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_port_is_invalid() {
        let mut config = RuntimeConfig::default();
        let env = HashMap::from([("EBUSD_PORT", "eighty".to_string())]);
        assert!(matches!(
            apply_env(&mut config, &env),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn shipped_sample_is_valid() {
        let mut config = parse(
            include_str!("../../deploy/heatai.toml"),
            Path::new("deploy/heatai.toml"),
        )
        .unwrap();
        config.hub.token = "secret".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.ebusd.transport, EbusdTransport::Tcp);
        assert_eq!(config.control.refresh_interval_secs, Some(300));
        assert_eq!(
            config.hub.settings.hot_water_temp_entity.as_deref(),
            Some("input_number.heatai_desired_storage_temperature")
        );
    }

    #[test]
    fn hub_timeout_longer_than_interval_is_rejected() {
        let mut config = parse(SAMPLE, Path::new("heatai.toml")).unwrap();
        config.hub.token = "secret".to_string();
        config.hub.timeout_secs = 20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn token_is_required() {
        let config = parse(SAMPLE, Path::new("heatai.toml")).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("HA_TOKEN"))));
    }
}
