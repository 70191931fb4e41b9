//! EBUSD line-protocol adapter (`ebusd --port 8888`).
//!
//! Reads and writes go through short-lived TCP connections; every request
//! is bounded by the configured timeout.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use heatai_common::{
    config::{EbusdConfig, EbusdFields, FlowLimits, OverrideConfig},
    BoilerReading, BoilerSettings, ClientError, Command, CommandClient, CommandKind, Dependency,
    SendReport, TelemetryClient,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::debug;

const BUS: Dependency = Dependency::BusDaemon;

/// The twelve-field `SetModeOverride` payload. Only the fields below are
/// driven; the rest are sent as fixed placeholders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverrideFrame {
    pub heating_on: bool,
    pub flow_temp: Option<f32>,
    pub hot_water_temp: f32,
    pub disable_heating: bool,
    pub disable_hot_water_load: bool,
}

impl OverrideFrame {
    pub fn new(config: &OverrideConfig) -> Self {
        Self {
            heating_on: false,
            flow_temp: None,
            hot_water_temp: config.hot_water_temp,
            disable_heating: config.disable_heating,
            disable_hot_water_load: config.disable_hot_water_load,
        }
    }

    /// Hot water and disable fields from the hub, falling back to `defaults`
    /// for anything the hub did not provide.
    pub fn with_settings(&self, settings: &BoilerSettings, defaults: &OverrideFrame) -> Self {
        Self {
            hot_water_temp: settings.hot_water_temp.unwrap_or(defaults.hot_water_temp),
            disable_heating: settings.disable_heating.unwrap_or(defaults.disable_heating),
            disable_hot_water_load: settings
                .disable_hot_water_load
                .unwrap_or(defaults.disable_hot_water_load),
            ..*self
        }
    }

    /// Frame after `kind`, plus the command as it will actually be written.
    pub fn apply(&self, kind: CommandKind, limits: &FlowLimits) -> (Self, CommandKind) {
        let mut next = *self;
        let applied = match kind {
            CommandKind::SetMode(on) => {
                next.heating_on = on;
                if !on {
                    next.flow_temp = None;
                }
                kind
            }
            CommandKind::SetTemperature(value) => {
                let clamped = limits.clamp(value);
                next.heating_on = true;
                next.flow_temp = Some(clamped);
                CommandKind::SetTemperature(clamped)
            }
        };
        (next, applied)
    }

    /// `hcmode;flowtempdesired;hwctempdesired;-;-;disablehc;0;disablehwcload;-;0;0;0`
    pub fn encode(&self) -> String {
        let flow = match (self.heating_on, self.flow_temp) {
            (true, Some(value)) => format!("{value:.1}"),
            (true, None) => "-".to_string(),
            (false, _) => "0.0".to_string(),
        };
        format!(
            "{};{};{:.1};-;-;{};0;{};-;0;0;0",
            flag(self.heating_on),
            flow,
            self.hot_water_temp,
            flag(self.disable_heating),
            flag(self.disable_hot_water_load),
        )
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Tracks the last acknowledged override frame so every write is a full,
/// absolute frame.
#[derive(Debug)]
pub struct OverrideWriter {
    frame: Mutex<OverrideFrame>,
    defaults: OverrideFrame,
    limits: FlowLimits,
}

impl OverrideWriter {
    pub fn new(config: &OverrideConfig, limits: FlowLimits) -> Self {
        let defaults = OverrideFrame::new(config);
        Self {
            frame: Mutex::new(defaults),
            defaults,
            limits,
        }
    }

    pub fn prepare(&self, command: &Command) -> (OverrideFrame, CommandKind) {
        let current = *self.frame.lock().unwrap_or_else(|err| err.into_inner());
        current
            .with_settings(&command.settings, &self.defaults)
            .apply(command.kind, &self.limits)
    }

    pub fn commit(&self, frame: OverrideFrame) {
        *self.frame.lock().unwrap_or_else(|err| err.into_inner()) = frame;
    }
}

pub fn parse_number(raw: &str) -> Result<f32, ClientError> {
    let field = first_field(raw);
    match field.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ClientError::parse(BUS, raw, "expected a number")),
    }
}

pub fn parse_flag(raw: &str) -> Result<bool, ClientError> {
    match first_field(raw).to_ascii_lowercase().as_str() {
        "on" | "1" | "yes" | "true" => Ok(true),
        "off" | "0" | "no" | "false" => Ok(false),
        _ => Err(ClientError::parse(BUS, raw, "expected on/off")),
    }
}

pub fn parse_error_code(raw: &str) -> Result<Option<u16>, ClientError> {
    let field = first_field(raw);
    if field.is_empty() || field == "-" || field.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    match field.parse::<u16>() {
        Ok(0) => Ok(None),
        Ok(code) => Ok(Some(code)),
        Err(_) => Err(ClientError::parse(BUS, raw, "expected an error code")),
    }
}

fn first_field(raw: &str) -> &str {
    raw.split(';').next().unwrap_or_default().trim()
}

/// Maps an `ERR:` reply to a rejection (bad argument) or an outage.
pub fn classify_error(reply: &str) -> ClientError {
    let lower = reply.to_ascii_lowercase();
    if lower.contains("invalid") || lower.contains("range") || lower.contains("argument") {
        ClientError::rejected(BUS, reply)
    } else {
        ClientError::unreachable(BUS, reply)
    }
}

#[derive(Debug, Clone)]
struct ReadRequest {
    circuit: String,
    max_age_secs: u64,
    fields: EbusdFields,
}

impl ReadRequest {
    fn line(&self, name: &str) -> String {
        format!("read -m {} -c {} {}", self.max_age_secs, self.circuit, name)
    }
}

#[derive(Debug, Clone)]
pub struct EbusdTcpClient {
    addr: String,
    timeout: Duration,
    read: ReadRequest,
    message: String,
    writer: Arc<OverrideWriter>,
}

impl EbusdTcpClient {
    pub fn new(config: &EbusdConfig, limits: FlowLimits) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            timeout: Duration::from_secs(config.timeout_secs),
            read: ReadRequest {
                circuit: config.circuit.clone(),
                max_age_secs: config.max_age_secs,
                fields: config.fields.clone(),
            },
            message: config.override_frame.message.clone(),
            writer: Arc::new(OverrideWriter::new(&config.override_frame, limits)),
        }
    }

    /// Sends each line and collects one reply per line.
    async fn exchange(&self, lines: &[String]) -> Result<Vec<String>, ClientError> {
        match tokio::time::timeout(self.timeout, self.exchange_inner(lines)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::unreachable(
                BUS,
                format!("no reply from {} within {:?}", self.addr, self.timeout),
            )),
        }
    }

    async fn exchange_inner(&self, lines: &[String]) -> Result<Vec<String>, ClientError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|err| ClientError::unreachable(BUS, format!("connect {}: {err}", self.addr)))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut replies = Vec::with_capacity(lines.len());

        for line in lines {
            debug!(request = %line, "ebusd request");
            writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .map_err(|err| ClientError::unreachable(BUS, format!("write: {err}")))?;
            replies.push(read_reply(&mut reader).await?);
        }

        Ok(replies)
    }
}

/// Reads lines until the empty line that terminates an ebusd reply.
async fn read_reply<R>(reader: &mut R) -> Result<String, ClientError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut reply = Vec::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|err| ClientError::unreachable(BUS, format!("read: {err}")))?;
        if read == 0 {
            if reply.is_empty() {
                return Err(ClientError::unreachable(BUS, "connection closed by ebusd"));
            }
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if reply.is_empty() {
                continue;
            }
            break;
        }
        reply.push(trimmed.to_string());
    }
    Ok(reply.join("\n"))
}

fn check_value(reply: &str) -> Result<&str, ClientError> {
    if reply.starts_with("ERR:") {
        Err(ClientError::unreachable(BUS, reply))
    } else {
        Ok(reply)
    }
}

impl TelemetryClient for EbusdTcpClient {
    async fn fetch_reading(&self) -> Result<BoilerReading, ClientError> {
        let fields = &self.read.fields;
        let mut lines = vec![
            self.read.line(&fields.flow_temp),
            self.read.line(&fields.return_temp),
            self.read.line(&fields.burner),
        ];
        if let Some(error_code) = &fields.error_code {
            lines.push(self.read.line(error_code));
        }

        let replies = self.exchange(&lines).await?;
        let observed_at = Utc::now();

        let flow_temp = parse_number(check_value(&replies[0])?)?;
        let return_temp = parse_number(check_value(&replies[1])?)?;
        let burner_active = parse_flag(check_value(&replies[2])?)?;
        let error_code = match replies.get(3) {
            Some(reply) if reply.starts_with("ERR:") => {
                debug!(reply = %reply, "error code not readable, assuming none");
                None
            }
            Some(reply) => parse_error_code(reply)?,
            None => None,
        };

        Ok(BoilerReading {
            flow_temp,
            return_temp,
            burner_active,
            error_code,
            observed_at,
        })
    }
}

impl CommandClient for EbusdTcpClient {
    async fn send_command(&self, command: &Command) -> Result<SendReport, ClientError> {
        let (frame, applied) = self.writer.prepare(command);
        let encoded = frame.encode();
        let line = format!("write -c {} {} {}", self.read.circuit, self.message, encoded);

        let replies = self.exchange(std::slice::from_ref(&line)).await?;
        let reply = replies.first().map(String::as_str).unwrap_or_default();

        if reply.eq_ignore_ascii_case("done") {
            self.writer.commit(frame);
            return Ok(SendReport {
                requested: command.kind,
                applied,
                acknowledged: true,
            });
        }
        if reply.starts_with("ERR:") {
            return Err(match classify_error(reply) {
                ClientError::Rejected { dependency, reason } => ClientError::Rejected {
                    dependency,
                    reason: format!("{reason} (frame {encoded})"),
                },
                other => other,
            });
        }
        Err(ClientError::parse(BUS, reply, "unexpected write reply"))
    }
}
