use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::{
    backoff::BackoffState,
    cache::{Cached, StateCache},
    config::ControlConfig,
    error::ClientError,
    policy::{ControlPolicy, Decision, NoOpReason},
    types::{
        BoilerReading, BoilerSettings, Command, CommandKind, CommandedState, ControlState, ControllerStatus,
        Dependency, DependencyStatus, DesiredState, SendReport, Source, StateReport,
    },
};

/// Why a cycle refused to command the boiler.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldReason {
    pub source: Source,
    /// Age of the last good value; `None` if the source never answered.
    pub age: Option<Duration>,
    pub last_value: Option<String>,
}

impl std::fmt::Display for HoldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.age, &self.last_value) {
            (Some(age), Some(last)) => write!(
                f,
                "{} stale for {}s (last good: {last})",
                self.source.as_str(),
                age.num_seconds()
            ),
            _ => write!(f, "{} has never answered", self.source.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Hold(Vec<HoldReason>),
    Ready {
        reading: BoilerReading,
        desired: DesiredState,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActPlan {
    Send {
        command: Command,
        refresh: bool,
    },
    NoOp(NoOpReason),
    /// The bus daemon is backing off; try again once it is ready.
    Deferred {
        kind: CommandKind,
        until: DateTime<Utc>,
    },
    /// Same command as the last rejected one, desired state unchanged.
    Suppressed {
        kind: CommandKind,
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Rejection {
    kind: CommandKind,
    desired: DesiredState,
    at: DateTime<Utc>,
    reason: String,
}

/// Long-lived control state: cache, backoff counters, what the boiler was
/// told and what it refused. Owned by exactly one control loop.
#[derive(Debug, Clone)]
pub struct ControlEngine {
    pub config: ControlConfig,
    policy: ControlPolicy,
    cache: StateCache,
    bus: BackoffState,
    hub: BackoffState,
    jitter_seed: u64,
    commanded: CommandedState,
    rejection: Option<Rejection>,
    state: ControlState,
    hold_reasons: Vec<HoldReason>,
    cycles: u64,
}

impl ControlEngine {
    pub fn new(config: ControlConfig, jitter_seed: u64) -> Self {
        Self {
            policy: ControlPolicy::from_config(&config),
            config,
            cache: StateCache::new(),
            bus: BackoffState::default(),
            hub: BackoffState::default(),
            jitter_seed,
            commanded: CommandedState::default(),
            rejection: None,
            state: ControlState::Starting,
            hold_reasons: Vec::new(),
            cycles: 0,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn commanded(&self) -> &CommandedState {
        &self.commanded
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn consecutive_failures(&self, dependency: Dependency) -> u32 {
        self.backoff(dependency).failures()
    }

    pub fn begin_cycle(&mut self) -> u64 {
        self.cycles = self.cycles.saturating_add(1);
        self.cycles
    }

    /// False while `dependency` is backing off.
    pub fn should_fetch(&self, dependency: Dependency, now: DateTime<Utc>) -> bool {
        self.backoff(dependency).ready(now)
    }

    pub fn record_reading(&mut self, result: Result<BoilerReading, ClientError>, now: DateTime<Utc>) {
        match result {
            Ok(reading) => {
                if let Some(code) = reading.error_code {
                    warn!(
                        error_code = code,
                        flow_temp = reading.flow_temp,
                        "boiler reports an error code"
                    );
                }
                let observed_at = reading.observed_at;
                if !self.cache.put(reading, observed_at) {
                    debug!(%observed_at, "dropping reading older than the cached one");
                }
                self.record_success(Dependency::BusDaemon);
            }
            Err(err) => self.record_fetch_failure::<BoilerReading>(err, now),
        }
    }

    pub fn record_desired(&mut self, result: Result<DesiredState, ClientError>, now: DateTime<Utc>) {
        match result {
            Ok(desired) => {
                let requested_at = desired.requested_at;
                if !self.cache.put(desired, requested_at) {
                    debug!(%requested_at, "dropping desired state older than the cached one");
                }
                self.record_success(Dependency::Hub);
            }
            Err(err) => self.record_fetch_failure::<DesiredState>(err, now),
        }
    }

    /// Resolves both inputs against the staleness threshold. Anything
    /// unknown puts the engine in hold.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Evaluation {
        let threshold = self.config.staleness();
        let reading = self.cache.fresh::<BoilerReading>(now, threshold).cloned();
        let desired = self.cache.fresh::<DesiredState>(now, threshold).cloned();

        match (reading, desired) {
            (Some(reading), Some(desired)) => {
                if self.state == ControlState::Hold {
                    info!("inputs fresh again, leaving hold");
                }
                self.hold_reasons.clear();
                Evaluation::Ready { reading, desired }
            }
            (reading, desired) => {
                let mut reasons = Vec::new();
                if reading.is_none() {
                    reasons.push(self.hold_reason::<BoilerReading>(now, |r| {
                        format!("flow {:.1}°C", r.flow_temp)
                    }));
                }
                if desired.is_none() {
                    reasons.push(self.hold_reason::<DesiredState>(now, |d| {
                        format!("target {:.1}°C, enabled {}", d.target_temp, d.enabled)
                    }));
                }
                for reason in &reasons {
                    warn!(
                        source = reason.source.as_str(),
                        threshold_secs = threshold.num_seconds(),
                        "holding, no command issued: {reason}"
                    );
                }
                self.state = ControlState::Hold;
                self.hold_reasons = reasons.clone();
                Evaluation::Hold(reasons)
            }
        }
    }

    /// Decides what to send this cycle given fresh inputs.
    pub fn plan(
        &mut self,
        reading: &BoilerReading,
        desired: &DesiredState,
        now: DateTime<Utc>,
    ) -> ActPlan {
        self.state = if desired.enabled {
            ControlState::Active
        } else {
            ControlState::Off
        };

        let decision = self.policy.decide(reading, desired, &self.commanded, now);
        let (kind, refresh) = match decision {
            Decision::NoOp(reason) => {
                debug!(?reason, flow_temp = reading.flow_temp, target = desired.target_temp, "no command needed");
                return ActPlan::NoOp(reason);
            }
            Decision::Issue(kind) => (kind, false),
            Decision::Refresh(kind) => (kind, true),
        };

        if let Some(rejection) = &self.rejection {
            let until = rejection.at + self.config.reject_backoff();
            if rejection.kind.same_as(&kind) && rejection.desired.same_request(desired) && now < until {
                debug!(
                    command = %kind,
                    reason = %rejection.reason,
                    "not resubmitting rejected command until {until}"
                );
                return ActPlan::Suppressed { kind, until };
            }
        }

        if !self.bus.ready(now) {
            let until = self.bus.next_attempt_at().unwrap_or(now);
            debug!(command = %kind, "bus daemon backing off until {until}, command deferred");
            return ActPlan::Deferred { kind, until };
        }

        ActPlan::Send {
            command: Command::new(kind, now).with_settings(desired.settings),
            refresh,
        }
    }

    pub fn record_send(
        &mut self,
        command: &Command,
        desired: &DesiredState,
        result: &Result<SendReport, ClientError>,
        now: DateTime<Utc>,
    ) {
        match result {
            Ok(report) if report.acknowledged => {
                if report.was_clamped() {
                    warn!(
                        intent = %report.requested,
                        applied = %report.applied,
                        "command clamped to safe bounds"
                    );
                }
                info!(command = %report.applied, "boiler command acknowledged");
                self.apply_acknowledged(report, command.settings, now);
                self.rejection = None;
                self.record_success(Dependency::BusDaemon);
            }
            Ok(report) => {
                self.record_rejection(command, desired, "command not acknowledged".to_string(), now);
                debug!(applied = %report.applied, "daemon did not acknowledge command");
                self.record_success(Dependency::BusDaemon);
            }
            Err(err) if err.is_rejection() => {
                self.record_rejection(command, desired, err.to_string(), now);
                self.record_success(Dependency::BusDaemon);
            }
            Err(err) => {
                let delay = self.bus.record_failure(now, &self.config.backoff, self.jitter_seed);
                warn!(
                    command = %command.kind,
                    consecutive_failures = self.bus.failures(),
                    retry_in_secs = delay.num_seconds(),
                    "command send failed: {err}"
                );
            }
        }
    }

    /// What the hub should show. Stale inputs are left out.
    pub fn state_report(&self, now: DateTime<Utc>) -> StateReport {
        let threshold = self.config.staleness();
        StateReport {
            reading: self.cache.fresh::<BoilerReading>(now, threshold).cloned(),
            state: self.state,
            target_temp: self
                .cache
                .fresh::<DesiredState>(now, threshold)
                .map(|desired| desired.target_temp),
            commanded_setpoint: self.commanded.applied_setpoint,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> ControllerStatus {
        let reading = self.cache.get::<BoilerReading>();
        let desired = self.cache.get::<DesiredState>();

        ControllerStatus {
            state: self.state.as_str(),
            cycles: self.cycles,
            reading: reading.map(|cached| cached.value.clone()),
            reading_age_secs: reading.map(|cached| cached.age(now).num_seconds()),
            desired: desired.map(|cached| cached.value.clone()),
            desired_age_secs: desired.map(|cached| cached.age(now).num_seconds()),
            commanded: self.commanded,
            bus_daemon: dependency_status(&self.bus),
            hub: dependency_status(&self.hub),
            hold_reasons: self.hold_reasons.iter().map(ToString::to_string).collect(),
            last_rejection: self
                .rejection
                .as_ref()
                .map(|rejection| format!("{}: {}", rejection.kind, rejection.reason)),
        }
    }

    fn backoff(&self, dependency: Dependency) -> &BackoffState {
        match dependency {
            Dependency::BusDaemon => &self.bus,
            Dependency::Hub => &self.hub,
        }
    }

    fn backoff_mut(&mut self, dependency: Dependency) -> &mut BackoffState {
        match dependency {
            Dependency::BusDaemon => &mut self.bus,
            Dependency::Hub => &mut self.hub,
        }
    }

    fn record_success(&mut self, dependency: Dependency) {
        let cleared = self.backoff_mut(dependency).record_success();
        if cleared > 0 {
            info!(
                dependency = dependency.as_str(),
                "recovered after {cleared} consecutive failures"
            );
        }
    }

    fn record_fetch_failure<T: Cached>(&mut self, err: ClientError, now: DateTime<Utc>) {
        let dependency = Dependency::for_source(T::SOURCE);
        let config = self.config.backoff.clone();
        let seed = self.jitter_seed;
        let backoff = self.backoff_mut(dependency);
        let delay = backoff.record_failure(now, &config, seed);
        let failures = backoff.failures();
        let stale_secs = self
            .cache
            .get::<T>()
            .map(|cached| cached.age(now).num_seconds());

        warn!(
            source = T::SOURCE.as_str(),
            consecutive_failures = failures,
            retry_in_secs = delay.num_seconds(),
            stale_secs,
            "fetch failed: {err}"
        );
    }

    fn hold_reason<T: Cached>(
        &self,
        now: DateTime<Utc>,
        describe: impl Fn(&T) -> String,
    ) -> HoldReason {
        let cached = self.cache.get::<T>();
        HoldReason {
            source: T::SOURCE,
            age: cached.map(|cached| cached.age(now)),
            last_value: cached.map(|cached| describe(&cached.value)),
        }
    }

    fn record_rejection(
        &mut self,
        command: &Command,
        desired: &DesiredState,
        reason: String,
        now: DateTime<Utc>,
    ) {
        warn!(
            command = %command.kind,
            retry_after_secs = self.config.reject_backoff_secs,
            "boiler command rejected, holding previous command state: {reason}"
        );
        self.rejection = Some(Rejection {
            kind: command.kind,
            desired: desired.clone(),
            at: now,
            reason,
        });
    }

    fn apply_acknowledged(&mut self, report: &SendReport, settings: BoilerSettings, now: DateTime<Utc>) {
        match (report.requested, report.applied) {
            (CommandKind::SetMode(on), _) => {
                self.commanded.mode = Some(on);
                if !on {
                    self.commanded.requested_setpoint = None;
                    self.commanded.applied_setpoint = None;
                }
            }
            (CommandKind::SetTemperature(requested), applied) => {
                self.commanded.mode = Some(true);
                self.commanded.requested_setpoint = Some(requested);
                self.commanded.applied_setpoint = match applied {
                    CommandKind::SetTemperature(value) => Some(value),
                    CommandKind::SetMode(_) => Some(requested),
                };
            }
        }
        self.commanded.settings = Some(settings);
        self.commanded.last_ack_at = Some(now);
    }
}

fn dependency_status(backoff: &BackoffState) -> DependencyStatus {
    DependencyStatus {
        consecutive_failures: backoff.failures(),
        next_attempt_at: backoff.next_attempt_at(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::BackoffConfig;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn config() -> ControlConfig {
        ControlConfig {
            interval_secs: 10,
            staleness_secs: 25,
            deadband: 2.0,
            hysteresis: 0.5,
            reject_backoff_secs: 300,
            refresh_interval_secs: None,
            backoff: BackoffConfig {
                base_secs: 5,
                max_secs: 60,
                jitter: 0.0,
            },
            ..ControlConfig::default()
        }
    }

    fn reading(flow: f32, at: DateTime<Utc>) -> BoilerReading {
        BoilerReading {
            flow_temp: flow,
            return_temp: flow - 5.0,
            burner_active: true,
            error_code: None,
            observed_at: at,
        }
    }

    fn desired(target: f32, enabled: bool, at: DateTime<Utc>) -> DesiredState {
        DesiredState {
            target_temp: target,
            enabled,
            settings: BoilerSettings::default(),
            requested_at: at,
        }
    }

    fn unreachable() -> ClientError {
        ClientError::unreachable(Dependency::BusDaemon, "connection refused")
    }

    fn ack(kind: CommandKind) -> Result<SendReport, ClientError> {
        Ok(SendReport {
            requested: kind,
            applied: kind,
            acknowledged: true,
        })
    }

    #[test]
    fn holds_until_both_sources_answer() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.record_reading(Ok(reading(40.0, t(0))), t(0));

        let Evaluation::Hold(reasons) = engine.evaluate(t(0)) else {
            panic!("expected hold");
        };
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].source, Source::Hub);
        assert_eq!(reasons[0].age, None);
        assert_eq!(engine.state(), ControlState::Hold);
    }

    #[test]
    fn stale_reading_holds_with_last_good_value() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.record_reading(Ok(reading(41.0, t(0))), t(0));
        engine.record_desired(Ok(desired(45.0, true, t(30))), t(30));

        let Evaluation::Hold(reasons) = engine.evaluate(t(30)) else {
            panic!("expected hold");
        };
        assert_eq!(reasons[0].source, Source::Telemetry);
        assert_eq!(reasons[0].age, Some(Duration::seconds(30)));
        assert_eq!(reasons[0].last_value.as_deref(), Some("flow 41.0°C"));

        let report = engine.state_report(t(30));
        assert_eq!(report.state, ControlState::Hold);
        assert_eq!(report.reading, None);
        assert_eq!(report.target_temp, Some(45.0));
    }

    #[test]
    fn fetch_failure_backs_off_only_that_dependency() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.record_reading(Err(unreachable()), t(0));

        assert!(!engine.should_fetch(Dependency::BusDaemon, t(4)));
        assert!(engine.should_fetch(Dependency::BusDaemon, t(5)));
        assert!(engine.should_fetch(Dependency::Hub, t(0)));

        engine.record_reading(Err(unreachable()), t(5));
        assert_eq!(engine.consecutive_failures(Dependency::BusDaemon), 2);
        assert!(!engine.should_fetch(Dependency::BusDaemon, t(14)));

        engine.record_reading(Ok(reading(40.0, t(15))), t(15));
        assert_eq!(engine.consecutive_failures(Dependency::BusDaemon), 0);
    }

    #[test]
    fn parse_failure_counts_as_unreachable() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.record_desired(
            Err(ClientError::parse(Dependency::Hub, "unavailable", "not a number")),
            t(0),
        );
        assert_eq!(engine.consecutive_failures(Dependency::Hub), 1);
        assert!(engine.cache().get::<DesiredState>().is_none());
    }

    #[test]
    fn rejected_command_is_suppressed_until_desired_changes() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.commanded.mode = Some(true);
        let wanted = desired(95.0, true, t(0));
        let current = reading(40.0, t(0));

        let ActPlan::Send { command, .. } = engine.plan(&current, &wanted, t(0)) else {
            panic!("expected send");
        };
        let rejected = Err(ClientError::rejected(Dependency::BusDaemon, "out of range"));
        engine.record_send(&command, &wanted, &rejected, t(0));

        assert!(matches!(
            engine.plan(&current, &wanted, t(10)),
            ActPlan::Suppressed { .. }
        ));
        assert_eq!(engine.commanded().requested_setpoint, None);

        let changed = desired(60.0, true, t(20));
        assert!(matches!(
            engine.plan(&current, &changed, t(20)),
            ActPlan::Send { .. }
        ));

        assert!(matches!(
            engine.plan(&current, &wanted, t(300)),
            ActPlan::Send { .. }
        ));
    }

    #[test]
    fn unreachable_send_defers_following_commands() {
        let mut engine = ControlEngine::new(config(), 0);
        let wanted = desired(45.0, true, t(0));
        let current = reading(40.0, t(0));

        let ActPlan::Send { command, .. } = engine.plan(&current, &wanted, t(0)) else {
            panic!("expected send");
        };
        engine.record_send(&command, &wanted, &Err(unreachable()), t(0));
        assert_eq!(engine.consecutive_failures(Dependency::BusDaemon), 1);
        assert_eq!(engine.commanded().mode, None);

        assert!(matches!(
            engine.plan(&current, &wanted, t(2)),
            ActPlan::Deferred { .. }
        ));
        assert!(matches!(
            engine.plan(&current, &wanted, t(5)),
            ActPlan::Send { .. }
        ));
    }

    #[test]
    fn acknowledged_setpoint_is_remembered_with_clamp() {
        let mut engine = ControlEngine::new(config(), 0);
        let wanted = desired(95.0, true, t(0));
        let command = Command::new(CommandKind::SetTemperature(95.0), t(0));
        let report = Ok(SendReport {
            requested: CommandKind::SetTemperature(95.0),
            applied: CommandKind::SetTemperature(85.0),
            acknowledged: true,
        });
        engine.record_send(&command, &wanted, &report, t(0));

        assert_eq!(
            *engine.commanded(),
            CommandedState {
                mode: Some(true),
                requested_setpoint: Some(95.0),
                applied_setpoint: Some(85.0),
                settings: Some(BoilerSettings::default()),
                last_ack_at: Some(t(0)),
            }
        );
        assert_eq!(
            engine.plan(&reading(40.0, t(10)), &wanted, t(10)),
            ActPlan::NoOp(NoOpReason::Unchanged)
        );
    }

    #[test]
    fn mode_off_clears_setpoint() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.commanded = CommandedState {
            mode: Some(true),
            requested_setpoint: Some(50.0),
            applied_setpoint: Some(50.0),
            settings: Some(BoilerSettings::default()),
            last_ack_at: Some(t(0)),
        };
        let wanted = desired(50.0, false, t(10));
        let command = Command::new(CommandKind::SetMode(false), t(10));
        engine.record_send(&command, &wanted, &ack(CommandKind::SetMode(false)), t(10));

        assert_eq!(engine.commanded().mode, Some(false));
        assert_eq!(engine.commanded().applied_setpoint, None);
    }

    #[test]
    fn planned_command_carries_hub_settings() {
        let mut engine = ControlEngine::new(config(), 0);
        let mut wanted = desired(45.0, false, t(0));
        wanted.settings = BoilerSettings {
            hot_water_temp: Some(55.0),
            disable_heating: Some(true),
            disable_hot_water_load: None,
        };

        let ActPlan::Send { command, .. } = engine.plan(&reading(40.0, t(0)), &wanted, t(0)) else {
            panic!("expected send");
        };
        assert_eq!(command.settings, wanted.settings);

        engine.record_send(&command, &wanted, &ack(command.kind), t(0));
        assert_eq!(engine.commanded().settings, Some(wanted.settings));
    }

    #[test]
    fn late_reading_does_not_replace_newer_one() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.record_reading(Ok(reading(44.0, t(20))), t(20));
        engine.record_reading(Ok(reading(39.0, t(12))), t(22));

        let cached = engine.cache().get::<BoilerReading>().unwrap();
        assert_eq!(cached.value.flow_temp, 44.0);
        assert_eq!(cached.last_updated, t(20));
    }

    #[test]
    fn status_reports_counters_and_hold_reasons() {
        let mut engine = ControlEngine::new(config(), 0);
        engine.begin_cycle();
        engine.record_reading(Err(unreachable()), t(0));
        let _ = engine.evaluate(t(0));

        let status = engine.status(t(0));
        assert_eq!(status.state, "HOLD");
        assert_eq!(status.cycles, 1);
        assert_eq!(status.bus_daemon.consecutive_failures, 1);
        assert_eq!(status.hold_reasons.len(), 2);
    }
}
