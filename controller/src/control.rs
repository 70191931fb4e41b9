//! The cycle driver: acquire, evaluate, act, report.

use std::{future::Future, time::Duration};

use heatai_common::{
    ActPlan, ClientError, Clock, CommandClient, CommandKind, ControlEngine, ControllerStatus,
    Dependency, Evaluation, HubClient, NoOpReason, SendReport, TelemetryClient,
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Fetched,
    Failed(ClientError),
    /// Source still backing off; not contacted this cycle.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActOutcome {
    Held,
    NoOp(NoOpReason),
    Sent(SendReport),
    Rejected(ClientError),
    Failed(ClientError),
    Deferred(CommandKind),
    Suppressed(CommandKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Published,
    Degraded(ClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub telemetry: AcquireOutcome,
    pub hub: AcquireOutcome,
    pub act: ActOutcome,
    pub report: ReportOutcome,
}

impl CycleReport {
    /// Command handed to the command client this cycle, if any.
    pub fn sent(&self) -> Option<CommandKind> {
        match &self.act {
            ActOutcome::Sent(report) => Some(report.requested),
            _ => None,
        }
    }

    pub fn held(&self) -> bool {
        self.act == ActOutcome::Held
    }
}

fn acquired<T>(result: &Option<Result<T, ClientError>>) -> AcquireOutcome {
    match result {
        Some(Ok(_)) => AcquireOutcome::Fetched,
        Some(Err(err)) => AcquireOutcome::Failed(err.clone()),
        None => AcquireOutcome::Skipped,
    }
}

pub struct ControlLoop<T, C, H, K> {
    engine: ControlEngine,
    telemetry: T,
    commands: C,
    hub: H,
    clock: K,
    status: Option<watch::Sender<ControllerStatus>>,
}

impl<T, C, H, K> ControlLoop<T, C, H, K>
where
    T: TelemetryClient,
    C: CommandClient,
    H: HubClient,
    K: Clock,
{
    pub fn new(engine: ControlEngine, telemetry: T, commands: C, hub: H, clock: K) -> Self {
        Self {
            engine,
            telemetry,
            commands,
            hub,
            clock,
            status: None,
        }
    }

    /// Publishes a status snapshot after every cycle.
    pub fn with_status(mut self, status: watch::Sender<ControllerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn engine(&self) -> &ControlEngine {
        &self.engine
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.engine.begin_cycle();
        let now = self.clock.now();

        let fetch_reading = self.engine.should_fetch(Dependency::BusDaemon, now);
        let fetch_desired = self.engine.should_fetch(Dependency::Hub, now);
        let telemetry = &self.telemetry;
        let hub = &self.hub;
        let (reading, desired) = tokio::join!(
            async move {
                if fetch_reading {
                    Some(telemetry.fetch_reading().await)
                } else {
                    None
                }
            },
            async move {
                if fetch_desired {
                    Some(hub.fetch_desired().await)
                } else {
                    None
                }
            },
        );

        let telemetry_outcome = acquired(&reading);
        let hub_outcome = acquired(&desired);
        if let Some(result) = reading {
            self.engine.record_reading(result, now);
        }
        if let Some(result) = desired {
            self.engine.record_desired(result, now);
        }

        let act = match self.engine.evaluate(now) {
            Evaluation::Hold(_) => ActOutcome::Held,
            Evaluation::Ready { reading, desired } => {
                match self.engine.plan(&reading, &desired, now) {
                    ActPlan::NoOp(reason) => ActOutcome::NoOp(reason),
                    ActPlan::Deferred { kind, .. } => ActOutcome::Deferred(kind),
                    ActPlan::Suppressed { kind, .. } => ActOutcome::Suppressed(kind),
                    ActPlan::Send { command, refresh } => {
                        if refresh {
                            debug!(command = %command.kind, "refreshing commanded state");
                        }
                        let result = self.commands.send_command(&command).await;
                        self.engine.record_send(&command, &desired, &result, now);
                        match result {
                            Ok(report) => ActOutcome::Sent(report),
                            Err(err) if err.is_rejection() => ActOutcome::Rejected(err),
                            Err(err) => ActOutcome::Failed(err),
                        }
                    }
                }
            }
        };

        let report = match self.hub.publish_state(&self.engine.state_report(now)).await {
            Ok(()) => ReportOutcome::Published,
            Err(err) => {
                warn!("state publish failed, report degraded: {err}");
                ReportOutcome::Degraded(err)
            }
        };

        if let Some(status) = &self.status {
            status.send_replace(self.engine.status(now));
        }

        let report = CycleReport {
            cycle,
            telemetry: telemetry_outcome,
            hub: hub_outcome,
            act,
            report,
        };
        debug!(
            cycle = report.cycle,
            state = self.engine.state().as_str(),
            telemetry = ?report.telemetry,
            hub = ?report.hub,
            held = report.held(),
            sent = ?report.sent(),
            act = ?report.act,
            report = ?report.report,
            "cycle finished"
        );
        report
    }

    /// Runs cycles on the configured interval until `shutdown` resolves.
    /// An in-flight cycle always completes. Returns the number of cycles run.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> u64 {
        let period = self
            .engine
            .config
            .interval()
            .to_std()
            .unwrap_or(Duration::from_secs(30));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "control loop started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            self.run_cycle().await;
        }

        let cycles = self.engine().cycles();
        info!(cycles, "control loop stopped");
        cycles
    }
}
