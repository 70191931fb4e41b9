pub mod backoff;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod policy;
pub mod ports;
pub mod types;

pub use backoff::{backoff_delay, next_attempt_at, BackoffState};
pub use cache::{CachedValue, StateCache};
pub use config::{ControlConfig, EbusdTransport, RuntimeConfig, TargetSource};
pub use engine::{ActPlan, ControlEngine, Evaluation, HoldReason};
pub use error::{ClientError, ConfigError};
pub use policy::{heating_curve, ControlPolicy, Decision, NoOpReason};
pub use ports::{Clock, CommandClient, HubClient, SystemClock, TelemetryClient};
pub use types::{
    BoilerReading, BoilerSettings, Command, CommandKind, CommandedState, ControlState,
    ControllerStatus, Dependency, DesiredState, SendReport, Source, StateReport,
};
