use std::future::Future;

use anyhow::Context;
use chrono::Utc;
use heatai_common::{ControlEngine, EbusdTransport, RuntimeConfig, SystemClock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config,
    control::ControlLoop,
    ebusd::EbusdTcpClient,
    hub::HomeAssistantClient,
    mqtt::{self, FieldTopics, MqttCommandClient, MqttTelemetry, TopicBuffer},
    status,
};

pub async fn run() -> anyhow::Result<()> {
    let runtime = config::load().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&runtime.logging.filter)),
        )
        .init();

    info!(
        transport = ?runtime.ebusd.transport,
        hub = %runtime.hub.url,
        interval_secs = runtime.control.interval_secs,
        staleness_secs = runtime.control.staleness_secs,
        "heatai starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let engine = ControlEngine::new(runtime.control.clone(), jitter_seed());
    let (status_tx, status_rx) = watch::channel(engine.status(Utc::now()));

    let server = runtime.status.bind.clone().map(|bind| {
        let stop = stopped(stop_rx.clone());
        tokio::spawn(async move {
            if let Err(err) = status::serve(&bind, status_rx, stop).await {
                warn!("status endpoint stopped: {err:#}");
            }
        })
    });

    let hub = HomeAssistantClient::new(&runtime.hub, runtime.control.limits)
        .context("failed to build Home Assistant client")?;

    let cycles = match runtime.ebusd.transport {
        EbusdTransport::Tcp => {
            let client = EbusdTcpClient::new(&runtime.ebusd, runtime.control.limits);
            info!(
                "using ebusd at {}:{}",
                runtime.ebusd.host, runtime.ebusd.port
            );
            ControlLoop::new(engine, client.clone(), client, hub, SystemClock)
                .with_status(status_tx)
                .run(stopped(stop_rx))
                .await
        }
        EbusdTransport::Mqtt => run_over_mqtt(&runtime, engine, hub, status_tx, stop_rx).await,
    };

    if let Some(server) = server {
        if let Err(err) = server.await {
            warn!("status endpoint task failed: {err}");
        }
    }

    info!(cycles, "heatai stopped");
    Ok(())
}

async fn run_over_mqtt(
    runtime: &RuntimeConfig,
    engine: ControlEngine,
    hub: HomeAssistantClient,
    status_tx: watch::Sender<heatai_common::ControllerStatus>,
    stop_rx: watch::Receiver<bool>,
) -> u64 {
    let prefix = runtime.mqtt.topic_prefix.as_str();
    let (client, eventloop) = mqtt::connect(&runtime.mqtt);
    let buffer = TopicBuffer::default();
    let topics = FieldTopics::new(prefix, &runtime.ebusd);
    mqtt::spawn_mqtt_loop(
        client.clone(),
        eventloop,
        buffer.clone(),
        topics.all().into_iter().map(str::to_string).collect(),
    );
    info!(
        "using ebusd via mqtt broker {}:{} under {prefix}/{}",
        runtime.mqtt.host, runtime.mqtt.port, runtime.ebusd.circuit
    );

    let telemetry = MqttTelemetry::new(buffer, topics);
    let commands = MqttCommandClient::new(
        client.clone(),
        prefix,
        &runtime.ebusd,
        runtime.control.limits,
    );
    let cycles = ControlLoop::new(engine, telemetry, commands, hub, SystemClock)
        .with_status(status_tx)
        .run(stopped(stop_rx))
        .await;

    if let Err(err) = client.disconnect().await {
        debug!("mqtt disconnect: {err}");
    }
    cycles
}

/// Resolves once shutdown has been requested.
fn stopped(mut stop: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = stop.wait_for(|stopping| *stopping).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested, finishing current cycle");
}

fn jitter_seed() -> u64 {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    nanos ^ u64::from(std::process::id()).rotate_left(32)
}
