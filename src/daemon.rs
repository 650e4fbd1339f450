use anyhow::{Context, Result};
use dalybms_ble::{
    Aggregator, BleTransport, Command, DeviceAddress, Session, SessionConfig, TelemetrySnapshot,
};
use log::{error, info, warn};
use serde_json::json;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::{commandline, mqtt};

/// Collects `(topic, payload)` pairs for every leaf of `value`. Null values
/// are not published.
fn flatten_simple_format(topic: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_simple_format(&format!("{topic}/{k}"), v, out);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                flatten_simple_format(&format!("{topic}/{i}"), v, out);
            }
        }
        serde_json::Value::String(s) => out.push((topic.to_string(), s.clone())),
        serde_json::Value::Number(n) => out.push((topic.to_string(), n.to_string())),
        serde_json::Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
        serde_json::Value::Null => {}
    }
}

enum Output {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
    },
}

impl Output {
    fn new(output: &commandline::DaemonOutput) -> Result<Self> {
        Ok(match output {
            commandline::DaemonOutput::Console => Output::Console,
            commandline::DaemonOutput::Mqtt {
                config_file,
                format,
            } => {
                let config = mqtt::MqttConfig::load(config_file).with_context(|| {
                    format!("Failed to open MQTT config file at '{config_file}'")
                })?;
                info!("Successfully loaded MQTT config from {config_file}: {config:?}");
                let publisher = mqtt::MqttPublisher::new(config)
                    .with_context(|| "Failed to create MQTT publisher")?;
                Output::Mqtt {
                    publisher,
                    format: format.clone(),
                }
            }
        })
    }

    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let value = serde_json::to_value(snapshot)?;
        match self {
            Output::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Output::Mqtt {
                publisher,
                format: commandline::MqttFormat::Json,
            } => {
                let mut data_to_publish = serde_json::Map::new();
                data_to_publish.insert(
                    "timestamp".to_string(),
                    json!(chrono::Utc::now().to_rfc3339()),
                );
                if let serde_json::Value::Object(fields) = value {
                    data_to_publish.extend(fields);
                }
                let json_payload = serde_json::to_string(&data_to_publish)?;
                let topic = format!("{}/{}", publisher.topic(), snapshot.device);
                publisher.publish(&topic, &json_payload).await?;
                info!("Published {} to MQTT.", snapshot.device);
            }
            Output::Mqtt {
                publisher,
                format: commandline::MqttFormat::Simple,
            } => {
                let mut messages = Vec::new();
                let root_topic = format!("{}/{}", publisher.topic(), snapshot.device);
                flatten_simple_format(&root_topic, &value, &mut messages);
                for (topic, payload) in messages {
                    if let Err(e) = publisher.publish(&topic, &payload).await {
                        error!("Failed to publish message to topic {topic}: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(self) {
        if let Output::Mqtt { publisher, .. } = self {
            publisher.disconnect().await;
        }
    }
}

/// Polls every device in its own session until Ctrl-C, publishing each
/// snapshot as it arrives.
pub async fn run(
    devices: Vec<DeviceAddress>,
    output: commandline::DaemonOutput,
    interval: Duration,
    commands: Vec<Command>,
    session_config: impl Fn(DeviceAddress, Vec<Command>) -> SessionConfig,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, devices={devices:?}, metrics={commands:?}"
    );
    let output = Output::new(&output)?;

    let (stop, shutdown) = watch::channel(false);
    let (sender, mut snapshots) = mpsc::channel::<TelemetrySnapshot>(16);

    let mut sessions = Vec::new();
    for device in devices {
        let config = SessionConfig {
            poll_interval: interval,
            ..session_config(device, commands.clone())
        };
        let mut session = Session::new(BleTransport::new(), config)
            .with_context(|| format!("Invalid session settings for {device}"))?;
        let sender = sender.clone();
        let mut shutdown = shutdown.clone();
        sessions.push(tokio::spawn(async move {
            let mut aggregator = Aggregator::new();
            session.run(&mut aggregator, &sender, &mut shutdown).await;
            info!("Session {device} finished: {:?}", session.statistics());
        }));
    }
    // the channel closes once every session has finished
    drop(sender);

    let mut ctrl_c = pin!(tokio::signal::ctrl_c());
    let mut stopping = false;
    loop {
        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => {
                    if let Err(e) = output.publish(&snapshot).await {
                        error!("Failed to publish data of {}: {e}", snapshot.device);
                    }
                }
                None => break,
            },
            result = &mut ctrl_c, if !stopping => {
                if let Err(e) = result {
                    warn!("Cannot listen for Ctrl-C: {e}");
                }
                info!("Shutting down, closing all sessions");
                stopping = true;
                let _ = stop.send(true);
            }
        }
    }

    for session in sessions {
        if let Err(e) = session.await {
            error!("Session task failed: {e}");
        }
    }
    output.close().await;
    Ok(())
}
