use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    /// Keep the last value on the broker for late subscribers.
    #[serde(default)]
    retain: bool,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "dalybms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("dalybms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.quality_of_service()?;
        if config.keep_alive_interval < Duration::from_secs(1) {
            bail!(
                "MQTT keep alive interval {:?} is shorter than one second",
                config.keep_alive_interval
            );
        }
        Ok(config)
    }

    fn quality_of_service(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            qos => bail!("Invalid MQTT QoS {qos}, expected 0, 1 or 2"),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval);
        // Typically true for telemetry publishers
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttConfig,
    qos: QoS,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Creates the client and drives its connection in a background task.
    /// The event loop keeps reconnecting on its own.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.quality_of_service()?;
        log::info!(
            "Attempting to connect to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut event_loop) = AsyncClient::new(config.options(), 64);
        let reconnect_interval = config.reconnect_interval;
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("Connected to MQTT broker.")
                    }
                    Ok(event) => log::trace!("MQTT event: {event:?}"),
                    Err(err) => {
                        log::warn!(
                            "MQTT connection error: {err}, retrying in {reconnect_interval:?}"
                        );
                        tokio::time::sleep(reconnect_interval).await;
                    }
                }
            }
        });
        Ok(Self {
            client,
            config,
            qos,
            event_loop,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}, retain={}",
            topic,
            self.qos,
            self.config.retain
        );

        self.client
            .publish(topic, self.qos, self.config.retain, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }

    pub async fn disconnect(self) {
        if let Err(err) = self.client.disconnect().await {
            log::warn!("MQTT disconnect failed: {err}");
        }
        self.event_loop.abort();
    }
}
