use anyhow::{Context, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ubms_lib::mode::ModeController;

/// Sub topic accepting mode change requests.
pub const MODE_SET_TOPIC: &str = "Mode/set";

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
    /// Requests buffered while the broker is slow or unreachable, newer ones are dropped.
    #[serde(default = "MqttConfig::default_request_queue")]
    request_queue: usize,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "ubms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distr::Alphanumeric;
        use rand::Rng;

        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("ubms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_request_queue() -> usize {
        1024
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn mode_set_topic(&self) -> String {
        format!("{}/{MODE_SET_TOPIC}", self.topic)
    }

    pub fn create_client(&self) -> (Client, Connection) {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }

        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            self.host,
            self.port,
            self.client_id
        );
        Client::new(options, self.request_queue.max(1))
    }
}

/// Parses a mode change payload, surrounding whitespace is ignored.
pub fn parse_mode_request(payload: &[u8]) -> Option<u8> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

pub fn handle_mode_request(controller: &ModeController, payload: &[u8]) {
    let Some(value) = parse_mode_request(payload) else {
        log::warn!("Ignoring mode request {:?}", String::from_utf8_lossy(payload));
        return;
    };
    match controller.request_mode(value) {
        Ok(mode) => log::info!("Mode set to {mode} via MQTT"),
        Err(e) => log::error!("Mode request {value} rejected: {e}"),
    }
}

pub struct MqttPublisher {
    client: Arc<Mutex<Client>>,
    config: MqttConfig,
}

fn lock(client: &Mutex<Client>) -> MutexGuard<'_, Client> {
    client.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MqttPublisher {
    /// Connects in the background and hands payloads on `<topic>/Mode/set` to `on_mode_request`.
    pub fn new<F>(config: MqttConfig, on_mode_request: F) -> Result<Self>
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        let (client, mut connection) = config.create_client();
        let client = Arc::new(Mutex::new(client));
        let subscriber = Arc::clone(&client);
        let mode_topic = config.mode_set_topic();
        let reconnect_interval = config.reconnect_interval;
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to MQTT broker.");
                            // Clean sessions drop subscriptions on every reconnect
                            if let Err(e) =
                                lock(&subscriber).try_subscribe(&mode_topic, QoS::AtLeastOnce)
                            {
                                log::error!("Failed to subscribe to {mode_topic}: {e}");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish)))
                            if publish.topic == mode_topic =>
                        {
                            on_mode_request(&publish.payload);
                        }
                        Ok(event) => log::trace!("MQTT event: {event:?}"),
                        Err(e) => {
                            log::warn!("MQTT connection error: {e}");
                            std::thread::sleep(reconnect_interval);
                        }
                    }
                }
                log::debug!("MQTT event loop finished");
            })
            .with_context(|| "Cannot start MQTT event loop")?;
        Ok(Self { client, config })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Queues a message without waiting, fails when the request queue is full.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={}",
            topic,
            self.config.qos
        );

        lock(&self.client)
            .try_publish(topic, self.config.qos(), false, payload)
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }

    pub fn disconnect(&self) {
        if let Err(e) = lock(&self.client).try_disconnect() {
            log::debug!("MQTT disconnect failed: {e}");
        }
    }
}
