use anyhow::{Context, Result};
use canbms_lib::candump;
use canbms_lib::charger::Charger;
use canbms_lib::config::ChargerConfig;
use canbms_lib::decoder::FrameDecoder;
use canbms_lib::flags::FlagStore;
use canbms_lib::publisher::Publisher;
use canbms_lib::transport::RecordingTransport;
use log::{error, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::{commandline, mqtt};

/// Prints every published value with a timestamp.
struct ConsolePublisher;

impl ConsolePublisher {
    fn print(source: &str, key: &str, value: &str) {
        println!("{} {source}/{key}: {value}", chrono::Local::now().to_rfc3339());
    }
}

impl Publisher for ConsolePublisher {
    fn publish_numeric(&mut self, source: &str, key: &str, value: Option<f32>) {
        match value {
            Some(value) => Self::print(source, key, &format!("{value:.2}")),
            None => Self::print(source, key, "unknown"),
        }
    }

    fn publish_flag(&mut self, source: &str, key: &str, state: Option<bool>) {
        let state = match state {
            Some(true) => "ON",
            Some(false) => "OFF",
            None => "unknown",
        };
        Self::print(source, key, state);
    }

    fn publish_text(&mut self, source: &str, key: &str, text: Option<&str>) {
        Self::print(source, key, text.unwrap_or("unknown"));
    }

    fn publish_connectivity(&mut self, source: &str, state: bool) {
        Self::print(source, "connected", if state { "yes" } else { "no" });
    }
}

/// Publishes to MQTT, either one topic per value or one JSON document per
/// source and tick.
struct MqttPublisher {
    client: mqtt::MqttClient,
    format: commandline::MqttFormat,
    pending: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl MqttPublisher {
    fn new(config_file: &str, format: commandline::MqttFormat) -> Result<Self> {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let client =
            mqtt::MqttClient::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        Ok(Self {
            client,
            format,
            pending: BTreeMap::new(),
        })
    }

    fn publish_value(&mut self, source: &str, key: &str, value: serde_json::Value) {
        match self.format {
            commandline::MqttFormat::Simple => {
                let topic = format!("{}/{source}/{key}", self.client.topic());
                let payload = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => "unknown".to_string(),
                    other => other.to_string(),
                };
                if let Err(e) = self.client.publish(&topic, &payload) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            commandline::MqttFormat::Json => {
                self.pending
                    .entry(source.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
        }
    }

    /// Sends the JSON documents collected during the last tick.
    fn flush(&mut self) {
        for (source, mut values) in std::mem::take(&mut self.pending) {
            values.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            let topic = format!("{}/{source}", self.client.topic());
            match serde_json::to_string(&values) {
                Ok(json_payload) => {
                    if let Err(e) = self.client.publish(&topic, &json_payload) {
                        error!("Failed to publish data to MQTT: {e:?}");
                    }
                }
                Err(e) => error!("Failed to serialize data to JSON string: {e}"),
            }
        }
    }
}

impl Publisher for MqttPublisher {
    fn publish_numeric(&mut self, source: &str, key: &str, value: Option<f32>) {
        self.publish_value(source, key, json!(value));
    }

    fn publish_flag(&mut self, source: &str, key: &str, state: Option<bool>) {
        self.publish_value(source, key, json!(state));
    }

    fn publish_text(&mut self, source: &str, key: &str, text: Option<&str>) {
        self.publish_value(source, key, json!(text));
    }

    fn publish_connectivity(&mut self, source: &str, state: bool) {
        self.publish_value(source, "connected", json!(state));
    }
}

enum Output {
    Console(ConsolePublisher),
    Mqtt(MqttPublisher),
}

impl Output {
    fn new(output: &commandline::DaemonOutput) -> Result<Self> {
        Ok(match output {
            commandline::DaemonOutput::Console => Output::Console(ConsolePublisher),
            commandline::DaemonOutput::Mqtt {
                config_file,
                format,
            } => Output::Mqtt(MqttPublisher::new(config_file, format.clone())?),
        })
    }

    fn publisher(&mut self) -> &mut dyn Publisher {
        match self {
            Output::Console(publisher) => publisher,
            Output::Mqtt(publisher) => publisher,
        }
    }

    fn flush(&mut self) {
        if let Output::Mqtt(publisher) = self {
            publisher.flush();
        }
    }
}

fn load_config(config_file: &str) -> Result<ChargerConfig> {
    let config = ChargerConfig::load(config_file)
        .with_context(|| format!("Cannot load charger config from {config_file:?}"))?;
    info!("Successfully loaded charger config from {config_file}: {config:?}");
    Ok(config)
}

/// Decodes a single frame and prints what it carries.
pub fn decode(id: u16, payload: &str) -> Result<()> {
    let payload = candump::parse_payload(payload)?;
    let decoder = FrameDecoder::default();
    let Some(decoded) = decoder.decode(id, &payload) else {
        println!("0x{id:03X}: not a BMS frame");
        return Ok(());
    };
    for (key, value) in &decoded.values {
        println!("{key}: {value}");
    }
    for (key, text) in &decoded.texts {
        println!("{key}: {text:?}");
    }
    let mut flags = FlagStore::new(decoder.flags());
    flags.apply(&decoded.bits);
    for (flag, state) in flags.iter() {
        if let Some(state) = state {
            println!("{}: {state}", flag.key);
        }
    }
    Ok(())
}

/// Replays a `candump -L` log. Frames are routed to the battery whose
/// interface matches, a single battery takes every frame.
pub fn replay(config_file: &str, log_file: &str, output: commandline::DaemonOutput) -> Result<()> {
    let config = load_config(config_file)?;
    let file = std::fs::File::open(log_file)
        .with_context(|| format!("Cannot open candump log {log_file:?}"))?;
    let records = candump::read(std::io::BufReader::new(file))
        .with_context(|| format!("Cannot read candump log {log_file:?}"))?;
    info!("Replaying {} frames from {log_file}", records.len());

    let interfaces: Vec<Option<String>> =
        config.batteries.iter().map(|b| b.interface.clone()).collect();
    let single = interfaces.len() == 1;
    let mut output = Output::new(&output)?;
    let mut charger = Charger::new(config)?;
    let mut transport = RecordingTransport::default();

    let start = Instant::now();
    let origin = records.first().map(|r| r.timestamp).unwrap_or_default();
    let mut now = start;
    for record in &records {
        now = start + record.timestamp.saturating_sub(origin);
        while let Some(due) = charger.next_tick().filter(|&due| due <= now) {
            charger.tick(due, &mut transport, output.publisher());
            output.flush();
        }
        if charger.next_tick().is_none() {
            charger.tick(now, &mut transport, output.publisher());
            output.flush();
        }
        let battery = if single {
            Some(0)
        } else {
            interfaces
                .iter()
                .position(|i| i.as_deref() == Some(record.interface.as_str()))
        };
        match battery {
            Some(battery) => {
                charger.on_frame(battery, now, record.frame.id, &record.frame.data);
            }
            None => log::debug!("No battery on {}, skipping {:?}", record.interface, record.frame),
        }
    }
    charger.tick(now, &mut transport, output.publisher());
    output.flush();

    for (bus, frame) in &transport.sent {
        log::debug!("sent {bus}: {frame:?}");
    }
    info!(
        "Replay done, {} frames sent, connected = {}",
        transport.sent.len(),
        charger.is_connected()
    );
    Ok(())
}

/// Runs the charger on live SocketCAN interfaces until interrupted.
pub fn run(config_file: &str, interface: &str, output: commandline::DaemonOutput) -> Result<()> {
    use canbms_lib::can_socket::{spawn_reader, SocketCanTransport};
    use std::sync::mpsc::{self, RecvTimeoutError};

    let config = load_config(config_file)?;
    let interfaces = config
        .battery_interfaces(interface)
        .with_context(|| "Invalid CAN interface assignment")?;
    info!("Starting charger: inverter on {interface}, batteries on {interfaces:?}");

    let mut output = Output::new(&output)?;
    let mut transport = SocketCanTransport::open(interface, &interfaces)
        .with_context(|| "Cannot open CAN interfaces")?;
    let (tx, rx) = mpsc::channel();
    for (index, name) in interfaces.iter().enumerate() {
        spawn_reader(name, index, tx.clone())
            .with_context(|| format!("Cannot start reader on {name}"))?;
    }
    drop(tx);

    let mut charger = Charger::new(config)?;
    loop {
        let now = Instant::now();
        if charger.is_due(now) {
            charger.tick(now, &mut transport, output.publisher());
            output.flush();
        }
        let wait = charger
            .next_tick()
            .map_or(Duration::ZERO, |next| next.saturating_duration_since(Instant::now()));
        match rx.recv_timeout(wait) {
            Ok(received) => {
                charger.on_frame(
                    received.battery,
                    received.at,
                    received.frame.id,
                    &received.frame.data,
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("All CAN readers stopped");
            }
        }
    }
}
