//! Aggregation of up to four batteries behind one inverter.
//!
//! Toward the inverter the charger behaves like a single BMS speaking the
//! configured protocol: on every tick it sends the combined measurements,
//! limits and flags, and keeps every BMS awake with its heartbeat frame.

use crate::battery::{Battery, FrameUpdate};
use crate::config::ChargerConfig;
use crate::decoder::FrameDecoder;
use crate::liveness::LivenessTracker;
use crate::protocol::{self, FlagCategory, FlagDescriptor, FrameId};
use crate::publisher::{Published, Publisher, Throttle};
use crate::transport::{Bus, Transport};
use crate::Error;
use std::time::Instant;

const ALARMS: &str = "alarms";
const WARNINGS: &str = "warnings";
const CONNECTED: &str = "connected";

/// Charge limit of paralleled packs: the weakest pack bounds the bank.
pub fn combined_charge_limit(limits: impl IntoIterator<Item = f32>) -> Option<f32> {
    limits.into_iter().reduce(f32::min)
}

/// Discharge limit of paralleled packs: their currents add up.
pub fn combined_discharge_limit(limits: impl IntoIterator<Item = f32>) -> Option<f32> {
    limits.into_iter().reduce(|a, b| a + b)
}

fn average(values: Vec<f32>) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f32>() / values.len() as f32)
}

/// One current limit of every battery, `None` if any of them is unknown.
fn limits(batteries: &[&Battery], limit: impl Fn(&Battery) -> Option<f32>) -> Option<Vec<f32>> {
    batteries.iter().map(|&battery| limit(battery)).collect()
}

/// Bank level figures over the connected batteries.
///
/// A current limit is zero while any connected battery lacks its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub temperature: Option<f32>,
    pub charge: Option<f32>,
    pub health: Option<f32>,
    pub max_charge_voltage: Option<f32>,
    pub min_discharge_voltage: Option<f32>,
    pub max_charge_current: Option<f32>,
    pub max_discharge_current: Option<f32>,
    pub module_count: Option<f32>,
}

impl Aggregate {
    fn compute(batteries: &[&Battery]) -> Self {
        let values = |key: &str| -> Vec<f32> {
            batteries.iter().filter_map(|b| b.value(key)).collect()
        };
        Self {
            voltage: average(values(protocol::VOLTAGE)),
            current: values(protocol::CURRENT).into_iter().reduce(|a, b| a + b),
            temperature: average(values(protocol::TEMPERATURE)),
            charge: average(values(protocol::CHARGE)),
            health: average(values(protocol::HEALTH)),
            max_charge_voltage: values(protocol::MAX_CHARGE_VOLTAGE)
                .into_iter()
                .reduce(f32::min),
            min_discharge_voltage: values(protocol::MIN_DISCHARGE_VOLTAGE)
                .into_iter()
                .reduce(f32::max),
            max_charge_current: limits(batteries, Battery::charge_limit)
                .map_or(Some(0.0), combined_charge_limit),
            max_discharge_current: limits(batteries, Battery::discharge_limit)
                .map_or(Some(0.0), combined_discharge_limit),
            module_count: values(protocol::MODULE_COUNT)
                .into_iter()
                .reduce(|a, b| a + b),
        }
    }

    pub fn value(&self, key: &str) -> Option<f32> {
        match key {
            protocol::VOLTAGE => self.voltage,
            protocol::CURRENT => self.current,
            protocol::TEMPERATURE => self.temperature,
            protocol::CHARGE => self.charge,
            protocol::HEALTH => self.health,
            protocol::MAX_CHARGE_VOLTAGE => self.max_charge_voltage,
            protocol::MIN_DISCHARGE_VOLTAGE => self.min_discharge_voltage,
            protocol::MAX_CHARGE_CURRENT => self.max_charge_current,
            protocol::MAX_DISCHARGE_CURRENT => self.max_discharge_current,
            protocol::MODULE_COUNT => self.module_count,
            _ => None,
        }
    }
}

/// Alarms and warnings hold when any battery reports them, requests only when
/// every battery agrees.
fn asserted(flag: &FlagDescriptor, batteries: &[&Battery]) -> bool {
    let mut states = batteries.iter().map(|b| b.flag(flag.key) == Some(true));
    match flag.category {
        FlagCategory::Alarm | FlagCategory::Warning => states.any(|s| s),
        FlagCategory::Request => !batteries.is_empty() && states.all(|s| s),
    }
}

fn summary(category: FlagCategory, batteries: &[&Battery], flags: &[FlagDescriptor]) -> String {
    let names: Vec<&str> = flags
        .iter()
        .filter(|f| f.category == category && asserted(f, batteries))
        .map(|f| f.name)
        .collect();
    if names.is_empty() {
        "None".to_string()
    } else {
        names.join(", ")
    }
}

#[derive(Debug)]
pub struct Charger {
    config: ChargerConfig,
    decoder: FrameDecoder,
    batteries: Vec<Battery>,
    links: LivenessTracker<usize>,
    connected: bool,
    aggregate: Aggregate,
    throttle: Throttle,
    next_tick: Option<Instant>,
}

impl Charger {
    pub fn new(config: ChargerConfig) -> Result<Self, Error> {
        config.validate()?;
        let decoder = FrameDecoder::default();
        let batteries = config
            .batteries
            .iter()
            .enumerate()
            .map(|(index, battery)| Battery::new(index, battery.clone(), &decoder, config.debug))
            .collect::<Vec<_>>();
        log::info!(
            "{}: protocol {}, {} batteries, interval {}, timeout {}, throttle {}",
            config.name,
            config.protocol,
            batteries.len(),
            humantime::format_duration(config.interval),
            humantime::format_duration(config.timeout),
            humantime::format_duration(config.throttle)
        );
        Ok(Self {
            links: LivenessTracker::with_keys(config.timeout, 0..batteries.len()),
            throttle: Throttle::new(config.throttle),
            connected: false,
            aggregate: Aggregate::default(),
            next_tick: None,
            decoder,
            batteries,
            config,
        })
    }

    pub fn config(&self) -> &ChargerConfig {
        &self.config
    }

    pub fn batteries(&self) -> &[Battery] {
        &self.batteries
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn battery_connected(&self, index: usize) -> bool {
        self.links.is_fresh(&index)
    }

    pub fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    pub fn charge_limit(&self) -> Option<f32> {
        self.aggregate.max_charge_current
    }

    pub fn discharge_limit(&self) -> Option<f32> {
        self.aggregate.max_discharge_current
    }

    /// Frame received on the bus of battery `battery`.
    pub fn on_frame(
        &mut self,
        battery: usize,
        now: Instant,
        frame_id: FrameId,
        payload: &[u8],
    ) -> Option<FrameUpdate> {
        let Some(target) = self.batteries.get_mut(battery) else {
            log::warn!("{}: frame for unknown battery #{battery}", self.config.name);
            return None;
        };
        let update = target.on_frame(&self.decoder, now, frame_id, payload)?;
        if self.links.seen(battery, now) {
            log::info!("{}: connected", target.name());
        }
        Some(update)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_tick.map_or(true, |next| now >= next)
    }

    /// Instant of the next scheduled tick, `None` before the first one.
    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Runs one poll cycle. Send failures are logged and the frame is simply
    /// sent again on the next tick.
    pub fn tick(&mut self, now: Instant, transport: &mut dyn Transport, publisher: &mut dyn Publisher) {
        self.next_tick = Some(now + self.config.interval);

        for battery in self.batteries.iter_mut() {
            battery.poll(now);
        }
        for index in self.links.poll(now) {
            log::warn!(
                "{}: no frames for {}, disconnected",
                self.batteries[index].name(),
                humantime::format_duration(self.config.timeout)
            );
        }
        let connected = self.links.all_fresh();
        if connected != self.connected {
            log::info!("{}: connected = {connected}", self.config.name);
            self.connected = connected;
        }

        let online: Vec<&Battery> = self
            .batteries
            .iter()
            .enumerate()
            .filter(|(index, _)| self.links.is_fresh(index))
            .map(|(_, battery)| battery)
            .collect();
        self.aggregate = Aggregate::compute(&online);
        if !connected && self.config.zero_limits_when_disconnected {
            self.aggregate.max_charge_current = Some(0.0);
            self.aggregate.max_discharge_current = Some(0.0);
        }

        for (bus, frame_id, payload) in self.inverter_frames(&online) {
            if let Err(err) = transport.send_frame(bus, frame_id, &payload) {
                log::warn!("{}: cannot send 0x{frame_id:03X} to {bus}: {err}", self.config.name);
            }
        }
        for (index, battery) in self.batteries.iter().enumerate() {
            let (frame_id, payload) = battery.heartbeat();
            if let Err(err) = transport.send_frame(Bus::Battery(index), frame_id, payload) {
                log::warn!(
                    "{}: cannot send heartbeat 0x{frame_id:03X}, retrying next tick: {err}",
                    battery.name()
                );
            }
        }

        self.publish(now, publisher);
    }

    fn inverter_frames(&self, online: &[&Battery]) -> Vec<(Bus, FrameId, Vec<u8>)> {
        let value = |key: &str| self.aggregate.value(key);
        let mut frames = vec![
            (
                Bus::Inverter,
                protocol::LIMITS_ID,
                protocol::encode_fields(protocol::LIMITS_ID, value),
            ),
            (
                Bus::Inverter,
                protocol::STATE_ID,
                protocol::encode_fields(protocol::STATE_ID, value),
            ),
            (
                Bus::Inverter,
                protocol::MEASUREMENTS_ID,
                protocol::encode_fields(protocol::MEASUREMENTS_ID, value),
            ),
            (
                Bus::Inverter,
                protocol::NAME_ID,
                protocol::encode_text(&self.config.name),
            ),
        ];
        for frame_id in protocol::flag_frames(self.config.protocol) {
            let payload = protocol::encode_status_frame(
                self.config.protocol,
                frame_id,
                |flag| asserted(flag, online),
                value,
            );
            frames.push((Bus::Inverter, frame_id, payload));
        }
        frames
    }

    fn publish(&mut self, now: Instant, publisher: &mut dyn Publisher) {
        let Self {
            config,
            decoder,
            batteries,
            links,
            connected,
            aggregate,
            throttle,
            ..
        } = self;

        for (index, battery) in batteries.iter().enumerate() {
            let source = battery.name();
            let link = Published::Connectivity(links.is_fresh(&index));
            throttle.publish(publisher, now, source, CONNECTED, link);
            for field in protocol::FIELDS {
                let value = Published::Numeric(battery.value(field.key));
                throttle.publish(publisher, now, source, field.key, value);
            }
            for (flag, state) in battery.flags().iter() {
                throttle.publish(publisher, now, source, flag.key, Published::Flag(state));
            }
            for text in protocol::TEXTS {
                let value = Published::Text(battery.text(text.key).map(String::from));
                throttle.publish(publisher, now, source, text.key, value);
            }
            for (key, category) in [(ALARMS, FlagCategory::Alarm), (WARNINGS, FlagCategory::Warning)] {
                let summary = Published::Text(battery.flags().summary(category));
                throttle.publish(publisher, now, source, key, summary);
            }
        }

        let source = config.name.as_str();
        throttle.publish(publisher, now, source, CONNECTED, Published::Connectivity(*connected));
        for field in protocol::FIELDS {
            let value = Published::Numeric(aggregate.value(field.key));
            throttle.publish(publisher, now, source, field.key, value);
        }
        let online: Vec<&Battery> = batteries
            .iter()
            .enumerate()
            .filter(|(index, _)| links.is_fresh(index))
            .map(|(_, battery)| battery)
            .collect();
        // nothing is known about the bank without a connected battery
        let known = !online.is_empty();
        for flag in decoder.flags() {
            let state = Published::Flag(known.then(|| asserted(flag, &online)));
            throttle.publish(publisher, now, source, flag.key, state);
        }
        for (key, category) in [(ALARMS, FlagCategory::Alarm), (WARNINGS, FlagCategory::Warning)] {
            let text = known.then(|| summary(category, &online, decoder.flags()));
            throttle.publish(publisher, now, source, key, Published::Text(text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatteryConfig;
    use crate::protocol::Protocol;
    use crate::publisher::tests::Recorder;
    use crate::transport::{CanFrame, RecordingTransport};
    use std::time::Duration;

    fn charger(protocol: Protocol, count: usize) -> Charger {
        let batteries = (0..count)
            .map(|i| BatteryConfig {
                heartbeat_id: 0x308 + i as FrameId,
                ..Default::default()
            })
            .collect();
        Charger::new(ChargerConfig::new(protocol, batteries)).unwrap()
    }

    fn limits(max_charge: f32, max_discharge: f32) -> Vec<u8> {
        protocol::encode_fields(protocol::LIMITS_ID, |key| match key {
            protocol::MAX_CHARGE_VOLTAGE => Some(56.8),
            protocol::MAX_CHARGE_CURRENT => Some(max_charge),
            protocol::MAX_DISCHARGE_CURRENT => Some(max_discharge),
            protocol::MIN_DISCHARGE_VOLTAGE => Some(46.0),
            _ => None,
        })
    }

    fn sent(transport: &RecordingTransport, bus: Bus, id: FrameId) -> Vec<&CanFrame> {
        transport
            .sent
            .iter()
            .filter(|(b, f)| *b == bus && f.id == id)
            .map(|(_, f)| f)
            .collect()
    }

    fn published<'a>(recorder: &'a Recorder, source: &str, key: &str) -> Vec<&'a Published> {
        recorder
            .0
            .iter()
            .filter(|(s, k, _)| s == source && k == key)
            .map(|(_, _, p)| p)
            .collect()
    }

    #[test]
    fn asymmetric_limits() {
        assert_eq!(combined_charge_limit([50.0, 60.0, 40.0]), Some(40.0));
        assert_eq!(combined_discharge_limit([50.0, 60.0, 40.0]), Some(150.0));
        assert_eq!(combined_charge_limit([]), None);
        assert_eq!(combined_discharge_limit([]), None);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ChargerConfig::new(Protocol::Sma, vec![BatteryConfig::default(); 5]);
        assert!(matches!(
            Charger::new(config),
            Err(Error::TooManyBatteries { .. })
        ));
    }

    #[test]
    fn bank_limits_over_three_batteries() {
        let mut charger = charger(Protocol::Sma, 3);
        let now = Instant::now();
        for (index, (charge, discharge)) in [(50.0, 50.0), (60.0, 60.0), (40.0, 40.0)]
            .into_iter()
            .enumerate()
        {
            charger.on_frame(index, now, protocol::LIMITS_ID, &limits(charge, discharge));
        }
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        charger.tick(now, &mut transport, &mut recorder);

        assert!(charger.is_connected());
        assert_eq!(charger.charge_limit(), Some(40.0));
        assert_eq!(charger.discharge_limit(), Some(150.0));
        let frames = sent(&transport, Bus::Inverter, protocol::LIMITS_ID);
        assert_eq!(frames.len(), 1);
        // 56.8V, 40.0A, 150.0A, 46.0V
        assert_eq!(
            frames[0].data,
            vec![0x38, 0x02, 0x90, 0x01, 0xDC, 0x05, 0xCC, 0x01]
        );
    }

    #[test]
    fn bank_measurements() {
        let mut charger = charger(Protocol::Pylon, 2);
        let now = Instant::now();
        charger.on_frame(0, now, protocol::MEASUREMENTS_ID, &[0x64, 0x14, 0x64, 0x00, 0xFA, 0x00]);
        charger.on_frame(1, now, protocol::MEASUREMENTS_ID, &[0x78, 0x14, 0x32, 0x00, 0x04, 0x01]);
        charger.on_frame(0, now, protocol::STATE_ID, &[80, 0, 100, 0]);
        charger.on_frame(1, now, protocol::STATE_ID, &[60, 0, 90, 0]);
        let mut transport = RecordingTransport::default();
        charger.tick(now, &mut transport, &mut Recorder::default());

        let aggregate = charger.aggregate();
        assert!((aggregate.voltage.unwrap() - 52.3).abs() < 1e-3);
        assert!((aggregate.current.unwrap() - 15.0).abs() < 1e-3);
        assert!((aggregate.temperature.unwrap() - 25.5).abs() < 1e-3);
        assert_eq!(aggregate.charge, Some(70.0));
        assert_eq!(aggregate.health, Some(95.0));
        assert_eq!(
            sent(&transport, Bus::Inverter, protocol::STATE_ID)[0].data,
            vec![70, 0, 95, 0]
        );
        assert_eq!(
            sent(&transport, Bus::Inverter, protocol::NAME_ID)[0].data,
            b"BmsCharg".to_vec()
        );
    }

    #[test]
    fn heartbeats_are_unconditional() {
        let mut charger = charger(Protocol::Sma, 2);
        let start = Instant::now();
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        charger.tick(start, &mut transport, &mut recorder);
        charger.tick(start + Duration::from_secs(1), &mut transport, &mut recorder);

        let first = sent(&transport, Bus::Battery(0), 0x308);
        let second = sent(&transport, Bus::Battery(1), 0x309);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(first[0].data, b"ESPHome".to_vec());
    }

    #[test]
    fn disconnected_bank_zeroes_limits() {
        let mut charger = charger(Protocol::Sma, 2);
        let start = Instant::now();
        charger.on_frame(0, start, protocol::LIMITS_ID, &limits(50.0, 50.0));
        charger.on_frame(1, start, protocol::LIMITS_ID, &limits(60.0, 60.0));
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        charger.tick(start, &mut transport, &mut recorder);
        assert_eq!(charger.discharge_limit(), Some(110.0));

        // battery 2 keeps talking, battery 1 goes quiet
        let later = start + Duration::from_secs(11);
        charger.on_frame(1, later, protocol::LIMITS_ID, &limits(60.0, 60.0));
        charger.tick(later, &mut transport, &mut recorder);
        assert!(!charger.is_connected());
        assert!(!charger.battery_connected(0));
        assert!(charger.battery_connected(1));
        assert_eq!(charger.charge_limit(), Some(0.0));
        assert_eq!(charger.discharge_limit(), Some(0.0));
        let frames = sent(&transport, Bus::Inverter, protocol::LIMITS_ID);
        assert_eq!(&frames[1].data[2..6], &[0, 0, 0, 0]);
        assert_eq!(
            published(&recorder, "battery1", "connected"),
            vec![&Published::Connectivity(true), &Published::Connectivity(false)]
        );
        assert_eq!(
            published(&recorder, "BmsCharger", "connected").last(),
            Some(&&Published::Connectivity(false))
        );

        // any recognised frame reconnects immediately
        charger.on_frame(0, later, protocol::STATE_ID, &[50, 0, 100, 0]);
        assert!(charger.battery_connected(0));
        charger.tick(later + Duration::from_millis(10), &mut transport, &mut recorder);
        assert!(charger.is_connected());
        assert_eq!(charger.discharge_limit(), Some(110.0));
    }

    #[test]
    fn limits_kept_from_connected_batteries_when_fail_safe_is_off() {
        let mut config = ChargerConfig::new(Protocol::Sma, vec![BatteryConfig::default(); 1]);
        config.batteries.push(BatteryConfig {
            name: Some("second".into()),
            ..Default::default()
        });
        config.zero_limits_when_disconnected = false;
        let mut charger = Charger::new(config).unwrap();
        let now = Instant::now();
        charger.on_frame(1, now, protocol::LIMITS_ID, &limits(60.0, 70.0));
        charger.tick(now, &mut RecordingTransport::default(), &mut Recorder::default());
        assert!(!charger.is_connected());
        assert_eq!(charger.charge_limit(), Some(60.0));
        assert_eq!(charger.discharge_limit(), Some(70.0));
    }

    struct FailingHeartbeats {
        inner: RecordingTransport,
        fail: bool,
    }

    impl Transport for FailingHeartbeats {
        fn send_frame(&mut self, bus: Bus, frame_id: FrameId, payload: &[u8]) -> Result<(), Error> {
            if self.fail && bus != Bus::Inverter {
                return Err(Error::Transport("bus off".into()));
            }
            self.inner.send_frame(bus, frame_id, payload)
        }
    }

    #[test]
    fn send_failures_do_not_stop_the_tick() {
        let mut charger = charger(Protocol::Pylon, 2);
        let start = Instant::now();
        let mut transport = FailingHeartbeats {
            inner: RecordingTransport::default(),
            fail: true,
        };
        let mut recorder = Recorder::default();
        charger.tick(start, &mut transport, &mut recorder);
        assert!(sent(&transport.inner, Bus::Battery(0), 0x308).is_empty());
        assert_eq!(sent(&transport.inner, Bus::Inverter, protocol::PYLON_REQUEST_ID).len(), 1);
        assert!(!published(&recorder, "battery2", "connected").is_empty());

        transport.fail = false;
        charger.tick(start + Duration::from_secs(1), &mut transport, &mut recorder);
        assert_eq!(sent(&transport.inner, Bus::Battery(0), 0x308).len(), 1);
        assert_eq!(sent(&transport.inner, Bus::Battery(1), 0x309).len(), 1);
    }

    #[test]
    fn protocol_selects_flag_frames() {
        let now = Instant::now();
        let sma_alarm = [0x04, 0, 0, 0, 0, 0, 0, 0];

        let mut sma = charger(Protocol::Sma, 1);
        sma.on_frame(0, now, protocol::SMA_FLAGS_ID, &sma_alarm);
        let mut transport = RecordingTransport::default();
        sma.tick(now, &mut transport, &mut Recorder::default());
        assert_eq!(
            sent(&transport, Bus::Inverter, protocol::SMA_FLAGS_ID)[0].data,
            sma_alarm.to_vec()
        );
        assert!(sent(&transport, Bus::Inverter, protocol::PYLON_FLAGS_ID).is_empty());

        // an SMA battery behind a Pylon inverter is translated
        let mut pylon = charger(Protocol::Pylon, 1);
        pylon.on_frame(0, now, protocol::SMA_FLAGS_ID, &sma_alarm);
        let mut transport = RecordingTransport::default();
        pylon.tick(now, &mut transport, &mut Recorder::default());
        assert_eq!(
            sent(&transport, Bus::Inverter, protocol::PYLON_FLAGS_ID)[0].data,
            vec![0, 0, 0x02, 0, 0, b'P', b'N', 0]
        );
        assert!(sent(&transport, Bus::Inverter, protocol::SMA_FLAGS_ID).is_empty());
    }

    #[test]
    fn requests_need_every_battery() {
        let now = Instant::now();
        let mut charger = charger(Protocol::Pylon, 2);
        // charge + discharge enable
        charger.on_frame(0, now, protocol::PYLON_REQUEST_ID, &[0xC0, 0]);
        // discharge enable only
        charger.on_frame(1, now, protocol::PYLON_REQUEST_ID, &[0x40, 0]);
        let mut transport = RecordingTransport::default();
        charger.tick(now, &mut transport, &mut Recorder::default());
        assert_eq!(
            sent(&transport, Bus::Inverter, protocol::PYLON_REQUEST_ID)[0].data,
            vec![0x40, 0]
        );
    }

    #[test]
    fn publication_is_throttled() {
        let mut charger = charger(Protocol::Sma, 1);
        let start = Instant::now();
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        let measurements = [0x64, 0x14, 0x64, 0x00, 0xFA, 0x00];

        charger.on_frame(0, start, protocol::MEASUREMENTS_ID, &measurements);
        charger.tick(start, &mut transport, &mut recorder);
        assert_eq!(published(&recorder, "battery1", "voltage").len(), 1);

        charger.on_frame(0, start + Duration::from_secs(1), protocol::MEASUREMENTS_ID, &measurements);
        charger.tick(start + Duration::from_secs(1), &mut transport, &mut recorder);
        assert_eq!(published(&recorder, "battery1", "voltage").len(), 1);

        // changed value goes out immediately
        let changed = [0x78, 0x14, 0x64, 0x00, 0xFA, 0x00];
        charger.on_frame(0, start + Duration::from_secs(2), protocol::MEASUREMENTS_ID, &changed);
        charger.tick(start + Duration::from_secs(2), &mut transport, &mut recorder);
        assert_eq!(published(&recorder, "battery1", "voltage").len(), 2);

        charger.on_frame(0, start + Duration::from_secs(17), protocol::MEASUREMENTS_ID, &changed);
        charger.tick(start + Duration::from_secs(17), &mut transport, &mut recorder);
        assert_eq!(published(&recorder, "battery1", "voltage").len(), 3);
    }

    #[test]
    fn alarm_texts() {
        let mut charger = charger(Protocol::Sma, 2);
        let now = Instant::now();
        charger.on_frame(0, now, protocol::SMA_FLAGS_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]);
        charger.on_frame(1, now, protocol::SMA_FLAGS_ID, &[0, 0x01, 0, 0, 0, 0, 0, 0]);
        let mut recorder = Recorder::default();
        charger.tick(now, &mut RecordingTransport::default(), &mut recorder);
        assert_eq!(
            published(&recorder, "battery1", "alarms"),
            vec![&Published::Text(Some("High Voltage".into()))]
        );
        assert_eq!(
            published(&recorder, "BmsCharger", "alarms"),
            vec![&Published::Text(Some("High Voltage, Low Temperature".into()))]
        );
        assert_eq!(
            published(&recorder, "BmsCharger", "warnings"),
            vec![&Published::Text(Some("None".into()))]
        );
        assert_eq!(
            published(&recorder, "BmsCharger", "high_voltage_alarm"),
            vec![&Published::Flag(Some(true))]
        );
    }

    #[test]
    fn stale_values_are_published_as_unknown() {
        let mut charger = charger(Protocol::Sma, 1);
        let start = Instant::now();
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        charger.on_frame(0, start, protocol::STATE_ID, &[80, 0, 100, 0]);
        charger.tick(start, &mut transport, &mut recorder);
        charger.tick(start + Duration::from_secs(61), &mut transport, &mut recorder);
        assert_eq!(
            published(&recorder, "battery1", "charge"),
            vec![&Published::Numeric(Some(80.0)), &Published::Numeric(None)]
        );
    }

    #[test]
    fn stale_flags_and_texts_are_published_as_unknown() {
        let mut charger = charger(Protocol::Sma, 1);
        let start = Instant::now();
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        charger.on_frame(0, start, protocol::SMA_FLAGS_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]);
        charger.on_frame(0, start, protocol::NAME_ID, b"BYD");
        // the link stays up on measurements alone
        for second in 0..=61 {
            let now = start + Duration::from_secs(second);
            charger.on_frame(0, now, protocol::MEASUREMENTS_ID, &[0x64, 0x14, 0x64, 0x00, 0xFA, 0x00]);
            charger.tick(now, &mut transport, &mut recorder);
        }

        assert!(charger.is_connected());
        assert_eq!(
            published(&recorder, "battery1", "high_voltage_alarm").last(),
            Some(&&Published::Flag(None))
        );
        assert_eq!(
            published(&recorder, "battery1", "alarms").last(),
            Some(&&Published::Text(None))
        );
        let names = published(&recorder, "battery1", protocol::BMS_NAME);
        assert_eq!(names.first(), Some(&&Published::Text(Some("BYD".into()))));
        assert_eq!(names.last(), Some(&&Published::Text(None)));
        assert!(published(&recorder, "battery1", "connected")
            .iter()
            .all(|p| **p == Published::Connectivity(true)));
        // the bank no longer sees the alarm
        assert_eq!(
            published(&recorder, "BmsCharger", "high_voltage_alarm").last(),
            Some(&&Published::Flag(Some(false)))
        );
    }

    #[test]
    fn stale_limits_zero_the_bank() {
        let mut charger = charger(Protocol::Sma, 2);
        let start = Instant::now();
        let mut transport = RecordingTransport::default();
        let mut recorder = Recorder::default();
        charger.on_frame(0, start, protocol::LIMITS_ID, &limits(10.0, 10.0));
        for second in 0..=61 {
            let now = start + Duration::from_secs(second);
            charger.on_frame(0, now, protocol::STATE_ID, &[80, 0, 100, 0]);
            charger.on_frame(1, now, protocol::LIMITS_ID, &limits(100.0, 100.0));
            charger.tick(now, &mut transport, &mut recorder);
            if second == 60 {
                assert_eq!(charger.charge_limit(), Some(10.0));
                assert_eq!(charger.discharge_limit(), Some(110.0));
            }
        }

        assert!(charger.is_connected());
        assert_eq!(charger.charge_limit(), Some(0.0));
        assert_eq!(charger.discharge_limit(), Some(0.0));
        let frames = sent(&transport, Bus::Inverter, protocol::LIMITS_ID);
        assert_eq!(&frames.last().unwrap().data[2..6], &[0, 0, 0, 0]);
    }

    #[test]
    fn battery_caps_apply_before_combining() {
        let capped = BatteryConfig {
            max_charge_current: Some(20.0),
            max_discharge_current: Some(30.0),
            ..Default::default()
        };
        let other = BatteryConfig {
            heartbeat_id: 0x309,
            ..Default::default()
        };
        let mut charger =
            Charger::new(ChargerConfig::new(Protocol::Sma, vec![capped, other])).unwrap();
        let now = Instant::now();
        charger.on_frame(0, now, protocol::LIMITS_ID, &limits(50.0, 50.0));
        charger.on_frame(1, now, protocol::LIMITS_ID, &limits(60.0, 60.0));
        charger.tick(now, &mut RecordingTransport::default(), &mut Recorder::default());

        assert_eq!(charger.charge_limit(), Some(20.0));
        assert_eq!(charger.discharge_limit(), Some(90.0));
    }

    #[test]
    fn frames_for_unknown_batteries_are_dropped() {
        let mut charger = charger(Protocol::Sma, 1);
        assert_eq!(
            charger.on_frame(3, Instant::now(), protocol::STATE_ID, &[80, 0, 100, 0]),
            None
        );
    }

    #[test]
    fn scheduling() {
        let mut charger = charger(Protocol::Sma, 1);
        let start = Instant::now();
        assert!(charger.is_due(start));
        charger.tick(start, &mut RecordingTransport::default(), &mut Recorder::default());
        assert!(!charger.is_due(start + Duration::from_millis(999)));
        assert!(charger.is_due(start + Duration::from_secs(1)));
        assert_eq!(charger.next_tick(), Some(start + Duration::from_secs(1)));
    }
}
