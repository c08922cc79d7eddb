//! Boundary toward the entity layer.
//!
//! `source` names the battery or the charger a value belongs to. Values,
//! flags and texts are `None` while unknown, e.g. after their frame went
//! stale.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub trait Publisher {
    fn publish_numeric(&mut self, source: &str, key: &str, value: Option<f32>);
    fn publish_flag(&mut self, source: &str, key: &str, state: Option<bool>);
    fn publish_text(&mut self, source: &str, key: &str, text: Option<&str>);
    fn publish_connectivity(&mut self, source: &str, state: bool);
}

/// Last published value of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Numeric(Option<f32>),
    Flag(Option<bool>),
    Text(Option<String>),
    Connectivity(bool),
}

impl Published {
    fn same(&self, other: &Published) -> bool {
        match (self, other) {
            // NaN never equals itself, treat it like any other repeated value
            (Published::Numeric(Some(a)), Published::Numeric(Some(b))) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            _ => self == other,
        }
    }

    /// Forwards the value to `publisher`.
    pub fn send(&self, publisher: &mut dyn Publisher, source: &str, key: &str) {
        match self {
            Published::Numeric(value) => publisher.publish_numeric(source, key, *value),
            Published::Flag(state) => publisher.publish_flag(source, key, *state),
            Published::Text(text) => publisher.publish_text(source, key, text.as_deref()),
            Published::Connectivity(state) => publisher.publish_connectivity(source, *state),
        }
    }
}

/// Suppresses republication of unchanged values until the interval expired.
/// A changed value always passes.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: HashMap<(String, String), (Published, Instant)>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Returns true when `value` should be published now, and records it.
    pub fn check(&mut self, now: Instant, source: &str, key: &str, value: &Published) -> bool {
        let slot = (source.to_string(), key.to_string());
        let due = match self.last.get(&slot) {
            Some((previous, at)) => {
                !previous.same(value) || now.saturating_duration_since(*at) >= self.interval
            }
            None => true,
        };
        if due {
            self.last.insert(slot, (value.clone(), now));
        }
        due
    }

    /// Publishes `value` through `publisher` if the throttle lets it pass.
    pub fn publish(
        &mut self,
        publisher: &mut dyn Publisher,
        now: Instant,
        source: &str,
        key: &str,
        value: Published,
    ) {
        if self.check(now, source, key, &value) {
            value.send(publisher, source, key);
        }
    }
}

/// Writes everything to the log.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish_numeric(&mut self, source: &str, key: &str, value: Option<f32>) {
        match value {
            Some(value) => log::info!("{source}/{key} = {value}"),
            None => log::info!("{source}/{key} = unknown"),
        }
    }

    fn publish_flag(&mut self, source: &str, key: &str, state: Option<bool>) {
        match state {
            Some(state) => log::info!("{source}/{key} = {state}"),
            None => log::info!("{source}/{key} = unknown"),
        }
    }

    fn publish_text(&mut self, source: &str, key: &str, text: Option<&str>) {
        match text {
            Some(text) => log::info!("{source}/{key} = {text:?}"),
            None => log::info!("{source}/{key} = unknown"),
        }
    }

    fn publish_connectivity(&mut self, source: &str, state: bool) {
        log::info!("{source}/connected = {state}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct Recorder(pub Vec<(String, String, Published)>);

    impl Publisher for Recorder {
        fn publish_numeric(&mut self, source: &str, key: &str, value: Option<f32>) {
            self.0.push((source.into(), key.into(), Published::Numeric(value)));
        }
        fn publish_flag(&mut self, source: &str, key: &str, state: Option<bool>) {
            self.0.push((source.into(), key.into(), Published::Flag(state)));
        }
        fn publish_text(&mut self, source: &str, key: &str, text: Option<&str>) {
            self.0
                .push((source.into(), key.into(), Published::Text(text.map(String::from))));
        }
        fn publish_connectivity(&mut self, source: &str, state: bool) {
            self.0
                .push((source.into(), "connected".into(), Published::Connectivity(state)));
        }
    }

    #[test]
    fn unchanged_values_wait_for_interval() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(15));
        let value = Published::Numeric(Some(52.1));
        assert!(throttle.check(start, "b1", "voltage", &value));
        assert!(!throttle.check(start + Duration::from_secs(1), "b1", "voltage", &value));
        assert!(!throttle.check(start + Duration::from_secs(14), "b1", "voltage", &value));
        assert!(throttle.check(start + Duration::from_secs(15), "b1", "voltage", &value));
    }

    #[test]
    fn changed_values_pass_immediately() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(15));
        assert!(throttle.check(start, "b1", "voltage", &Published::Numeric(Some(52.1))));
        assert!(throttle.check(start, "b1", "voltage", &Published::Numeric(Some(52.2))));
        assert!(throttle.check(start, "b1", "voltage", &Published::Numeric(None)));
        assert!(!throttle.check(start, "b1", "voltage", &Published::Numeric(None)));
        // other sources are tracked separately
        assert!(throttle.check(start, "b2", "voltage", &Published::Numeric(None)));
    }

    #[test]
    fn unknown_differs_from_last_state() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(15));
        assert!(throttle.check(start, "b1", "alarm", &Published::Flag(Some(true))));
        assert!(throttle.check(start, "b1", "alarm", &Published::Flag(None)));
        assert!(throttle.check(start, "b1", "name", &Published::Text(Some("BYD".into()))));
        assert!(throttle.check(start, "b1", "name", &Published::Text(None)));
        assert!(!throttle.check(start, "b1", "name", &Published::Text(None)));
    }

    #[test]
    fn nan_counts_as_unchanged() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(15));
        let nan = Published::Numeric(Some(f32::NAN));
        assert!(throttle.check(start, "b1", "x", &nan));
        assert!(!throttle.check(start, "b1", "x", &nan));
    }

    #[test]
    fn publish_forwards_to_publisher() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(15));
        let mut recorder = Recorder::default();
        throttle.publish(&mut recorder, start, "charger", "alarms", Published::Text(Some("None".into())));
        throttle.publish(&mut recorder, start, "charger", "alarms", Published::Text(Some("None".into())));
        throttle.publish(&mut recorder, start, "charger", "", Published::Connectivity(true));
        assert_eq!(
            recorder.0,
            vec![
                ("charger".into(), "alarms".into(), Published::Text(Some("None".into()))),
                ("charger".into(), "connected".into(), Published::Connectivity(true)),
            ]
        );
    }
}
