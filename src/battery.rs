use crate::config::BatteryConfig;
use crate::decoder::FrameDecoder;
use crate::flags::{FlagStore, FlagTransition};
use crate::liveness::LivenessTracker;
use crate::protocol::{self, FrameId};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Result of a recognised frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameUpdate {
    pub values: Vec<(&'static str, f32)>,
    pub transitions: Vec<FlagTransition>,
}

/// State of one BMS as seen on its bus.
///
/// Only the latest value per field, flag and text is kept. Whatever came from
/// a frame id that went stale reads as unknown until that frame is seen again.
#[derive(Debug)]
pub struct Battery {
    name: String,
    config: BatteryConfig,
    debug: bool,
    values: HashMap<&'static str, (FrameId, f32)>,
    texts: HashMap<&'static str, (FrameId, String)>,
    flags: FlagStore,
    frames: LivenessTracker<FrameId>,
    unhandled: HashSet<FrameId>,
}

impl Battery {
    pub fn new(index: usize, config: BatteryConfig, decoder: &FrameDecoder, debug: bool) -> Self {
        Self {
            name: config.display_name(index),
            debug,
            values: HashMap::new(),
            texts: HashMap::new(),
            flags: FlagStore::new(decoder.flags()),
            frames: LivenessTracker::with_keys(config.timeout, decoder.frame_ids()),
            unhandled: HashSet::new(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BatteryConfig {
        &self.config
    }

    /// Decodes a frame from this battery's bus. Returns `None` when the id is
    /// not ours or nothing fitted into the payload.
    pub fn on_frame(
        &mut self,
        decoder: &FrameDecoder,
        now: Instant,
        frame_id: FrameId,
        payload: &[u8],
    ) -> Option<FrameUpdate> {
        if self.debug {
            log::info!(
                "{}: received id 0x{frame_id:03X}, len {}",
                self.name,
                payload.len()
            );
        }
        let decoded = match decoder.decode(frame_id, payload) {
            Some(decoded) if !decoded.is_empty() => decoded,
            Some(_) => {
                log::debug!(
                    "{}: id 0x{frame_id:03X} with short payload, len {}",
                    self.name,
                    payload.len()
                );
                return None;
            }
            None => {
                if self.unhandled.insert(frame_id) || self.debug {
                    log::warn!(
                        "{}: received unhandled id 0x{frame_id:03X}, len {}",
                        self.name,
                        payload.len()
                    );
                }
                return None;
            }
        };

        if self.frames.seen(frame_id, now) {
            log::debug!("{}: frame 0x{frame_id:03X} is fresh", self.name);
        }
        for &(key, value) in &decoded.values {
            self.values.insert(key, (frame_id, value));
        }
        for (key, text) in decoded.texts {
            self.texts.insert(key, (frame_id, text));
        }
        let transitions = self.flags.apply(&decoded.bits);
        for transition in &transitions {
            log::debug!("{}: {} -> {:?}", self.name, transition.key, transition.state);
        }
        Some(FrameUpdate {
            values: decoded.values,
            transitions,
        })
    }

    /// Expires frames older than the battery timeout and forgets what they
    /// carried. Returns the ids that just went stale.
    pub fn poll(&mut self, now: Instant) -> Vec<FrameId> {
        let expired = self.frames.poll(now);
        for &frame_id in &expired {
            log::info!(
                "{}: no frame 0x{frame_id:03X} for {}, values unknown",
                self.name,
                humantime::format_duration(self.frames.timeout())
            );
            self.values.retain(|_, (id, _)| *id != frame_id);
            self.texts.retain(|_, (id, _)| *id != frame_id);
            for transition in self.flags.invalidate_frame(frame_id) {
                log::debug!("{}: {} -> {:?}", self.name, transition.key, transition.state);
            }
        }
        expired
    }

    pub fn value(&self, key: &str) -> Option<f32> {
        self.values.get(key).map(|(_, value)| *value)
    }

    /// Reported charge current limit, capped by the configured maximum.
    pub fn charge_limit(&self) -> Option<f32> {
        let limit = self.value(protocol::MAX_CHARGE_CURRENT)?;
        Some(self.config.max_charge_current.map_or(limit, |cap| limit.min(cap)))
    }

    /// Reported discharge current limit, capped by the configured maximum.
    pub fn discharge_limit(&self) -> Option<f32> {
        let limit = self.value(protocol::MAX_DISCHARGE_CURRENT)?;
        Some(
            self.config
                .max_discharge_current
                .map_or(limit, |cap| limit.min(cap)),
        )
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.flags.get(key)
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.texts.get(key).map(|(_, text)| text.as_str())
    }

    pub fn is_frame_fresh(&self, frame_id: FrameId) -> bool {
        self.frames.is_fresh(&frame_id)
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.frames.latest()
    }

    pub fn heartbeat(&self) -> (FrameId, &[u8]) {
        (self.config.heartbeat_id, self.config.heartbeat_text.as_bytes())
    }
}
