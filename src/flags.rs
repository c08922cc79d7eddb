//! Merging of flags reported at different bit positions by competing protocols.
//!
//! Each variant keeps the state of its last decode. The merged flag is the OR
//! over all known variants, so a fresh zero at one position clears only that
//! variant and the flag stays set while any other variant still asserts it.

use crate::decoder::BitUpdate;
use crate::protocol::{FlagCategory, FlagDescriptor, FrameId};

/// Change of a merged flag. `None` means the flag became unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagTransition {
    pub key: &'static str,
    pub state: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct FlagStore {
    flags: &'static [FlagDescriptor],
    variants: Vec<Vec<Option<bool>>>,
    merged: Vec<Option<bool>>,
}

impl FlagStore {
    pub fn new(flags: &'static [FlagDescriptor]) -> Self {
        Self {
            flags,
            variants: flags.iter().map(|f| vec![None; f.variants.len()]).collect(),
            merged: vec![None; flags.len()],
        }
    }

    /// Applies decoded bits and reports every merged flag that changed.
    /// Applying the same bits twice reports nothing the second time.
    pub fn apply(&mut self, bits: &[BitUpdate]) -> Vec<FlagTransition> {
        let mut touched: Vec<usize> = Vec::new();
        for bit in bits {
            let Some(slot) = self
                .variants
                .get_mut(bit.flag)
                .and_then(|v| v.get_mut(bit.variant))
            else {
                continue;
            };
            *slot = Some(bit.state);
            if !touched.contains(&bit.flag) {
                touched.push(bit.flag);
            }
        }
        touched
            .into_iter()
            .filter_map(|index| self.remerge(index))
            .collect()
    }

    /// Forgets every variant carried by `frame_id`, e.g. after the frame went
    /// stale. Flags left without any known variant become unknown. Returns
    /// the merged flags that changed.
    pub fn invalidate_frame(&mut self, frame_id: FrameId) -> Vec<FlagTransition> {
        let mut transitions = Vec::new();
        for (index, flag) in self.flags.iter().enumerate() {
            let mut touched = false;
            for (variant, position) in flag.variants.iter().enumerate() {
                if position.frame_id == frame_id {
                    self.variants[index][variant] = None;
                    touched = true;
                }
            }
            if touched {
                transitions.extend(self.remerge(index));
            }
        }
        transitions
    }

    fn remerge(&mut self, index: usize) -> Option<FlagTransition> {
        let states = &self.variants[index];
        let merged = if states.iter().any(|s| *s == Some(true)) {
            Some(true)
        } else if states.iter().any(Option::is_some) {
            Some(false)
        } else {
            None
        };
        let previous = std::mem::replace(&mut self.merged[index], merged);
        (previous != merged).then(|| FlagTransition {
            key: self.flags[index].key,
            state: merged,
        })
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.flags
            .iter()
            .position(|f| f.key == key)
            .and_then(|index| self.merged[index])
    }

    /// Merged state of every flag, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static FlagDescriptor, Option<bool>)> + '_ {
        self.flags.iter().zip(self.merged.iter().copied())
    }

    /// Comma separated names of the asserted flags of `category`, `"None"`
    /// when nothing is asserted, `None` while no flag of it is known.
    pub fn summary(&self, category: FlagCategory) -> Option<String> {
        let mut known = false;
        let mut names: Vec<&str> = Vec::new();
        for (flag, state) in self.iter().filter(|(f, _)| f.category == category) {
            match state {
                Some(true) => {
                    known = true;
                    names.push(flag.name);
                }
                Some(false) => known = true,
                None => {}
            }
        }
        if !known {
            None
        } else if names.is_empty() {
            Some("None".to_string())
        } else {
            Some(names.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FrameDecoder;
    use crate::protocol::{PYLON_FLAGS_ID, SMA_FLAGS_ID};

    fn feed(
        decoder: &FrameDecoder,
        store: &mut FlagStore,
        frame_id: FrameId,
        payload: &[u8],
    ) -> Vec<FlagTransition> {
        let decoded = decoder.decode(frame_id, payload).unwrap();
        store.apply(&decoded.bits)
    }

    fn asserted(transitions: &[FlagTransition]) -> Vec<&'static str> {
        transitions
            .iter()
            .filter(|t| t.state == Some(true))
            .map(|t| t.key)
            .collect()
    }

    #[test]
    fn unknown_until_decoded() {
        let decoder = FrameDecoder::default();
        let store = FlagStore::new(decoder.flags());
        assert_eq!(store.get("high_voltage_alarm"), None);
        assert_eq!(store.summary(FlagCategory::Alarm), None);
    }

    #[test]
    fn sma_assertion_survives_pylon_zero() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        let transitions = feed(&decoder, &mut store, SMA_FLAGS_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]);
        assert!(transitions.contains(&FlagTransition {
            key: "high_voltage_alarm",
            state: Some(true)
        }));
        assert_eq!(store.get("high_voltage_alarm"), Some(true));

        let transitions = feed(&decoder, &mut store, PYLON_FLAGS_ID, &[0; 8]);
        assert_eq!(store.get("high_voltage_alarm"), Some(true));
        assert!(!transitions.iter().any(|t| t.key == "high_voltage_alarm"));
    }

    #[test]
    fn any_variant_asserts() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        feed(&decoder, &mut store, SMA_FLAGS_ID, &[0; 8]);
        assert_eq!(store.get("low_voltage_alarm"), Some(false));
        let transitions = feed(&decoder, &mut store, PYLON_FLAGS_ID, &[0, 0, 0x04, 0, 0, 0, 0, 0]);
        assert_eq!(asserted(&transitions), vec!["low_voltage_alarm"]);
        assert_eq!(store.get("low_voltage_alarm"), Some(true));
    }

    #[test]
    fn clears_only_when_no_variant_asserts() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        feed(&decoder, &mut store, SMA_FLAGS_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]);
        feed(&decoder, &mut store, PYLON_FLAGS_ID, &[0, 0, 0x02, 0, 0, 0, 0, 0]);
        assert_eq!(store.get("high_voltage_alarm"), Some(true));

        // pylon clears, sma still asserts
        feed(&decoder, &mut store, PYLON_FLAGS_ID, &[0; 8]);
        assert_eq!(store.get("high_voltage_alarm"), Some(true));

        let transitions = feed(&decoder, &mut store, SMA_FLAGS_ID, &[0; 8]);
        assert_eq!(store.get("high_voltage_alarm"), Some(false));
        assert!(transitions.contains(&FlagTransition {
            key: "high_voltage_alarm",
            state: Some(false)
        }));
    }

    #[test]
    fn identical_frames_are_idempotent() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        let payload = [0x44, 0x01, 0, 0, 0x04, 0, 0, 0];
        assert!(!feed(&decoder, &mut store, SMA_FLAGS_ID, &payload).is_empty());
        assert!(feed(&decoder, &mut store, SMA_FLAGS_ID, &payload).is_empty());
    }

    #[test]
    fn alarms_and_warnings_are_separate() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        feed(&decoder, &mut store, SMA_FLAGS_ID, &[0, 0, 0, 0, 0x04, 0, 0, 0]);
        assert_eq!(store.get("high_voltage_alarm"), Some(false));
        assert_eq!(store.get("high_voltage_warning"), Some(true));
    }

    #[test]
    fn summaries() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        feed(&decoder, &mut store, SMA_FLAGS_ID, &[0x14, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            store.summary(FlagCategory::Alarm).as_deref(),
            Some("High Voltage, Low Voltage, Low Temperature")
        );
        assert_eq!(store.summary(FlagCategory::Warning).as_deref(), Some("None"));
        assert_eq!(store.summary(FlagCategory::Request), None);
    }

    #[test]
    fn invalidate_frame_makes_flags_unknown() {
        let decoder = FrameDecoder::default();
        let mut store = FlagStore::new(decoder.flags());
        feed(&decoder, &mut store, SMA_FLAGS_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]);
        feed(&decoder, &mut store, PYLON_FLAGS_ID, &[0; 8]);
        let transitions = store.invalidate_frame(SMA_FLAGS_ID);
        // pylon variant still known
        assert_eq!(store.get("high_voltage_alarm"), Some(false));
        assert!(transitions.contains(&FlagTransition {
            key: "high_voltage_alarm",
            state: Some(false)
        }));
        // sma only
        assert_eq!(store.get("general_alarm"), None);
        assert!(transitions.contains(&FlagTransition {
            key: "general_alarm",
            state: None
        }));
        assert_eq!(store.summary(FlagCategory::Alarm).as_deref(), Some("None"));
        assert!(store.invalidate_frame(SMA_FLAGS_ID).is_empty());

        let transitions = feed(&decoder, &mut store, SMA_FLAGS_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]);
        assert!(transitions.contains(&FlagTransition {
            key: "high_voltage_alarm",
            state: Some(true)
        }));
    }
}
