//! Stateless frame decoding against the static tables.
//!
//! The tables are indexed by frame id once, at construction, so a received
//! frame costs one map lookup plus the byte and bit extraction of the entries
//! registered for its id.

use crate::protocol::{
    FieldDescriptor, FlagDescriptor, FrameId, TextDescriptor, FIELDS, FLAGS, TEXTS,
};
use std::collections::HashMap;

/// New state of one variant of one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitUpdate {
    /// Index into the flag table.
    pub flag: usize,
    /// Index into the flag's variant list.
    pub variant: usize,
    pub state: bool,
}

/// Everything extracted from a single frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub values: Vec<(&'static str, f32)>,
    pub bits: Vec<BitUpdate>,
    pub texts: Vec<(&'static str, String)>,
}

impl DecodedFrame {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.bits.is_empty() && self.texts.is_empty()
    }
}

#[derive(Debug, Default)]
struct FrameLayout {
    fields: Vec<&'static FieldDescriptor>,
    bits: Vec<(usize, usize)>,
    texts: Vec<&'static TextDescriptor>,
}

#[derive(Debug)]
pub struct FrameDecoder {
    flags: &'static [FlagDescriptor],
    layouts: HashMap<FrameId, FrameLayout>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FIELDS, FLAGS, TEXTS)
    }
}

impl FrameDecoder {
    pub fn new(
        fields: &'static [FieldDescriptor],
        flags: &'static [FlagDescriptor],
        texts: &'static [TextDescriptor],
    ) -> Self {
        let mut layouts: HashMap<FrameId, FrameLayout> = HashMap::new();
        for field in fields {
            layouts.entry(field.frame_id).or_default().fields.push(field);
        }
        for (flag_index, flag) in flags.iter().enumerate() {
            for (variant_index, variant) in flag.variants.iter().enumerate() {
                layouts
                    .entry(variant.frame_id)
                    .or_default()
                    .bits
                    .push((flag_index, variant_index));
            }
        }
        for text in texts {
            layouts.entry(text.frame_id).or_default().texts.push(text);
        }
        Self { flags, layouts }
    }

    pub fn flags(&self) -> &'static [FlagDescriptor] {
        self.flags
    }

    pub fn handles(&self, frame_id: FrameId) -> bool {
        self.layouts.contains_key(&frame_id)
    }

    /// Registered frame ids in ascending order.
    pub fn frame_ids(&self) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = self.layouts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns `None` for ids without any registered entry. Entries that do not
    /// fit into a short payload are skipped, their siblings are still decoded.
    pub fn decode(&self, frame_id: FrameId, payload: &[u8]) -> Option<DecodedFrame> {
        let layout = self.layouts.get(&frame_id)?;
        let mut decoded = DecodedFrame::default();
        for field in &layout.fields {
            match field.decode(payload) {
                Some(value) => decoded.values.push((field.key, value)),
                None => log::trace!(
                    "0x{frame_id:03X}: payload of {} bytes too short for '{}'",
                    payload.len(),
                    field.key
                ),
            }
        }
        for &(flag, variant) in &layout.bits {
            if let Some(state) = self.flags[flag].variants[variant].read(payload) {
                decoded.bits.push(BitUpdate {
                    flag,
                    variant,
                    state,
                });
            }
        }
        for text in &layout.texts {
            if let Some(value) = text.decode(payload) {
                decoded.texts.push((text.key, value));
            }
        }
        Some(decoded)
    }
}
