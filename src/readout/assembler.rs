use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{CHIP_NO, CHIP_RECORD_WORDS, LAYER_NO, MEMORY_BANKS};
use crate::prelude::*;

/// Words delivered by one chip slot of one layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipFragment {
    pub layer: usize,
    pub chip: usize,
    pub bank: u8,
    pub words: Vec<u16>,
}

/// Raw words accumulated for a single (layer, chip, memory bank).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipBuffer {
    pub layer: usize,
    pub chip: usize,
    pub bank: u8,
    pub words: Vec<u16>,
}

impl ChipBuffer {
    /// True when the buffer holds exactly one chip record.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.words.len() == CHIP_RECORD_WORDS
    }
}

struct SlotTracker {
    layer: usize,
    chip: usize,
    bank: u8,
    cache: Vec<u16>,
    // Number of fragments that contributed to the cache
    fragments: usize,
}

impl SlotTracker {
    fn new(layer: usize, chip: usize, bank: u8) -> Self {
        SlotTracker {
            layer,
            chip,
            bank,
            cache: Vec::with_capacity(CHIP_RECORD_WORDS),
            fragments: 0,
        }
    }

    fn reset(&mut self) {
        self.cache.clear();
        self.fragments = 0;
    }

    fn take(&mut self) -> ChipBuffer {
        let words = std::mem::replace(&mut self.cache, Vec::with_capacity(CHIP_RECORD_WORDS));
        self.fragments = 0;
        ChipBuffer {
            layer: self.layer,
            chip: self.chip,
            bank: self.bank,
            words,
        }
    }
}

impl Display for SlotTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SlotTracker{{layer={}, chip={}, bank={}, cache_len={}, fragments={}}}",
            self.layer,
            self.chip,
            self.bank,
            self.cache.len(),
            self.fragments
        )
    }
}

fn slot_index(layer: usize, chip: usize, bank: u8) -> Option<usize> {
    let bank = usize::from(bank);
    if layer >= LAYER_NO || chip >= CHIP_NO || bank >= MEMORY_BANKS {
        return None;
    }
    Some((layer * CHIP_NO + chip) * MEMORY_BANKS + bank)
}

/// Reassembles chip records that the hardware delivers split across several layer
/// frames.
///
/// There is one slot per (layer, chip, memory bank). Both banks of a chip are tracked
/// independently and may be filled in any order. A slot is complete when it holds
/// exactly [CHIP_RECORD_WORDS] words, at which point its contents are handed back to the
/// caller and the slot starts over.
pub struct ChipBufferAssembler {
    slots: Vec<SlotTracker>,
}

impl Default for ChipBufferAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChipBufferAssembler {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(LAYER_NO * CHIP_NO * MEMORY_BANKS);
        for layer in 0..LAYER_NO {
            for chip in 0..CHIP_NO {
                for bank in 0..MEMORY_BANKS as u8 {
                    slots.push(SlotTracker::new(layer, chip, bank));
                }
            }
        }
        ChipBufferAssembler { slots }
    }

    /// Add the words of `fragment` to its slot, returning every record completed as a
    /// result.
    ///
    /// Usually zero or one buffer is returned. Words beyond the end of a record begin
    /// the next record of the same slot, so an over-long fragment may complete more than
    /// one.
    ///
    /// # Errors
    /// [Error::OutOfRange] if the fragment's coordinates are not within the detector.
    /// Nothing is stored in that case.
    pub fn push(&mut self, fragment: ChipFragment) -> Result<Vec<ChipBuffer>> {
        let ChipFragment {
            layer,
            chip,
            bank,
            words,
        } = fragment;
        let Some(idx) = slot_index(layer, chip, bank) else {
            return Err(Error::OutOfRange { layer, chip, bank });
        };
        let slot = &mut self.slots[idx];
        slot.fragments += 1;

        let mut complete = Vec::new();
        for word in words {
            slot.cache.push(word);
            if slot.cache.len() == CHIP_RECORD_WORDS {
                trace!(layer, chip, bank, fragments = slot.fragments, "chip record complete");
                complete.push(slot.take());
            }
        }
        if !slot.cache.is_empty() {
            trace!("{slot}");
        }
        Ok(complete)
    }

    /// True when no slot holds any words.
    #[must_use]
    pub fn all_buffers_empty(&self) -> bool {
        self.slots.iter().all(|s| s.cache.is_empty())
    }

    /// Number of slots holding a partial record.
    #[must_use]
    pub fn incomplete(&self) -> usize {
        self.slots.iter().filter(|s| !s.cache.is_empty()).count()
    }

    /// Remove and return all partial records, e.g., at the end of a stream.
    pub fn drain_incomplete(&mut self) -> Vec<ChipBuffer> {
        let mut dangling = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| !s.cache.is_empty()) {
            warn!(
                layer = slot.layer,
                chip = slot.chip,
                bank = slot.bank,
                words = slot.cache.len(),
                "dangling chip buffer"
            );
            dangling.push(slot.take());
        }
        dangling
    }

    /// Discard all partial records.
    pub fn reset(&mut self) {
        let num = self.incomplete();
        if num > 0 {
            debug!(incomplete = num, "discarding partial chip records");
        }
        self.slots.iter_mut().for_each(SlotTracker::reset);
    }
}
