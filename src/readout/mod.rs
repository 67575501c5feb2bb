//! SPIROC readout payload decoding.
//!
//! A layer frame carries the readout of the nine SPIROC chips of one HBU layer. Each chip
//! occupies a fixed width slot holding all or part of one memory bank's record. Records
//! are reassembled by the [ChipBufferAssembler] and decoded into per-channel hits by the
//! [ChipDecoder].
//!
mod assembler;
mod decoder;

pub use assembler::*;
pub use decoder::*;

use serde::{Deserialize, Serialize};

/// Layers per detector.
pub const LAYER_NO: usize = 40;
/// SPIROC chips per layer.
pub const CHIP_NO: usize = 9;
/// Channels per SPIROC chip.
pub const CHANNEL_NO: usize = 36;
/// Ping-pong memory banks per chip.
pub const MEMORY_BANKS: usize = 2;

/// Number of 16-bit words in one complete chip record: a BCID word, a charge and a time
/// word per channel, and a chip trailer word.
pub const CHIP_RECORD_WORDS: usize = 1 + 2 * CHANNEL_NO + 1;

pub type CellId = u32;

/// Compute the [CellId] addressing a channel, or `None` if any index is out of range.
#[must_use]
pub fn cell_id(layer: usize, chip: usize, channel: usize) -> Option<CellId> {
    if layer >= LAYER_NO || chip >= CHIP_NO || channel >= CHANNEL_NO {
        return None;
    }
    CellId::try_from(layer * 100_000 + chip * 10_000 + channel).ok()
}

/// Split a [CellId] into its layer, chip, and channel indexes.
#[must_use]
pub fn split_cell_id(id: CellId) -> (usize, usize, usize) {
    let id = id as usize;
    (id / 100_000, (id % 100_000) / 10_000, id % 10_000)
}

/// Header following the head marker of every layer frame.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct LayerHeader {
    pub layer: u8,
    pub cycle_id: u16,
    pub trigger_id: u16,
}

impl LayerHeader {
    /// Layer header length in bytes
    pub const LEN: usize = 6;

    /// Construct from the provided bytes, or `None` if there are not enough bytes.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < Self::LEN {
            return None;
        }
        Some(LayerHeader {
            layer: dat[1],
            cycle_id: u16::from_be_bytes([dat[2], dat[3]]),
            trigger_id: u16::from_be_bytes([dat[4], dat[5]]),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let cycle = self.cycle_id.to_be_bytes();
        let trigger = self.trigger_id.to_be_bytes();
        [0, self.layer, cycle[0], cycle[1], trigger[0], trigger[1]]
    }
}

/// Descriptor word at the start of each chip slot.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChipSlotDescriptor {
    /// Chip id reported by the hardware; expected to equal the slot position.
    pub chip: u8,
    pub bank: u8,
    /// Number of valid words in the slot's data area.
    pub count: u8,
}

impl ChipSlotDescriptor {
    /// Descriptor length in bytes
    pub const LEN: usize = 2;
    /// Total slot length in bytes: descriptor plus a data area sized for a full record.
    pub const SLOT_LEN: usize = Self::LEN + CHIP_RECORD_WORDS * 2;

    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < Self::LEN {
            return None;
        }
        let x = u16::from_be_bytes([dat[0], dat[1]]);
        Some(ChipSlotDescriptor {
            chip: ((x >> 12) & 0xf) as u8,
            bank: ((x >> 11) & 0x1) as u8,
            count: (x & 0x7f) as u8,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let x = (u16::from(self.chip & 0xf) << 12)
            | (u16::from(self.bank & 0x1) << 11)
            | u16::from(self.count & 0x7f);
        x.to_be_bytes()
    }
}

/// The contents of one chip slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipSlot {
    /// Position of the slot in the layer, which identifies the chip.
    pub position: usize,
    pub descriptor: ChipSlotDescriptor,
    /// The valid words, i.e., the first `descriptor.count` words of the data area.
    pub words: Vec<u16>,
}

impl ChipSlot {
    /// Encode a slot carrying `words`, padding the data area with zeros.
    ///
    /// # Panics
    /// If more than [CHIP_RECORD_WORDS] words are provided.
    #[must_use]
    pub fn encode(chip: u8, bank: u8, words: &[u16]) -> Vec<u8> {
        assert!(words.len() <= CHIP_RECORD_WORDS, "too many words for a chip slot");
        let descriptor = ChipSlotDescriptor {
            chip,
            bank,
            count: words.len() as u8,
        };
        let mut dat = descriptor.encode().to_vec();
        for w in words {
            dat.extend_from_slice(&w.to_be_bytes());
        }
        dat.resize(ChipSlotDescriptor::SLOT_LEN, 0);
        dat
    }
}

/// A decoded layer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPayload {
    pub header: LayerHeader,
    /// Complete slots with at least one valid word.
    pub slots: Vec<ChipSlot>,
    /// Number of complete slots present, including empty ones.
    pub num_slots: usize,
    /// True if the payload is shorter or longer than [LayerPayload::LEN].
    pub len_mismatch: bool,
}

impl LayerPayload {
    /// Expected payload length of a layer frame, i.e., without markers.
    pub const LEN: usize = LayerHeader::LEN + CHIP_NO * ChipSlotDescriptor::SLOT_LEN;

    /// Decode a layer frame payload, or `None` if there are not enough bytes for the
    /// header.
    ///
    /// Only complete slots are decoded. Slots whose descriptor claims more words than a
    /// record holds are kept with their count clamped so the caller can report them.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        let header = LayerHeader::decode(dat)?;
        let body = &dat[LayerHeader::LEN..];
        let num_slots = (body.len() / ChipSlotDescriptor::SLOT_LEN).min(CHIP_NO);

        let mut slots = Vec::with_capacity(num_slots);
        for position in 0..num_slots {
            let start = position * ChipSlotDescriptor::SLOT_LEN;
            let slot = &body[start..start + ChipSlotDescriptor::SLOT_LEN];
            let descriptor = ChipSlotDescriptor::decode(slot)?;
            let count = usize::from(descriptor.count).min(CHIP_RECORD_WORDS);
            if count == 0 {
                continue;
            }
            let words = slot[ChipSlotDescriptor::LEN..]
                .chunks_exact(2)
                .take(count)
                .map(|w| u16::from_be_bytes([w[0], w[1]]))
                .collect();
            slots.push(ChipSlot {
                position,
                descriptor,
                words,
            });
        }

        Some(LayerPayload {
            header,
            slots,
            num_slots,
            len_mismatch: dat.len() != Self::LEN,
        })
    }
}

/// Per-event words between the last layer frame and the event foot.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct EventTrailer {
    /// Cherenkov detector flag word, only present when cherenkov readout is enabled.
    pub cherenkov: Option<u16>,
    pub event_time: u32,
}

impl EventTrailer {
    pub const TIME_LEN: usize = 4;
    pub const CHERENKOV_LEN: usize = 2;

    /// Trailer length for the given cherenkov mode.
    #[must_use]
    pub fn len(cherenkov: bool) -> usize {
        if cherenkov {
            Self::TIME_LEN + Self::CHERENKOV_LEN
        } else {
            Self::TIME_LEN
        }
    }

    /// Decode the trailer from the end of an event payload, or `None` if the payload is
    /// too short.
    #[must_use]
    pub fn decode(payload: &[u8], cherenkov: bool) -> Option<Self> {
        let len = Self::len(cherenkov);
        if payload.len() < len {
            return None;
        }
        let dat = &payload[payload.len() - len..];
        let (flag, time) = dat.split_at(len - Self::TIME_LEN);
        Some(EventTrailer {
            cherenkov: cherenkov.then(|| u16::from_be_bytes([flag[0], flag[1]])),
            event_time: u32::from_be_bytes([time[0], time[1], time[2], time[3]]),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut dat = Vec::with_capacity(Self::len(self.cherenkov.is_some()));
        if let Some(flag) = self.cherenkov {
            dat.extend_from_slice(&flag.to_be_bytes());
        }
        dat.extend_from_slice(&self.event_time.to_be_bytes());
        dat
    }
}
