use serde::{Deserialize, Serialize};
use tracing::debug;
use typed_builder::TypedBuilder;

use super::{cell_id, CellId, ChipBuffer, EventTrailer, CHANNEL_NO, CHIP_RECORD_WORDS};

const BCID_WORD: usize = 0;
const CHARGE_WORDS: usize = 1;
const TIME_WORDS: usize = CHARGE_WORDS + CHANNEL_NO;
const TRAILER_WORD: usize = CHIP_RECORD_WORDS - 1;

const ADC_MASK: u16 = 0x0fff;
const HIT_BIT: u16 = 1 << 12;
const GAIN_BIT: u16 = 1 << 13;

/// SPIROC amplifier gain branch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Gain {
    High,
    Low,
}

impl Gain {
    fn from_bit(word: u16) -> Self {
        if word & GAIN_BIT == 0 {
            Gain::Low
        } else {
            Gain::High
        }
    }
}

/// Readout of one channel from one chip record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DecodedHit {
    pub cell_id: CellId,
    pub memory_bank: u8,
    pub bcid: u16,
    pub hit_tag: bool,
    /// Gain bit of the charge word; set for high gain.
    pub gain_tag: bool,
    /// Gain bit of the time word.
    pub gain_tag_tdc: bool,
    pub high_gain_charge: u16,
    pub low_gain_charge: u16,
    /// TDC value, only available in auto-gain mode. Zero otherwise.
    pub hit_time: u16,
    /// Branch chosen by the chip in auto-gain mode. The other branch's charge is zero.
    pub selected_gain: Option<Gain>,
}

/// Chip id from the trailer word of a complete chip record.
#[must_use]
pub fn record_chip_id(words: &[u16]) -> Option<u8> {
    words.get(TRAILER_WORD).map(|w| (w & 0xf) as u8)
}

/// Decodes complete chip records into per-channel hits.
///
/// Decoding is a pure function of the record and the mode flags.
#[derive(TypedBuilder, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChipDecoder {
    /// Chips run in auto-gain mode: the charge word holds one gain branch selected by
    /// the chip and the time word holds the TDC.
    #[builder(default)]
    pub auto_gain: bool,
    /// Events carry a cherenkov flag word in their trailer.
    #[builder(default)]
    pub cherenkov: bool,
}

impl ChipDecoder {
    /// Decode a chip record into one hit per channel.
    ///
    /// Buffers that are not exactly one record long, or whose coordinates do not map to a
    /// channel, produce no hits.
    #[must_use]
    pub fn decode(&self, buffer: &ChipBuffer) -> Vec<DecodedHit> {
        if !buffer.is_complete() {
            debug!(
                layer = buffer.layer,
                chip = buffer.chip,
                words = buffer.words.len(),
                "skipping incomplete chip buffer"
            );
            return Vec::new();
        }
        let words = &buffer.words;
        let bcid = words[BCID_WORD] & ADC_MASK;

        (0..CHANNEL_NO)
            .filter_map(|channel| {
                let cell_id = cell_id(buffer.layer, buffer.chip, channel)?;
                let charge = words[CHARGE_WORDS + channel];
                let time = words[TIME_WORDS + channel];
                let gain = Gain::from_bit(charge);

                let (high_gain_charge, low_gain_charge, hit_time, selected_gain) =
                    if self.auto_gain {
                        let adc = charge & ADC_MASK;
                        match gain {
                            Gain::High => (adc, 0, time & ADC_MASK, Some(gain)),
                            Gain::Low => (0, adc, time & ADC_MASK, Some(gain)),
                        }
                    } else {
                        (charge & ADC_MASK, time & ADC_MASK, 0, None)
                    };

                Some(DecodedHit {
                    cell_id,
                    memory_bank: buffer.bank,
                    bcid,
                    hit_tag: charge & HIT_BIT != 0,
                    gain_tag: gain == Gain::High,
                    gain_tag_tdc: time & GAIN_BIT != 0,
                    high_gain_charge,
                    low_gain_charge,
                    hit_time,
                    selected_gain,
                })
            })
            .collect()
    }

    /// Parse the trailer at the end of a well-formed event payload.
    #[must_use]
    pub fn decode_trailer(&self, payload: &[u8]) -> Option<EventTrailer> {
        EventTrailer::decode(payload, self.cherenkov)
    }
}

/// Build a chip record from per-channel (charge, time) words.
///
/// # Panics
/// If `channels` does not have exactly [CHANNEL_NO] entries.
#[must_use]
pub fn encode_record(bcid: u16, chip: u8, channels: &[(u16, u16)]) -> Vec<u16> {
    assert_eq!(channels.len(), CHANNEL_NO, "one entry per channel required");
    let mut words = Vec::with_capacity(CHIP_RECORD_WORDS);
    words.push(bcid & ADC_MASK);
    words.extend(channels.iter().map(|(charge, _)| *charge));
    words.extend(channels.iter().map(|(_, time)| *time));
    words.push(u16::from(chip & 0xf));
    words
}
