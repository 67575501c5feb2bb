#![allow(dead_code)]

use std::path::{Path, PathBuf};

use hbu::framing::{EVENT_FOOT, EVENT_HEAD, LAYER_FOOT, LAYER_HEAD};
use hbu::readout::{encode_record, ChipSlot, EventTrailer, LayerHeader, CHANNEL_NO, CHIP_NO};

/// Bits 12 (hit) and 13 (gain) of a charge word.
pub const HIT: u16 = 1 << 12;
pub const HIGH_GAIN: u16 = 1 << 13;

pub fn write_stream(dir: &Path, name: &str, dat: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, dat).expect("failed to write stream");
    path
}

/// A chip record where channel `n` has charge ADC `base + n`, time ADC `1000 + base + n`,
/// the hit bit on even channels, and the gain bit on channels divisible by 3.
pub fn record(chip: u8, bcid: u16, base: u16) -> Vec<u16> {
    let channels: Vec<(u16, u16)> = (0..CHANNEL_NO as u16)
        .map(|n| {
            let mut charge = base + n;
            if n % 2 == 0 {
                charge |= HIT;
            }
            if n % 3 == 0 {
                charge |= HIGH_GAIN;
            }
            (charge, 1000 + base + n)
        })
        .collect();
    encode_record(bcid, chip, &channels)
}

/// A layer frame. `slots[i]` is `(bank, words)` for chip `i`; missing entries are empty.
pub fn layer_frame(header: LayerHeader, slots: &[(u8, Vec<u16>)], foot: &[u8]) -> Vec<u8> {
    let mut dat = LAYER_HEAD.to_vec();
    dat.extend(header.encode());
    for chip in 0..CHIP_NO {
        match slots.get(chip) {
            Some((bank, words)) => dat.extend(ChipSlot::encode(chip as u8, *bank, words)),
            None => dat.extend(ChipSlot::encode(chip as u8, 0, &[])),
        }
    }
    dat.extend_from_slice(foot);
    dat
}

/// A layer frame with a complete record for every chip in `bank`.
pub fn full_layer(layer: u8, cycle_id: u16, trigger_id: u16, bank: u8) -> Vec<u8> {
    let header = LayerHeader {
        layer,
        cycle_id,
        trigger_id,
    };
    let slots: Vec<(u8, Vec<u16>)> = (0..CHIP_NO as u8)
        .map(|chip| (bank, record(chip, 0x100 + u16::from(chip), 10 * u16::from(chip))))
        .collect();
    layer_frame(header, &slots, &LAYER_FOOT)
}

pub fn event_frame(layers: &[Vec<u8>], trailer: EventTrailer) -> Vec<u8> {
    let mut dat = EVENT_HEAD.to_vec();
    for layer in layers {
        dat.extend_from_slice(layer);
    }
    dat.extend(trailer.encode());
    dat.extend_from_slice(&EVENT_FOOT);
    dat
}

pub fn trailer(event_time: u32) -> EventTrailer {
    EventTrailer {
        cherenkov: None,
        event_time,
    }
}
