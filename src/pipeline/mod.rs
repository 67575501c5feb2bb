//! Decoding of complete readout streams into [EventRecord]s.
//!
//! [DecodePipeline] drives the frame scanner, chip record assembler, and chip decoder
//! over a single stream and yields one record per event in stream order. [decode] runs
//! a pipeline over a file and writes the records and a [Summary] to an output directory.
//!
mod sink;

pub use sink::*;

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, span, trace, warn, Level};
use typed_builder::TypedBuilder;

use crate::framing::{
    scan_nested, Frame, FrameMarkers, FrameScanner, ScanStats, DEFAULT_CHUNK_SIZE, FILE_HEAD,
};
use crate::prelude::*;
use crate::readout::{
    record_chip_id, CellId, ChipBufferAssembler, ChipDecoder, ChipFragment, DecodedHit,
    LayerHeader, LayerPayload, CHIP_RECORD_WORDS, LAYER_NO,
};

/// How events are delimited in a stream.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamLayout {
    /// Layer frames nested in event frames.
    #[default]
    Events,
    /// Bare layer frames ending with the event foot marker. Consecutive layers with the
    /// same cycle and trigger id form an event.
    Layers,
}

/// Options controlling decoding.
#[derive(TypedBuilder, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DecodeOpts {
    #[builder(default)]
    pub auto_gain: bool,
    #[builder(default)]
    pub cherenkov: bool,
    /// Bytes requested from the source per read.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
    #[builder(default)]
    pub layout: StreamLayout,
    /// Run number attached to every record. When not set, [decode] derives it from the
    /// input file name.
    #[builder(default, setter(strip_option))]
    pub run_no: Option<u32>,
}

impl Default for DecodeOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Data consistency problems found while decoding an event. None of these prevent the
/// event from being produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQuality {
    /// A layer frame without a foot.
    AbnormalLayer { head_pos: u64 },
    /// A layer frame whose payload is shorter or longer than `expected`. A missing layer
    /// foot usually leaves a long layer holding the event trailer.
    LayerLength {
        head_pos: u64,
        expected: usize,
        len: usize,
    },
    /// A layer header naming a layer outside of the detector. The layer is skipped.
    LayerOutOfRange { head_pos: u64, layer: u8 },
    /// A chip id that does not match the slot the data arrived in.
    ChipMismatch { layer: usize, chip: usize, found: u8 },
    /// A chip slot claiming more words than a chip record holds.
    FragmentLength { layer: usize, chip: usize, count: u8 },
    /// The same channel and memory bank decoded more than once in one event.
    CellIdCollision { cell_id: CellId, memory_bank: u8 },
    /// A well-formed event too short to hold its trailer.
    MissingTrailer { head_pos: u64 },
}

/// Decoded contents of one event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub run_no: u32,
    /// Cycle id from the first layer of the event.
    pub cycle_id: u16,
    /// Trigger id from the first layer of the event.
    pub trigger_id: u16,
    /// Zero for abnormal events and events without a trailer.
    pub event_time: u32,
    pub cherenkov: Option<u16>,
    /// Stream offset of the event head marker, or of the first layer for layer streams.
    pub head_pos: u64,
    pub abnormal: bool,
    /// Number of layers decoded.
    pub layers: usize,
    pub hits: Vec<DecodedHit>,
    pub warnings: Vec<DataQuality>,
}

impl EventRecord {
    fn new(run_no: u32, head_pos: u64, abnormal: bool) -> Self {
        EventRecord {
            run_no,
            cycle_id: 0,
            trigger_id: 0,
            event_time: 0,
            cherenkov: None,
            head_pos,
            abnormal,
            layers: 0,
            hits: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Counters for a decoded stream.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub run_no: u32,
    /// True if the stream starts with the file header marker.
    pub file_header: bool,
    /// Top level frames, i.e., events or, for layer streams, layers.
    pub scan: ScanStats,
    /// Layer frames nested in events, accumulated over all events. Always empty for layer
    /// streams, where layers are counted in `scan`.
    pub layer_scan: ScanStats,
    pub layers: usize,
    pub abnormal_layers: usize,
    pub events: usize,
    pub chip_records: usize,
    pub hits: usize,
    /// Partial chip records left over at the end of the stream.
    pub dangling_buffers: usize,
    pub warnings: usize,
}

/// Extract a run number from a file name of the form `..run<digits>..`, e.g.,
/// `hbu_run0123_20240101.dat`. A `_` or `-` may separate `run` from the digits.
#[must_use]
pub fn run_number_from_path(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    let mut rest = name.as_str();
    while let Some(idx) = rest.find("run") {
        rest = &rest[idx + 3..];
        let candidate = rest.trim_start_matches(|c: char| c == '_' || c == '-');
        let digits: String = candidate.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(num) = digits.parse() {
            return Some(num);
        }
    }
    None
}

/// Decodes a readout stream into [EventRecord]s.
///
/// Records are produced in stream order by iterating. Once iteration ends the [Summary]
/// is complete, including the number of chip records left incomplete.
///
/// ## Errors
/// An I/O error is produced once, after which iteration ends.
pub struct DecodePipeline<R>
where
    R: Read,
{
    scanner: FrameScanner<R>,
    opts: DecodeOpts,
    decoder: ChipDecoder,
    assembler: ChipBufferAssembler,
    summary: Summary,
    // Layer frame read ahead that belongs to the next event of a layer stream.
    pending: Option<Frame>,
    done: bool,
    finished: bool,
}

impl DecodePipeline<File> {
    /// Open `path` for decoding. The run number is derived from the file name unless set
    /// in `opts`, and the file header is checked.
    ///
    /// # Errors
    /// If the file cannot be opened or read.
    pub fn open(path: &Path, mut opts: DecodeOpts) -> Result<Self> {
        if opts.run_no.is_none() {
            opts.run_no = run_number_from_path(path);
        }
        let mut pipeline = DecodePipeline::new(File::open(path)?, opts);
        pipeline.has_file_header()?;
        Ok(pipeline)
    }
}

impl<R> DecodePipeline<R>
where
    R: Read,
{
    pub fn new(reader: R, opts: DecodeOpts) -> Self {
        let markers = match opts.layout {
            StreamLayout::Events => FrameMarkers::event(),
            StreamLayout::Layers => FrameMarkers::legacy_layer(),
        };
        let decoder = ChipDecoder::builder()
            .auto_gain(opts.auto_gain)
            .cherenkov(opts.cherenkov)
            .build();
        let summary = Summary {
            run_no: opts.run_no.unwrap_or_default(),
            ..Summary::default()
        };
        DecodePipeline {
            scanner: FrameScanner::with_chunk_size(reader, markers, opts.chunk_size),
            opts,
            decoder,
            assembler: ChipBufferAssembler::new(),
            summary,
            pending: None,
            done: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn opts(&self) -> &DecodeOpts {
        &self.opts
    }

    /// Counters so far. Dangling buffers are only counted once iteration has ended or
    /// [DecodePipeline::finish] was called.
    #[must_use]
    pub fn summary(&self) -> Summary {
        Summary {
            scan: *self.scanner.stats(),
            ..self.summary.clone()
        }
    }

    /// Stop decoding, reporting any partial chip records as dangling, and return the
    /// final counters.
    pub fn finish(&mut self) -> Summary {
        if !self.finished {
            self.finished = true;
            self.done = true;
            let dangling = self.assembler.drain_incomplete().len();
            if dangling > 0 {
                warn!(dangling, "chip records incomplete at end of stream");
            }
            self.summary.dangling_buffers += dangling;
            let summary = self.summary();
            debug!(
                events = summary.events,
                frames = summary.scan.frames,
                abnormal = summary.scan.abnormal,
                hits = summary.hits,
                "decode finished"
            );
        }
        self.summary()
    }

    fn run_no(&self) -> u32 {
        self.summary.run_no
    }

    // Decode one layer frame into `record`.
    fn add_layer(
        &mut self,
        frame: &Frame,
        markers: &FrameMarkers,
        record: &mut EventRecord,
        seen: &mut HashSet<(CellId, u8)>,
    ) -> Result<()> {
        let head_pos = frame.info.head_pos;
        self.summary.layers += 1;
        if frame.info.abnormal {
            self.summary.abnormal_layers += 1;
            record.warnings.push(DataQuality::AbnormalLayer { head_pos });
        }

        let dat = frame.payload(markers);
        let length = DataQuality::LayerLength {
            head_pos,
            expected: LayerPayload::LEN,
            len: dat.len(),
        };
        let Some(payload) = LayerPayload::decode(dat) else {
            record.warnings.push(length);
            return Ok(());
        };
        if payload.len_mismatch {
            record.warnings.push(length);
        }
        let layer = usize::from(payload.header.layer);
        if layer >= LAYER_NO {
            record.warnings.push(DataQuality::LayerOutOfRange {
                head_pos,
                layer: payload.header.layer,
            });
            return Ok(());
        }
        if record.layers == 0 {
            record.cycle_id = payload.header.cycle_id;
            record.trigger_id = payload.header.trigger_id;
        }
        record.layers += 1;
        trace!(layer, slots = payload.slots.len(), "layer");

        for slot in payload.slots {
            let chip = slot.position;
            if usize::from(slot.descriptor.chip) != chip {
                record.warnings.push(DataQuality::ChipMismatch {
                    layer,
                    chip,
                    found: slot.descriptor.chip,
                });
            }
            if usize::from(slot.descriptor.count) > CHIP_RECORD_WORDS {
                record.warnings.push(DataQuality::FragmentLength {
                    layer,
                    chip,
                    count: slot.descriptor.count,
                });
            }

            let complete = self.assembler.push(ChipFragment {
                layer,
                chip,
                bank: slot.descriptor.bank,
                words: slot.words,
            })?;
            for buffer in complete {
                self.summary.chip_records += 1;
                if let Some(found) = record_chip_id(&buffer.words) {
                    if usize::from(found) != chip {
                        record.warnings.push(DataQuality::ChipMismatch { layer, chip, found });
                    }
                }
                for hit in self.decoder.decode(&buffer) {
                    if !seen.insert((hit.cell_id, hit.memory_bank)) {
                        record.warnings.push(DataQuality::CellIdCollision {
                            cell_id: hit.cell_id,
                            memory_bank: hit.memory_bank,
                        });
                    }
                    record.hits.push(hit);
                }
            }
        }
        Ok(())
    }

    fn complete(&mut self, record: EventRecord) -> EventRecord {
        self.summary.events += 1;
        self.summary.hits += record.hits.len();
        self.summary.warnings += record.warnings.len();
        if !record.warnings.is_empty() {
            debug!(head_pos = record.head_pos, warnings = ?record.warnings, "event data quality");
        }
        record
    }

    fn decode_event(&mut self, frame: &Frame) -> Result<EventRecord> {
        let span = span!(Level::TRACE, "event", head_pos = frame.info.head_pos);
        let _guard = span.enter();

        let event_markers = self.scanner.markers().clone();
        let layer_markers = FrameMarkers::layer();
        let mut record = EventRecord::new(self.run_no(), frame.info.head_pos, frame.info.abnormal);

        let (layers, stats) = scan_nested(frame, &event_markers, &layer_markers)?;
        self.summary.layer_scan.merge(&stats);
        let mut seen = HashSet::new();
        for layer in &layers {
            self.add_layer(layer, &layer_markers, &mut record, &mut seen)?;
        }

        if !frame.info.abnormal {
            match self.decoder.decode_trailer(frame.payload(&event_markers)) {
                Some(trailer) => {
                    record.event_time = trailer.event_time;
                    record.cherenkov = trailer.cherenkov;
                }
                None => record.warnings.push(DataQuality::MissingTrailer {
                    head_pos: frame.info.head_pos,
                }),
            }
        }
        Ok(self.complete(record))
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.scanner.next_frame()
    }

    // Group consecutive layer frames with the same cycle and trigger id.
    fn decode_layer_group(&mut self, first: Frame) -> Result<EventRecord> {
        let key = |frame: &Frame, markers: &FrameMarkers| {
            LayerHeader::decode(frame.payload(markers)).map(|h| (h.cycle_id, h.trigger_id))
        };
        let markers = self.scanner.markers().clone();
        let group_key = key(&first, &markers);
        let mut frames = vec![first];
        if group_key.is_some() {
            while let Some(frame) = self.scanner.next_frame()? {
                if key(&frame, &markers) == group_key {
                    frames.push(frame);
                } else {
                    self.pending = Some(frame);
                    break;
                }
            }
        }

        let span = span!(Level::TRACE, "event", head_pos = frames[0].info.head_pos);
        let _guard = span.enter();
        let abnormal = frames.iter().any(|f| f.info.abnormal);
        let mut record = EventRecord::new(self.run_no(), frames[0].info.head_pos, abnormal);
        let mut seen = HashSet::new();
        for frame in &frames {
            self.add_layer(frame, &markers, &mut record, &mut seen)?;
        }
        Ok(self.complete(record))
    }

    fn next_record(&mut self) -> Result<Option<EventRecord>> {
        let Some(frame) = self.next_frame()? else {
            return Ok(None);
        };
        let record = match self.opts.layout {
            StreamLayout::Events => self.decode_event(&frame)?,
            StreamLayout::Layers => self.decode_layer_group(frame)?,
        };
        Ok(Some(record))
    }
}

impl<R> DecodePipeline<R>
where
    R: Read + Seek,
{
    /// Check for the file header marker at the start of the stream, without disturbing
    /// decoding.
    ///
    /// # Errors
    /// If the stream cannot be repositioned or read.
    pub fn has_file_header(&mut self) -> Result<bool> {
        let dat = self.scanner.seek_and_read(0, FILE_HEAD.len())?;
        let found = dat == FILE_HEAD;
        self.summary.file_header = found;
        Ok(found)
    }

    /// Restart decoding from the start of the stream. All counters and partial chip
    /// records are discarded.
    ///
    /// # Errors
    /// If the stream cannot be repositioned.
    pub fn reset(&mut self) -> Result<()> {
        self.scanner.reset()?;
        self.assembler.reset();
        self.summary = Summary {
            run_no: self.summary.run_no,
            file_header: self.summary.file_header,
            ..Summary::default()
        };
        self.pending = None;
        self.done = false;
        self.finished = false;
        Ok(())
    }
}

impl<R> Iterator for DecodePipeline<R>
where
    R: Read,
{
    type Item = Result<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
