use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use tracing::info;

use super::{DecodeOpts, DecodePipeline, EventRecord, Summary};
use crate::prelude::*;

/// Receives decoded events in stream order.
pub trait EventSink {
    /// # Errors
    /// If the event cannot be written.
    fn write_event(&mut self, record: &EventRecord) -> Result<()>;

    /// Called once after the last event.
    ///
    /// # Errors
    /// If buffered output cannot be written.
    fn finish(&mut self, _summary: &Summary) -> Result<()> {
        Ok(())
    }
}

impl EventSink for Vec<EventRecord> {
    fn write_event(&mut self, record: &EventRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Writes each event as a single line of JSON.
pub struct JsonLinesSink<W>
where
    W: Write,
{
    writer: W,
    count: usize,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Create, or truncate, the file at `path`.
    ///
    /// # Errors
    /// If the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W> JsonLinesSink<W>
where
    W: Write,
{
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer, count: 0 }
    }

    /// Number of events written.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> EventSink for JsonLinesSink<W>
where
    W: Write,
{
    fn write_event(&mut self, record: &EventRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    fn finish(&mut self, _summary: &Summary) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Hand every event of `pipeline` to `sink`, returning the final [Summary].
///
/// # Errors
/// The first error reading the stream or writing to the sink.
pub fn write_events<R, S>(pipeline: &mut DecodePipeline<R>, sink: &mut S) -> Result<Summary>
where
    R: Read,
    S: EventSink + ?Sized,
{
    for zult in pipeline.by_ref() {
        sink.write_event(&zult?)?;
    }
    let summary = pipeline.finish();
    sink.finish(&summary)?;
    Ok(summary)
}

/// Decode the readout file at `input`, writing `<stem>.jsonl` with one event per line and
/// `<stem>.summary.json` into `output_dir`.
///
/// Abnormal frames and data quality problems do not cause an error; they are flagged on
/// the records and counted in the summary.
///
/// # Errors
/// If the input cannot be read or the output cannot be written.
pub fn decode(
    input: &Path,
    output_dir: &Path,
    auto_gain: bool,
    cherenkov: bool,
) -> Result<Summary> {
    let opts = DecodeOpts::builder()
        .auto_gain(auto_gain)
        .cherenkov(cherenkov)
        .build();
    decode_with(input, output_dir, opts)
}

/// Like [decode], with full control over the options.
///
/// # Errors
/// If the input cannot be read or the output cannot be written.
pub fn decode_with(input: &Path, output_dir: &Path, opts: DecodeOpts) -> Result<Summary> {
    let stem = input
        .file_stem()
        .map_or_else(|| "events".to_string(), |s| s.to_string_lossy().into_owned());
    fs::create_dir_all(output_dir)?;

    let mut pipeline = DecodePipeline::open(input, opts)?;
    let mut sink = JsonLinesSink::create(&output_dir.join(format!("{stem}.jsonl")))?;
    let summary = write_events(&mut pipeline, &mut sink)?;

    let summary_path = output_dir.join(format!("{stem}.summary.json"));
    fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)?;
    info!(
        input = %input.display(),
        events = summary.events,
        abnormal = summary.scan.abnormal,
        dangling = summary.dangling_buffers,
        "decoded"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(head_pos: u64) -> EventRecord {
        EventRecord::new(1, head_pos, false)
    }

    #[test]
    fn json_lines() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.write_event(&record(0)).unwrap();
        sink.write_event(&record(100)).unwrap();
        sink.finish(&Summary::default()).unwrap();
        assert_eq!(sink.count(), 2);

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: EventRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second, record(100));
    }

    #[test]
    fn vec_sink_collects() {
        let mut sink: Vec<EventRecord> = Vec::new();
        sink.write_event(&record(7)).unwrap();
        assert_eq!(sink, vec![record(7)]);
    }
}
