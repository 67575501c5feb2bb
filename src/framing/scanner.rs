use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::bytes::{ByteStreamReader, DEFAULT_CHUNK_SIZE};
use super::{Frame, FrameInfo, FrameMarkers};
use crate::prelude::*;

/// Index of the first occurrence of `pat` in `dat` at or after `from`.
pub(crate) fn find(dat: &[u8], pat: &[u8], from: usize) -> Option<usize> {
    if pat.is_empty() || from >= dat.len() {
        return None;
    }
    dat[from..]
        .windows(pat.len())
        .position(|w| w == pat)
        .map(|idx| idx + from)
}

/// Like [find], but only matches starting before `limit`.
fn find_before(dat: &[u8], pat: &[u8], from: usize, limit: usize) -> Option<usize> {
    let end = dat.len().min(limit + pat.len().saturating_sub(1));
    find(&dat[..end], pat, from)
}

/// Counters accumulated while scanning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// All frames produced, including abnormal frames.
    pub frames: usize,
    /// Frames whose foot was missing, including truncated frames.
    pub abnormal: usize,
    /// Frames cut off by the end of the stream.
    pub truncated: usize,
    /// Bytes not belonging to any frame.
    pub skipped_bytes: u64,
}

impl ScanStats {
    fn add(&mut self, info: &FrameInfo) {
        self.frames += 1;
        if info.abnormal {
            self.abnormal += 1;
        }
        if info.is_truncated() {
            self.truncated += 1;
        }
    }

    /// Accumulate the counts from `other`.
    pub fn merge(&mut self, other: &ScanStats) {
        self.frames += other.frames;
        self.abnormal += other.abnormal;
        self.truncated += other.truncated;
        self.skipped_bytes += other.skipped_bytes;
    }
}

/// FrameScanner locates frames bounded by a head and foot marker in a byte stream.
///
/// The stream is read in chunks into a rolling buffer that is trimmed as frames are
/// produced, so memory use is bounded by the distance between markers rather than the
/// size of the stream.
///
/// A frame whose foot is missing is still produced, flagged abnormal, and ends where the
/// next head begins. A genuine foot is always preferred unless another head starts
/// before it. If the stream ends before either is found the final frame is produced with
/// no foot position.
pub struct FrameScanner<R>
where
    R: Read,
{
    bytes: ByteStreamReader<R>,
    markers: FrameMarkers,
    stats: ScanStats,
}

impl<R> FrameScanner<R>
where
    R: Read,
{
    /// Creates a new ``FrameScanner`` reading [DEFAULT_CHUNK_SIZE] bytes at a time.
    pub fn new(reader: R, markers: FrameMarkers) -> Self {
        Self::with_chunk_size(reader, markers, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, markers: FrameMarkers, chunk_size: usize) -> Self {
        FrameScanner {
            bytes: ByteStreamReader::with_chunk_size(reader, chunk_size),
            markers,
            stats: ScanStats::default(),
        }
    }

    #[must_use]
    pub fn markers(&self) -> &FrameMarkers {
        &self.markers
    }

    #[must_use]
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    fn skip(&mut self, n: usize) {
        if n > 0 {
            trace!(offset = self.bytes.buffer_offset(), skipped = n, "skipped bytes");
            self.stats.skipped_bytes += n as u64;
        }
    }

    // Remove the first `end` bytes of the buffer as a frame. The buffer must start with
    // a head marker.
    fn take_frame(&mut self, end: usize, abnormal: bool, truncated: bool) -> Frame {
        let head_pos = self.bytes.buffer_offset();
        let data = self.bytes.buffer()[..end].to_vec();
        self.bytes.consume(end);

        let info = FrameInfo {
            head_pos,
            foot_pos: if truncated {
                None
            } else {
                Some(head_pos + end as u64)
            },
            abnormal,
        };
        self.stats.add(&info);
        if abnormal {
            debug!(head_pos, foot_pos = ?info.foot_pos, len = end, "abnormal frame");
        } else {
            trace!(head_pos, len = end, "frame");
        }
        Frame { info, data }
    }

    /// Scan the stream for the next frame.
    ///
    /// Returns `Ok(None)` once the stream is exhausted and no head marker remains.
    ///
    /// # Errors
    /// Any I/O error reading the underlying stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let head_len = self.markers.head.len();
        let foot_len = self.markers.foot.len();

        // Align the buffer to the next head, discarding anything before it.
        loop {
            if let Some(idx) = find(self.bytes.buffer(), &self.markers.head, 0) {
                let skipped = self.bytes.consume(idx);
                self.skip(skipped);
                break;
            }
            // Part of a head may be sitting at the end of the buffer
            let skipped = self.bytes.retain_tail(head_len.saturating_sub(1));
            self.skip(skipped);
            if !self.bytes.read_more()? {
                let skipped = self.bytes.consume(self.bytes.buffer().len());
                self.skip(skipped);
                return Ok(None);
            }
        }

        // Everything before these offsets has already been searched.
        let mut foot_from = head_len;
        let mut head_from = head_len;
        loop {
            let buf = self.bytes.buffer();
            let foot_idx = find(buf, &self.markers.foot, foot_from);
            let limit = foot_idx.unwrap_or(buf.len());
            let next_head_idx = find_before(buf, &self.markers.head, head_from, limit);

            if let Some(next_head) = next_head_idx {
                return Ok(Some(self.take_frame(next_head, true, false)));
            }
            if let Some(foot) = foot_idx {
                return Ok(Some(self.take_frame(foot + foot_len, false, false)));
            }

            // Back off so a marker split across reads is still matched
            foot_from = buf.len().saturating_sub(foot_len.saturating_sub(1)).max(head_len);
            head_from = buf.len().saturating_sub(head_len.saturating_sub(1)).max(head_len);

            if !self.bytes.read_more()? {
                let end = self.bytes.buffer().len();
                return Ok(Some(self.take_frame(end, true, true)));
            }
        }
    }
}

impl<R> FrameScanner<R>
where
    R: Read + Seek,
{
    /// Rewind to the start of the stream and clear statistics.
    ///
    /// # Errors
    /// If the stream cannot be repositioned.
    pub fn reset(&mut self) -> Result<()> {
        self.bytes.reset()?;
        self.stats = ScanStats::default();
        Ok(())
    }

    /// Rewind and scan the entire stream, returning the location of every frame.
    ///
    /// Scanning is a function of the stream contents only, so repeated calls produce
    /// identical results.
    ///
    /// # Errors
    /// Any I/O error reading the underlying stream.
    pub fn scan_all(&mut self) -> Result<Vec<FrameInfo>> {
        self.reset()?;
        let mut infos = Vec::new();
        while let Some(frame) = self.next_frame()? {
            infos.push(frame.info);
        }
        Ok(infos)
    }

    /// Read the bytes of a previously located frame directly from the stream. Truncated
    /// frames are read to the end of the stream. A frame whose foot does not follow its
    /// head has no bytes.
    ///
    /// # Errors
    /// If the stream cannot be repositioned or read.
    pub fn materialize(&mut self, info: &FrameInfo) -> Result<Vec<u8>> {
        let len = match info.foot_pos {
            Some(foot) if foot <= info.head_pos => return Ok(Vec::new()),
            Some(foot) => usize::try_from(foot - info.head_pos).unwrap_or(usize::MAX),
            None => usize::MAX,
        };
        self.bytes.seek_and_read(info.head_pos, len)
    }

    /// Read up to `length` bytes at `offset` without disturbing scanning.
    ///
    /// # Errors
    /// If the stream cannot be repositioned or read.
    pub fn seek_and_read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.bytes.seek_and_read(offset, length)
    }
}

impl<R> IntoIterator for FrameScanner<R>
where
    R: Read,
{
    type Item = Result<Frame>;
    type IntoIter = FrameIter<R>;

    fn into_iter(self) -> Self::IntoIter {
        FrameIter {
            scanner: self,
            done: false,
        }
    }
}

/// Iterates over the frames located by a [FrameScanner].
///
/// ## Errors
/// An I/O error is produced once, after which the iterator ends.
pub struct FrameIter<R>
where
    R: Read,
{
    scanner: FrameScanner<R>,
    done: bool,
}

impl<R> FrameIter<R>
where
    R: Read,
{
    #[must_use]
    pub fn stats(&self) -> &ScanStats {
        self.scanner.stats()
    }
}

impl<R> Iterator for FrameIter<R>
where
    R: Read,
{
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.scanner.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Creates an iterator over the frames in `reader` bounded by `markers`.
///
/// For more control, e.g., rescanning or reading statistics, see [FrameScanner].
pub fn scan_frames<'a, R>(
    reader: R,
    markers: FrameMarkers,
) -> impl Iterator<Item = Result<Frame>> + 'a
where
    R: Read + 'a,
{
    FrameScanner::new(reader, markers).into_iter()
}

/// Scan for frames bounded by `inner` within the payload of `outer`.
///
/// Frame positions are absolute stream offsets. Inner frames never extend past the
/// payload of `outer`, so a malformed inner frame cannot move the outer frame's
/// boundaries.
///
/// # Errors
/// Never in practice; the payload is already in memory.
pub fn scan_nested(
    outer: &Frame,
    outer_markers: &FrameMarkers,
    inner: &FrameMarkers,
) -> Result<(Vec<Frame>, ScanStats)> {
    let base = outer.payload_offset(outer_markers);
    let payload = outer.payload(outer_markers);
    let mut scanner = FrameScanner::with_chunk_size(payload, inner.clone(), payload.len());

    let mut frames = Vec::new();
    while let Some(mut frame) = scanner.next_frame()? {
        frame.info = frame.info.shifted(base);
        frames.push(frame);
    }
    Ok((frames, *scanner.stats()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::framing::{EVENT_FOOT, EVENT_HEAD, LAYER_FOOT, LAYER_HEAD};

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut dat = EVENT_HEAD.to_vec();
        dat.extend_from_slice(payload);
        dat.extend_from_slice(&EVENT_FOOT);
        dat
    }

    fn scan(dat: &[u8], chunk_size: usize) -> Vec<Frame> {
        FrameScanner::with_chunk_size(dat, FrameMarkers::event(), chunk_size)
            .into_iter()
            .map(|f| f.expect("scan should not fail"))
            .collect()
    }

    #[test]
    fn find_pattern() {
        let dat = [0, 1, 2, 3, 1, 2, 3];
        assert_eq!(find(&dat, &[1, 2], 0), Some(1));
        assert_eq!(find(&dat, &[1, 2], 2), Some(4));
        assert_eq!(find(&dat, &[1, 2], 7), None);
        assert_eq!(find(&dat, &[4], 0), None);
        assert_eq!(find(&dat[..1], &[0, 1], 0), None);
    }

    #[test]
    fn find_before_limit() {
        let dat = [9, 1, 2, 9, 1, 2];
        assert_eq!(find_before(&dat, &[1, 2], 0, 1), None);
        assert_eq!(find_before(&dat, &[1, 2], 0, 2), Some(1));
        assert_eq!(find_before(&dat, &[1, 2], 2, 4), None);
        assert_eq!(find_before(&dat, &[1, 2], 2, 5), Some(4));
    }

    #[test]
    fn three_zero_filled_frames_tile_stream() {
        let mut dat = Vec::new();
        for _ in 0..3 {
            dat.extend(frame_bytes(&[0u8; 360]));
        }

        let frames = scan(&dat, DEFAULT_CHUNK_SIZE);

        assert_eq!(frames.len(), 3);
        let mut expected_head = 0u64;
        for frame in &frames {
            assert!(!frame.info.abnormal);
            assert_eq!(frame.info.head_pos, expected_head);
            expected_head = frame.info.foot_pos.unwrap();
        }
        assert_eq!(expected_head, dat.len() as u64);
    }

    #[test]
    fn missing_foot_ends_at_next_head() {
        let mut dat = EVENT_HEAD.to_vec();
        dat.extend_from_slice(&[0xa0; 20]);
        let second_head = dat.len() as u64;
        dat.extend(frame_bytes(&[0xb0; 30]));

        let frames = scan(&dat, 16);

        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].info,
            FrameInfo {
                head_pos: 0,
                foot_pos: Some(second_head),
                abnormal: true
            }
        );
        assert_eq!(
            frames[1].info,
            FrameInfo {
                head_pos: second_head,
                foot_pos: Some(dat.len() as u64),
                abnormal: false
            }
        );
        assert_eq!(frames[0].data, dat[..second_head as usize]);
    }

    #[test]
    fn truncated_tail() {
        let mut dat = EVENT_HEAD.to_vec();
        dat.extend_from_slice(&[0x11; 50]);

        let frames = scan(&dat, 7);

        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].info,
            FrameInfo {
                head_pos: 0,
                foot_pos: None,
                abnormal: true
            }
        );
        assert_eq!(frames[0].data, dat);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut dat = vec![0x42; 13];
        dat.extend(frame_bytes(&[1, 2, 3]));
        dat.extend_from_slice(&[0x43; 5]);

        let mut scanner = FrameScanner::with_chunk_size(&dat[..], FrameMarkers::event(), 4);
        let frame = scanner.next_frame().unwrap().expect("expected a frame");
        assert_eq!(frame.info.head_pos, 13);
        assert!(scanner.next_frame().unwrap().is_none());
        assert_eq!(scanner.stats().skipped_bytes, 18);
        assert_eq!(scanner.stats().frames, 1);
    }

    #[test]
    fn empty_stream_has_no_frames() {
        assert!(scan(&[], 4).is_empty());
        // a partial head is not a frame
        assert!(scan(&EVENT_HEAD[..3], 4).is_empty());
    }

    #[test]
    fn foot_after_next_head_is_abnormal() {
        // HEAD A HEAD B FOOT where everything fits in one read
        let mut dat = EVENT_HEAD.to_vec();
        dat.extend_from_slice(&[1; 8]);
        dat.extend_from_slice(&EVENT_HEAD);
        dat.extend_from_slice(&[2; 8]);
        dat.extend_from_slice(&EVENT_FOOT);

        let frames = scan(&dat, 1024);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].info.abnormal);
        assert_eq!(frames[0].info.foot_pos, Some(12));
        assert!(!frames[1].info.abnormal);
        assert_eq!(frames[1].info.foot_pos, Some(dat.len() as u64));
    }

    #[test]
    fn stats_count_abnormal_and_truncated() {
        let mut dat = EVENT_HEAD.to_vec();
        dat.extend(frame_bytes(&[5; 10]));
        dat.extend_from_slice(&EVENT_HEAD);
        dat.extend_from_slice(&[6; 3]);

        let mut iter = FrameScanner::new(&dat[..], FrameMarkers::event()).into_iter();
        let frames: Vec<Frame> = iter.by_ref().map(Result::unwrap).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(iter.stats().frames, 3);
        assert_eq!(iter.stats().abnormal, 2);
        assert_eq!(iter.stats().truncated, 1);
    }

    #[test]
    fn scan_all_is_idempotent() {
        let mut dat = vec![0x77; 5];
        dat.extend(frame_bytes(&[0; 40]));
        dat.extend_from_slice(&EVENT_HEAD);
        dat.extend_from_slice(&[0; 9]);
        dat.extend(frame_bytes(&[3; 12]));

        let mut scanner = FrameScanner::with_chunk_size(Cursor::new(dat), FrameMarkers::event(), 8);
        let first = scanner.scan_all().unwrap();
        let second = scanner.scan_all().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn materialize_round_trip() {
        let mut dat = vec![0x01; 3];
        dat.extend(frame_bytes(&[9, 8, 7, 6]));
        dat.extend(frame_bytes(&[5, 4]));

        let mut scanner =
            FrameScanner::with_chunk_size(Cursor::new(dat.clone()), FrameMarkers::event(), 5);
        let infos = scanner.scan_all().unwrap();
        for info in infos {
            let got = scanner.materialize(&info).unwrap();
            let end = info.foot_pos.unwrap() as usize;
            assert_eq!(got, dat[info.head_pos as usize..end]);
        }
    }

    #[test]
    fn materialize_inverted_range_is_empty() {
        let dat = frame_bytes(&[1; 20]);
        let mut scanner = FrameScanner::new(Cursor::new(dat), FrameMarkers::event());
        for foot_pos in [Some(5), Some(10)] {
            let info = FrameInfo {
                head_pos: 10,
                foot_pos,
                abnormal: false,
            };
            assert!(scanner.materialize(&info).unwrap().is_empty());
        }
    }

    #[test]
    fn materialize_from_mid_stream_source() {
        let mut dat = vec![0x11; 3];
        dat.extend(frame_bytes(&[9, 9]));
        let mut cursor = Cursor::new(dat.clone());
        cursor.set_position(3);

        let mut scanner = FrameScanner::with_chunk_size(cursor, FrameMarkers::event(), 4);
        let frame = scanner.next_frame().unwrap().expect("expected a frame");
        assert_eq!(frame.info.head_pos, 0);
        assert_eq!(scanner.materialize(&frame.info).unwrap(), frame.data);
        assert_eq!(frame.data, dat[3..]);

        assert_eq!(scanner.scan_all().unwrap(), vec![frame.info]);
    }

    #[test]
    fn nested_layers_use_absolute_offsets() {
        let mut layer = LAYER_HEAD.to_vec();
        layer.extend_from_slice(&[0x33; 6]);
        layer.extend_from_slice(&LAYER_FOOT);

        let mut payload = layer.clone();
        // second layer loses its foot, then event trailer bytes follow
        payload.extend_from_slice(&LAYER_HEAD);
        payload.extend_from_slice(&[0x44; 4]);
        let mut dat = vec![0u8; 2];
        dat.extend(frame_bytes(&payload));

        let frames = scan(&dat, 64);
        assert_eq!(frames.len(), 1);
        let (layers, stats) =
            scan_nested(&frames[0], &FrameMarkers::event(), &FrameMarkers::layer()).unwrap();

        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].info.head_pos, 6);
        assert_eq!(layers[0].info.foot_pos, Some(6 + layer.len() as u64));
        assert!(!layers[0].info.abnormal);
        assert!(layers[1].info.abnormal);
        assert!(layers[1].info.is_truncated());
        assert_eq!(stats.abnormal, 1);
        // the outer frame is unaffected
        assert!(!frames[0].info.abnormal);
    }
}
