//! Marker delimited frame scanning.
//!
//! HBU readout streams carry no length fields. Frames are bounded only by fixed head and
//! foot marker sequences at two levels: events, and layers nested within events.
//!
mod bytes;
mod scanner;

pub use bytes::*;
pub use scanner::*;

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Optional marker preceding the first event of a data file.
pub const FILE_HEAD: [u8; 10] = [0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xaa, 0xaa];
/// Start of an event frame.
pub const EVENT_HEAD: [u8; 4] = [0xfb, 0xee, 0xfb, 0xee];
/// End of an event frame.
pub const EVENT_FOOT: [u8; 4] = [0xfe, 0xdd, 0xfe, 0xdd];
/// Start of a layer frame.
pub const LAYER_HEAD: [u8; 4] = [0xfa, 0x5a, 0xfa, 0x5a];
/// End of a layer frame nested in an event frame.
pub const LAYER_FOOT: [u8; 4] = [0xfe, 0xee, 0xfe, 0xee];

/// Head and foot marker pair bounding one level of frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FrameMarkers {
    pub head: Vec<u8>,
    pub foot: Vec<u8>,
}

impl FrameMarkers {
    /// Create a marker pair.
    ///
    /// # Errors
    /// [Error::InvalidMarker] if either marker is empty or they are identical, in which
    /// case a foot could never be distinguished from the next head.
    pub fn new(head: &[u8], foot: &[u8]) -> Result<Self> {
        if head.is_empty() || foot.is_empty() {
            return Err(Error::InvalidMarker("markers must not be empty".into()));
        }
        if head == foot {
            return Err(Error::InvalidMarker(format!(
                "head and foot are identical: {head:02x?}"
            )));
        }
        Ok(FrameMarkers {
            head: head.to_vec(),
            foot: foot.to_vec(),
        })
    }

    /// Event level markers.
    #[must_use]
    pub fn event() -> Self {
        FrameMarkers {
            head: EVENT_HEAD.to_vec(),
            foot: EVENT_FOOT.to_vec(),
        }
    }

    /// Layer markers for layers nested in event frames.
    #[must_use]
    pub fn layer() -> Self {
        FrameMarkers {
            head: LAYER_HEAD.to_vec(),
            foot: LAYER_FOOT.to_vec(),
        }
    }

    /// Layer markers for legacy streams of bare layer packets, where the layer foot is
    /// the same sequence as [EVENT_FOOT].
    #[must_use]
    pub fn legacy_layer() -> Self {
        FrameMarkers {
            head: LAYER_HEAD.to_vec(),
            foot: EVENT_FOOT.to_vec(),
        }
    }

}

/// Location of one frame in the source stream.
///
/// The frame covers `[head_pos, foot_pos)`. `foot_pos` is `None` only for a frame
/// truncated by the end of the stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub head_pos: u64,
    pub foot_pos: Option<u64>,
    /// True when the frame's foot was not found before the next head or end-of-stream.
    pub abnormal: bool,
}

impl FrameInfo {
    /// Frame length in bytes, or `None` for truncated frames and frames whose foot lies
    /// before their head.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.foot_pos.and_then(|foot| foot.checked_sub(self.head_pos))
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.foot_pos.is_none()
    }

    /// This info with positions moved forward by `base`.
    #[must_use]
    pub fn shifted(&self, base: u64) -> Self {
        FrameInfo {
            head_pos: self.head_pos + base,
            foot_pos: self.foot_pos.map(|foot| foot + base),
            abnormal: self.abnormal,
        }
    }
}

/// A located frame and its bytes, head marker included.
///
/// For well-formed frames `data` ends with the foot marker. Abnormal frames end where the
/// next frame's head begins, or at end-of-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub info: FrameInfo,
    pub data: Vec<u8>,
}

impl Frame {
    /// Frame bytes without the head marker and, for well-formed frames, without the foot
    /// marker.
    #[must_use]
    pub fn payload(&self, markers: &FrameMarkers) -> &[u8] {
        let start = markers.head.len().min(self.data.len());
        let end = if self.info.abnormal {
            self.data.len()
        } else {
            self.data.len().saturating_sub(markers.foot.len()).max(start)
        };
        &self.data[start..end]
    }

    /// Offset in the source of the first payload byte.
    #[must_use]
    pub fn payload_offset(&self, markers: &FrameMarkers) -> u64 {
        self.info.head_pos + markers.head.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_must_differ() {
        assert!(FrameMarkers::new(&EVENT_HEAD, &EVENT_HEAD).is_err());
        assert!(FrameMarkers::new(&[], &EVENT_FOOT).is_err());
        assert_eq!(
            FrameMarkers::new(&EVENT_HEAD, &EVENT_FOOT).unwrap(),
            FrameMarkers::event()
        );
    }

    #[test]
    fn legacy_layer_shares_event_foot() {
        assert_eq!(FrameMarkers::legacy_layer().foot, FrameMarkers::event().foot);
        assert_ne!(FrameMarkers::layer().foot, FrameMarkers::event().foot);
    }

    #[test]
    fn frame_payload_strips_markers() {
        let markers = FrameMarkers::event();
        let mut data = EVENT_HEAD.to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        data.extend_from_slice(&EVENT_FOOT);
        let frame = Frame {
            info: FrameInfo {
                head_pos: 10,
                foot_pos: Some(21),
                abnormal: false,
            },
            data,
        };
        assert_eq!(frame.payload(&markers), [1, 2, 3]);
        assert_eq!(frame.payload_offset(&markers), 14);
        assert_eq!(frame.info.len(), Some(11));
    }

    #[test]
    fn abnormal_frame_payload_keeps_tail() {
        let markers = FrameMarkers::event();
        let mut data = EVENT_HEAD.to_vec();
        data.extend_from_slice(&[1, 2, 3, 4, 5]);
        let frame = Frame {
            info: FrameInfo {
                head_pos: 0,
                foot_pos: None,
                abnormal: true,
            },
            data,
        };
        assert_eq!(frame.payload(&markers), [1, 2, 3, 4, 5]);
        assert!(frame.info.is_truncated());
        assert_eq!(frame.info.len(), None);
    }

    #[test]
    fn inverted_info_has_no_len() {
        let info = FrameInfo {
            head_pos: 10,
            foot_pos: Some(5),
            abnormal: false,
        };
        assert_eq!(info.len(), None);
        assert!(!info.is_truncated());
    }

    #[test]
    fn shifted_info() {
        let info = FrameInfo {
            head_pos: 2,
            foot_pos: Some(8),
            abnormal: false,
        };
        let moved = info.shifted(100);
        assert_eq!(moved.head_pos, 102);
        assert_eq!(moved.foot_pos, Some(108));
    }
}
